//! Environment specification merging.
//!
//! Combines the base xeus-python specifiers, caller-supplied packages and an
//! optional conda `environment.yml` into a single [`EnvironmentSpec`].
//! Conda dependencies are deduplicated verbatim (first occurrence wins) and
//! channels are appended only when not already present. Entries under a
//! `pip:` mapping are collected separately for the pure-Python relocation
//! step.

use log::{debug, warn};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{BuildError, Result};

/// Python version targeted by the emscripten environment.
pub const PYTHON_VERSION: &str = "3.11";

/// Default xeus-python release pinned in the base specifiers.
pub const XEUS_PYTHON_VERSION: &str = "0.15.10";

/// Default environment name under `<root>/envs/`.
pub const DEFAULT_ENV_NAME: &str = "xeus-python-kernel";

/// Channels searched when the environment file does not add any.
pub const DEFAULT_CHANNELS: &[&str] = &["https://repo.mamba.pm/emscripten-forge", "conda-forge"];

/// A dependency listed under `pip:` in the environment file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipSpecifier {
    /// Package name/constraint, or an absolute path for local packages.
    pub value: String,
    /// Whether `value` points at a local package directory.
    pub is_local_path: bool,
}

/// Fully merged description of the environment to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentSpec {
    pub name: String,
    pub specifiers: Vec<String>,
    pub channels: Vec<String>,
    pub pip_specifiers: Vec<PipSpecifier>,
}

/// Inputs to [`resolve`].
#[derive(Debug, Clone)]
pub struct SpecRequest {
    pub python_version: String,
    /// Explicit xeus-python version. `None` pins [`XEUS_PYTHON_VERSION`].
    pub kernel_version: Option<String>,
    pub packages: Vec<String>,
    pub environment_file: Option<PathBuf>,
    pub env_name: String,
    /// Build even when nothing beyond the defaults was requested.
    pub force: bool,
}

impl Default for SpecRequest {
    fn default() -> Self {
        Self {
            python_version: PYTHON_VERSION.to_string(),
            kernel_version: None,
            packages: Vec::new(),
            environment_file: None,
            env_name: DEFAULT_ENV_NAME.to_string(),
            force: false,
        }
    }
}

/// Outcome of spec resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Build this environment.
    Build(EnvironmentSpec),
    /// Only defaults were requested and `force` was not set.
    NothingToDo,
}

// Raw YAML structure for parsing

#[derive(Debug, Default, Deserialize)]
struct RawEnvironmentYml {
    name: Option<String>,
    channels: Option<Vec<String>>,
    dependencies: Option<Vec<serde_yaml::Value>>,
}

/// Contents of an environment file, with pip paths already resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentFile {
    pub name: Option<String>,
    pub channels: Vec<String>,
    pub dependencies: Vec<String>,
    pub pip_dependencies: Vec<PipSpecifier>,
}

/// The base specifiers every environment starts from.
pub fn base_specifiers(python_version: &str, kernel_version: Option<&str>) -> Vec<String> {
    vec![
        format!("python={}", python_version),
        "xeus-lite".to_string(),
        format!("xeus-python={}", kernel_version.unwrap_or(XEUS_PYTHON_VERSION)),
    ]
}

/// Append `spec` unless the exact string is already present.
fn push_unique(specs: &mut Vec<String>, spec: &str) {
    if !specs.iter().any(|s| s == spec) {
        specs.push(spec.to_string());
    }
}

/// Parse a conda environment file.
///
/// `pip:` entries that name an existing directory relative to the file's own
/// directory are turned into absolute local paths; anything else is passed
/// to the installer as written. Several `pip:` mappings accumulate.
pub fn parse_environment_file(path: &Path) -> Result<EnvironmentFile> {
    let invalid = |reason: String| BuildError::InvalidEnvironmentFile {
        path: path.to_path_buf(),
        reason,
    };

    let content = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;

    let raw: RawEnvironmentYml = if content.trim().is_empty() {
        RawEnvironmentYml::default()
    } else {
        serde_yaml::from_str(&content).map_err(|e| invalid(e.to_string()))?
    };

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut dependencies = Vec::new();
    let mut pip_dependencies = Vec::new();

    for dep in raw.dependencies.unwrap_or_default() {
        match dep {
            serde_yaml::Value::String(s) => dependencies.push(s),
            serde_yaml::Value::Mapping(map) => {
                let Some(pip) = map.get(serde_yaml::Value::String("pip".to_string())) else {
                    debug!("Ignoring non-pip mapping in {:?}", path);
                    continue;
                };
                let serde_yaml::Value::Sequence(pip_list) = pip else {
                    return Err(invalid("`pip` must be a list".to_string()));
                };
                for pip_dep in pip_list {
                    if let serde_yaml::Value::String(s) = pip_dep {
                        pip_dependencies.push(resolve_pip_dependency(base_dir, s));
                    }
                }
            }
            other => debug!("Skipping unsupported dependency entry {:?}", other),
        }
    }

    Ok(EnvironmentFile {
        name: raw.name,
        channels: raw.channels.unwrap_or_default(),
        dependencies,
        pip_dependencies,
    })
}

/// Turn a `pip:` entry into a [`PipSpecifier`], resolving local directories
/// against `base_dir`.
fn resolve_pip_dependency(base_dir: &Path, dep: &str) -> PipSpecifier {
    let candidate = base_dir.join(dep);
    if candidate.is_dir() {
        let resolved = std::fs::canonicalize(&candidate).unwrap_or(candidate);
        PipSpecifier {
            value: resolved.to_string_lossy().to_string(),
            is_local_path: true,
        }
    } else {
        PipSpecifier {
            value: dep.to_string(),
            is_local_path: false,
        }
    }
}

/// Merge the base specifiers, extra packages and environment file.
///
/// Returns [`Resolution::NothingToDo`] when no extra packages, no explicit
/// kernel version and no environment file were supplied, unless
/// `request.force` is set. A given environment file that does not exist is
/// ignored with a warning.
pub fn resolve(request: &SpecRequest) -> Result<Resolution> {
    let mut specifiers =
        base_specifiers(&request.python_version, request.kernel_version.as_deref());
    let mut channels: Vec<String> = DEFAULT_CHANNELS.iter().map(|c| c.to_string()).collect();
    let mut pip_specifiers = Vec::new();
    let mut name = request.env_name.clone();

    for package in &request.packages {
        push_unique(&mut specifiers, package);
    }

    let mut nothing_to_do = request.packages.is_empty() && request.kernel_version.is_none();

    if let Some(ref path) = request.environment_file {
        if path.exists() {
            nothing_to_do = false;
            let env_file = parse_environment_file(path)?;

            if let Some(env_name) = env_file.name {
                name = env_name;
            }
            for channel in &env_file.channels {
                push_unique(&mut channels, channel);
            }
            for dep in &env_file.dependencies {
                push_unique(&mut specifiers, dep);
            }
            for pip_dep in env_file.pip_dependencies {
                if !pip_specifiers.contains(&pip_dep) {
                    pip_specifiers.push(pip_dep);
                }
            }
        } else {
            warn!("Environment file {:?} does not exist, ignoring it", path);
        }
    }

    if nothing_to_do && !request.force {
        return Ok(Resolution::NothingToDo);
    }

    Ok(Resolution::Build(EnvironmentSpec {
        name,
        specifiers,
        channels,
        pip_specifiers,
    }))
}
