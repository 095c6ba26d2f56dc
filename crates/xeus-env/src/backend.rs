//! Environment-manager backends.
//!
//! Four ways of materializing an `emscripten-wasm32` prefix, tried in a fixed
//! order:
//!
//! 1. rattler, in process (when built with the `rattler` feature)
//! 2. `mamba` on PATH
//! 3. `micromamba` on PATH
//! 4. `conda` on PATH
//!
//! Probing happens once per run ([`Availability::probe`]); picking a backend
//! from the probe result is a pure function ([`select_backend`]).

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;

use crate::condarc::{install_platform_config, EnvOverride};
use crate::error::{BuildError, IoContext, Result};
use crate::progress::{BuildPhase, ProgressHandler};
use crate::spec::EnvironmentSpec;
use crate::staging::StagingPrefix;

/// Conda subdir of the emscripten target.
pub const PLATFORM: &str = "emscripten-wasm32";

/// Which backend the caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    /// First available in priority order.
    #[default]
    Auto,
    Rattler,
    Mamba,
    Micromamba,
    Conda,
}

impl std::fmt::Display for BackendChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendChoice::Auto => write!(f, "auto"),
            BackendChoice::Rattler => write!(f, "rattler"),
            BackendChoice::Mamba => write!(f, "mamba"),
            BackendChoice::Micromamba => write!(f, "micromamba"),
            BackendChoice::Conda => write!(f, "conda"),
        }
    }
}

impl FromStr for BackendChoice {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendChoice::Auto),
            "rattler" => Ok(BackendChoice::Rattler),
            "mamba" => Ok(BackendChoice::Mamba),
            "micromamba" => Ok(BackendChoice::Micromamba),
            "conda" => Ok(BackendChoice::Conda),
            other => Err(format!(
                "unknown backend {other:?} (expected auto, rattler, mamba, micromamba or conda)"
            )),
        }
    }
}

/// The backend selected for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// In-process solve and install via rattler.
    Rattler,
    /// `mamba` executable; two-step create/install with a `.condarc`.
    Mamba(PathBuf),
    /// `micromamba` executable; single `create` with `--platform`.
    Micromamba(PathBuf),
    /// `conda` executable; two-step create/install with a `.condarc`.
    Conda(PathBuf),
}

/// What the probe found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Availability {
    pub in_process: bool,
    pub mamba: Option<PathBuf>,
    pub micromamba: Option<PathBuf>,
    pub conda: Option<PathBuf>,
}

impl Availability {
    /// Check which backends can be used in this process.
    pub async fn probe() -> Self {
        let availability = Self {
            in_process: cfg!(feature = "rattler"),
            mamba: probe_tool("mamba").await,
            micromamba: probe_tool("micromamba").await,
            conda: probe_tool("conda").await,
        };
        debug!("Backend availability: {:?}", availability);
        availability
    }
}

/// Return `Some(name)` when `<name> --version` runs successfully.
async fn probe_tool(name: &str) -> Option<PathBuf> {
    let output = tokio::process::Command::new(name)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .await
        .ok()?;

    if output.status.success() {
        let version = String::from_utf8_lossy(&output.stdout);
        debug!(
            "Found {} ({})",
            name,
            version.lines().next().unwrap_or("unknown").trim()
        );
        Some(PathBuf::from(name))
    } else {
        None
    }
}

/// Pick the backend for this run.
pub fn select_backend(availability: &Availability, choice: BackendChoice) -> Result<Backend> {
    let rattler = availability.in_process.then_some(Backend::Rattler);
    let mamba = availability.mamba.clone().map(Backend::Mamba);
    let micromamba = availability.micromamba.clone().map(Backend::Micromamba);
    let conda = availability.conda.clone().map(Backend::Conda);

    let (selected, tried) = match choice {
        BackendChoice::Auto => (
            rattler.or(mamba).or(micromamba).or(conda),
            "rattler, mamba, micromamba, conda",
        ),
        BackendChoice::Rattler => (rattler, "rattler"),
        BackendChoice::Mamba => (mamba, "mamba"),
        BackendChoice::Micromamba => (micromamba, "micromamba"),
        BackendChoice::Conda => (conda, "conda"),
    };

    selected.ok_or_else(|| BuildError::BackendUnavailable {
        tried: tried.to_string(),
    })
}

/// `-c <channel>` for each channel, order preserved.
pub fn channel_args(channels: &[String]) -> Vec<String> {
    channels
        .iter()
        .flat_map(|c| ["-c".to_string(), c.clone()])
        .collect()
}

/// Arguments for the single-step micromamba invocation.
pub fn micromamba_create_args(staging: &StagingPrefix, spec: &EnvironmentSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--yes".to_string(),
        "--no-pyc".to_string(),
        "--root-prefix".to_string(),
        staging.root().to_string_lossy().to_string(),
        "--name".to_string(),
        staging.name().to_string(),
        format!("--platform={}", PLATFORM),
    ];
    args.extend(channel_args(&spec.channels));
    args.extend(spec.specifiers.iter().cloned());
    args
}

/// Arguments creating an empty prefix (first step of mamba/conda).
pub fn create_prefix_args(prefix: &Path, channels: &[String]) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--yes".to_string(),
        "--prefix".to_string(),
        prefix.to_string_lossy().to_string(),
    ];
    args.extend(channel_args(channels));
    args
}

/// Arguments installing the specifiers (second step of mamba/conda).
pub fn install_args(prefix: &Path, spec: &EnvironmentSpec) -> Vec<String> {
    let mut args = vec![
        "install".to_string(),
        "--yes".to_string(),
        "--prefix".to_string(),
        prefix.to_string_lossy().to_string(),
    ];
    args.extend(channel_args(&spec.channels));
    args.extend(spec.specifiers.iter().cloned());
    args
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Rattler => "rattler",
            Backend::Mamba(_) => "mamba",
            Backend::Micromamba(_) => "micromamba",
            Backend::Conda(_) => "conda",
        }
    }

    /// Create the environment described by `spec` at `staging.prefix()`.
    ///
    /// The two-step backends point `CONDARC` at a platform config through
    /// `condarc`; the caller owns the guard and decides when it is released.
    pub async fn create(
        &self,
        spec: &EnvironmentSpec,
        staging: &StagingPrefix,
        condarc: &EnvOverride,
        handler: Arc<dyn ProgressHandler>,
    ) -> Result<()> {
        handler.on_progress(BuildPhase::BackendSelected {
            backend: self.name().to_string(),
        });

        match self {
            Backend::Rattler => create_in_process(spec, staging, handler).await,
            Backend::Micromamba(tool) => {
                let args = micromamba_create_args(staging, spec);
                run_tool(self.name(), tool, &args, handler.as_ref()).await
            }
            Backend::Mamba(tool) => {
                // mamba refuses to create a prefix whose parent is missing
                let prefix = staging.prefix();
                tokio::fs::create_dir_all(&prefix)
                    .await
                    .io_context(|| format!("creating {:?}", prefix))?;
                self.create_with_config(tool, spec, staging, condarc, handler.as_ref())
                    .await
            }
            Backend::Conda(tool) => {
                self.create_with_config(tool, spec, staging, condarc, handler.as_ref())
                    .await
            }
        }
    }

    async fn create_with_config(
        &self,
        tool: &Path,
        spec: &EnvironmentSpec,
        staging: &StagingPrefix,
        condarc: &EnvOverride,
        handler: &dyn ProgressHandler,
    ) -> Result<()> {
        let prefix = staging.prefix();

        run_tool(
            self.name(),
            tool,
            &create_prefix_args(&prefix, &spec.channels),
            handler,
        )
        .await?;

        let config = install_platform_config(condarc, &prefix, PLATFORM)?;
        info!("Pinned subdir {} via {:?}", PLATFORM, config);

        run_tool(self.name(), tool, &install_args(&prefix, spec), handler).await
    }
}

#[cfg(feature = "rattler")]
async fn create_in_process(
    spec: &EnvironmentSpec,
    staging: &StagingPrefix,
    handler: Arc<dyn ProgressHandler>,
) -> Result<()> {
    crate::rattler_backend::create_environment(spec, staging, handler).await
}

#[cfg(not(feature = "rattler"))]
async fn create_in_process(
    _spec: &EnvironmentSpec,
    _staging: &StagingPrefix,
    _handler: Arc<dyn ProgressHandler>,
) -> Result<()> {
    Err(BuildError::BackendUnavailable {
        tried: "rattler".to_string(),
    })
}

/// Stdout for external tools. Their output goes to our stderr so that our
/// own stdout carries nothing but the build summary.
pub(crate) fn tool_stdout() -> Stdio {
    Stdio::from(std::io::stderr())
}

/// Run an external tool to completion; its stdout is sent to our stderr.
///
/// A non-zero exit becomes [`BuildError::BackendExecutionFailed`].
pub(crate) async fn run_tool(
    tool_name: &str,
    program: &Path,
    args: &[String],
    handler: &dyn ProgressHandler,
) -> Result<()> {
    handler.on_progress(BuildPhase::RunningCommand {
        tool: tool_name.to_string(),
        args: args.to_vec(),
    });

    let status = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(tool_stdout())
        .status()
        .await
        .io_context(|| format!("running {}", tool_name))?;

    if !status.success() {
        return Err(BuildError::exit_status(tool_name, status));
    }
    Ok(())
}
