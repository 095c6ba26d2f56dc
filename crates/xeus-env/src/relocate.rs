//! Relocation of pure-Python pip packages into the emscripten prefix.
//!
//! pip cannot install into a prefix whose Python differs from the host one,
//! so packages are installed with `--target` into a temporary directory and
//! then moved by hand. Each `*.dist-info/RECORD` drives the move:
//!
//! - entries starting with `../../` live outside site-packages (scripts,
//!   data files) and land directly under the prefix, minus that marker
//! - everything else lands under `lib/python<X.Y>/site-packages`
//!
//! The copied RECORD is rewritten for the extra directory level the
//! relocation introduces. Compiled artifacts built for the host cannot run
//! under the wasm target, so any of them rejects the whole batch before a
//! single file is copied.

use log::{debug, info, warn};
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use crate::backend::tool_stdout;
use crate::error::{BuildError, IoContext, Result};
use crate::progress::{BuildPhase, ProgressHandler};
use crate::spec::PipSpecifier;
use crate::staging::StagingPrefix;

/// RECORD prefix marking a file installed outside site-packages.
pub const PREFIX_MARKER: &str = "../../";

/// Replacement for [`PREFIX_MARKER`] once the package sits one level deeper.
pub const RELOCATED_PREFIX_MARKER: &str = "../../../";

/// File suffixes that mean the package is not pure Python.
pub const UNSUPPORTED_SUFFIXES: &[&str] = &[".so", ".a", ".dylib", ".lib", ".exe", ".dll"];

/// One file listed in an install record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub path: String,
    pub under_library_root: bool,
}

/// The files listed in one `RECORD`, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelocationManifest {
    pub entries: Vec<ManifestEntry>,
}

/// A single planned copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCopy {
    pub source: PathBuf,
    pub destination: PathBuf,
}

/// Whether a RECORD path belongs under site-packages.
pub fn belongs_under_library_root(path: &str) -> bool {
    !path.starts_with(PREFIX_MARKER)
}

/// Whether `path` has one of the [`UNSUPPORTED_SUFFIXES`].
pub fn is_compiled_artifact(path: &str) -> bool {
    Path::new(path)
        .extension()
        .map(|ext| {
            let suffix = format!(".{}", ext.to_string_lossy());
            UNSUPPORTED_SUFFIXES.contains(&suffix.as_str())
        })
        .unwrap_or(false)
}

/// First column of a CSV line, honoring double-quoted fields.
fn first_csv_field(line: &str) -> Option<String> {
    let line = line.trim_end_matches('\r');
    if line.is_empty() {
        return None;
    }

    let Some(rest) = line.strip_prefix('"') else {
        return line.split(',').next().map(str::to_string);
    };

    let mut field = String::new();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                field.push('"');
                chars.next();
            } else {
                break;
            }
        } else {
            field.push(c);
        }
    }
    Some(field)
}

/// Parse the text of a `RECORD` file.
pub fn parse_record(content: &str) -> RelocationManifest {
    let entries = content
        .lines()
        .filter_map(first_csv_field)
        .filter(|path| !path.is_empty())
        .map(|path| ManifestEntry {
            under_library_root: belongs_under_library_root(&path),
            path,
        })
        .collect();
    RelocationManifest { entries }
}

/// Rewrite `RECORD` text for the extra nesting level of the relocated tree.
pub fn rewrite_record(content: &str) -> String {
    content.replace(PREFIX_MARKER, RELOCATED_PREFIX_MARKER)
}

/// Path of `entry` relative to the install directory (and to its destination root).
fn relative_path(entry: &ManifestEntry) -> &str {
    if entry.under_library_root {
        &entry.path
    } else {
        entry
            .path
            .strip_prefix(PREFIX_MARKER)
            .unwrap_or(&entry.path)
    }
}

/// Whether `entry` stays below its destination root once joined.
pub fn is_contained(entry: &ManifestEntry) -> bool {
    Path::new(relative_path(entry))
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Destination of `entry` in the staging prefix.
pub fn destination(entry: &ManifestEntry, prefix: &Path, site_packages: &Path) -> PathBuf {
    let root = if entry.under_library_root {
        site_packages
    } else {
        prefix
    };
    root.join(relative_path(entry))
}

/// Compute every copy for `manifest` without touching the filesystem.
///
/// Fails with [`BuildError::UnsupportedArtifact`] on the first compiled file
/// and with [`BuildError::InvalidRecordEntry`] on the first entry that would
/// land outside the prefix.
pub fn plan_relocation(
    manifest: &RelocationManifest,
    install_dir: &Path,
    prefix: &Path,
    site_packages: &Path,
) -> Result<Vec<PlannedCopy>> {
    manifest
        .entries
        .iter()
        .map(|entry| {
            if is_compiled_artifact(&entry.path) {
                return Err(BuildError::UnsupportedArtifact {
                    path: PathBuf::from(&entry.path),
                });
            }
            if !is_contained(entry) {
                return Err(BuildError::InvalidRecordEntry {
                    path: entry.path.clone(),
                });
            }
            Ok(PlannedCopy {
                source: install_dir.join(relative_path(entry)),
                destination: destination(entry, prefix, site_packages),
            })
        })
        .collect()
}

/// Execute a copy plan, creating parent directories as needed.
pub async fn apply_plan(plan: &[PlannedCopy]) -> Result<()> {
    for copy in plan {
        if let Some(parent) = copy.destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .io_context(|| format!("creating {:?}", parent))?;
        }
        debug!("{:?} -> {:?}", copy.source, copy.destination);
        tokio::fs::copy(&copy.source, &copy.destination)
            .await
            .io_context(|| format!("copying {:?} to {:?}", copy.source, copy.destination))?;
    }
    Ok(())
}

/// What the host installer is asked to do.
#[derive(Debug, Clone)]
pub struct InstallRequest<'a> {
    pub specifiers: &'a [String],
    pub target: &'a Path,
    pub python_version: &'a str,
}

/// Installs packages for the host into a plain directory.
pub trait HostInstaller {
    /// Install exactly `request.specifiers` (no dependencies) into `request.target`.
    fn install(&self, request: &InstallRequest<'_>) -> impl Future<Output = Result<()>> + Send;
}

/// `python -m pip install --target`.
#[derive(Debug, Clone)]
pub struct PipInstaller {
    pub python: PathBuf,
}

impl Default for PipInstaller {
    fn default() -> Self {
        Self {
            python: PathBuf::from("python3"),
        }
    }
}

impl PipInstaller {
    pub fn new(python: impl Into<PathBuf>) -> Self {
        Self {
            python: python.into(),
        }
    }

    pub fn args(request: &InstallRequest<'_>) -> Vec<String> {
        let mut args = vec!["-m".to_string(), "pip".to_string(), "install".to_string()];
        args.extend(request.specifiers.iter().cloned());
        args.extend([
            "--target".to_string(),
            request.target.to_string_lossy().to_string(),
            "--python-version".to_string(),
            request.python_version.to_string(),
            "--no-deps".to_string(),
            "--no-input".to_string(),
            "--verbose".to_string(),
        ]);
        args
    }
}

impl HostInstaller for PipInstaller {
    async fn install(&self, request: &InstallRequest<'_>) -> Result<()> {
        let args = Self::args(request);
        debug!("Running {:?} {}", self.python, args.join(" "));

        let status = tokio::process::Command::new(&self.python)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(tool_stdout())
            .status()
            .await
            .io_context(|| format!("running {:?} -m pip", self.python))?;

        if !status.success() {
            return Err(BuildError::exit_status("pip", status));
        }
        Ok(())
    }
}

/// `*.dist-info` directories directly under `dir`, sorted by name.
async fn find_dist_infos(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .io_context(|| format!("reading {:?}", dir))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .io_context(|| format!("reading {:?}", dir))?
    {
        let path = entry.path();
        let is_dist_info = path
            .file_name()
            .map(|n| n.to_string_lossy().ends_with(".dist-info"))
            .unwrap_or(false);
        if is_dist_info && path.is_dir() {
            found.push(path);
        }
    }

    found.sort();
    Ok(found)
}

/// Install `pip_specifiers` with `installer` and relocate them into `staging`.
///
/// Returns the number of files copied.
pub async fn relocate<I: HostInstaller>(
    installer: &I,
    staging: &StagingPrefix,
    pip_specifiers: &[PipSpecifier],
    python_version: &str,
    handler: &dyn ProgressHandler,
) -> Result<usize> {
    if pip_specifiers.is_empty() {
        return Ok(0);
    }

    warn!(
        "Installing pip dependencies. This is experimental: only pure Python packages \
         are supported, and pip runs with --no-deps, so install their dependencies \
         from emscripten-forge or conda-forge."
    );

    let specifiers: Vec<String> = pip_specifiers.iter().map(|p| p.value.clone()).collect();
    handler.on_progress(BuildPhase::RelocatingPipPackages {
        packages: specifiers.clone(),
    });

    let install_dir =
        tempfile::TempDir::new().io_context(|| "creating pip install directory")?;

    installer
        .install(&InstallRequest {
            specifiers: &specifiers,
            target: install_dir.path(),
            python_version,
        })
        .await?;

    let prefix = staging.prefix();
    let site_packages = staging.site_packages(python_version);

    let mut records = Vec::new();
    let mut plan = Vec::new();
    for dist_info in find_dist_infos(install_dir.path()).await? {
        let record_path = dist_info.join("RECORD");
        let content = tokio::fs::read_to_string(&record_path)
            .await
            .io_context(|| format!("reading {:?}", record_path))?;

        let manifest = parse_record(&content);
        plan.extend(plan_relocation(
            &manifest,
            install_dir.path(),
            &prefix,
            &site_packages,
        )?);
        records.push((record_path, content));
    }

    for (record_path, content) in &records {
        tokio::fs::write(record_path, rewrite_record(content))
            .await
            .io_context(|| format!("writing {:?}", record_path))?;
    }

    apply_plan(&plan).await?;

    info!(
        "Relocated {} files from {} pip packages into {:?}",
        plan.len(),
        records.len(),
        prefix
    );
    Ok(plan.len())
}
