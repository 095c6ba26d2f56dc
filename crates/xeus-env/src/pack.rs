//! Packing the prefix and copying the kernel engine files.
//!
//! The packer is an external collaborator behind the [`Packer`] trait; its
//! output is opaque apart from the `empack_env_meta.json` descriptor, whose
//! `filename` entries name the bundle files it produced.

use log::{debug, info};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use crate::backend::tool_stdout;
use crate::error::{BuildError, IoContext, Result};
use crate::filter::FileFilter;
use crate::progress::{BuildPhase, ProgressHandler};
use crate::staging::StagingPrefix;

/// Bundle metadata written by the packer.
pub const ENV_META_FILE: &str = "empack_env_meta.json";

/// Engine script and binary image copied from `<prefix>/bin`.
pub const RUNTIME_FILES: &[&str] = &["xpython_wasm.js", "xpython_wasm.wasm"];

/// Where the bundle is mounted inside the runtime.
pub const RELOCATE_PREFIX: &str = "/";

/// Arguments to one packer run.
#[derive(Debug, Clone)]
pub struct PackRequest<'a> {
    pub prefix: &'a Path,
    pub relocate_prefix: &'a str,
    pub outdir: &'a Path,
    pub filter: &'a FileFilter,
    /// Scratch directory for files the packer needs (e.g. the filter config).
    pub work_dir: &'a Path,
    pub use_cache: bool,
}

/// Serializes a prefix into bundle files.
pub trait Packer {
    fn pack(&self, request: &PackRequest<'_>) -> impl Future<Output = Result<()>> + Send;
}

/// The `empack` command line.
#[derive(Debug, Clone)]
pub struct EmpackCli {
    pub program: PathBuf,
}

impl Default for EmpackCli {
    fn default() -> Self {
        Self {
            program: PathBuf::from("empack"),
        }
    }
}

impl EmpackCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn args(request: &PackRequest<'_>, config: &Path) -> Vec<String> {
        vec![
            "pack".to_string(),
            "env".to_string(),
            "--env-prefix".to_string(),
            request.prefix.to_string_lossy().to_string(),
            "--relocate-prefix".to_string(),
            request.relocate_prefix.to_string(),
            "--outdir".to_string(),
            request.outdir.to_string_lossy().to_string(),
            "--config".to_string(),
            config.to_string_lossy().to_string(),
            if request.use_cache {
                "--use-cache".to_string()
            } else {
                "--no-use-cache".to_string()
            },
        ]
    }
}

impl Packer for EmpackCli {
    async fn pack(&self, request: &PackRequest<'_>) -> Result<()> {
        let yaml = request
            .filter
            .to_yaml()
            .map_err(|reason| BuildError::InvalidConfig {
                path: request.work_dir.join("empack_config.yaml"),
                reason,
            })?;

        tokio::fs::create_dir_all(request.work_dir)
            .await
            .io_context(|| format!("creating {:?}", request.work_dir))?;
        let config = request.work_dir.join("empack_config.yaml");
        tokio::fs::write(&config, yaml)
            .await
            .io_context(|| format!("writing {:?}", config))?;

        let args = Self::args(request, &config);
        debug!("Running {:?} {}", self.program, args.join(" "));

        let status = tokio::process::Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(tool_stdout())
            .status()
            .await
            .io_context(|| format!("running {:?}", self.program))?;

        if !status.success() {
            return Err(BuildError::exit_status("empack", status));
        }
        Ok(())
    }
}

/// Every string stored under a `filename` key, at any depth.
fn referenced_filenames(meta: &serde_json::Value, found: &mut Vec<String>) {
    match meta {
        serde_json::Value::Object(map) => {
            for (key, value) in map {
                match value {
                    serde_json::Value::String(s) if key == "filename" => found.push(s.clone()),
                    other => referenced_filenames(other, found),
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                referenced_filenames(item, found);
            }
        }
        _ => {}
    }
}

/// Bundle files listed by the metadata in `outdir`, metadata first.
///
/// Only plain file names are accepted so that a stale or hostile descriptor
/// cannot point outside `outdir`.
async fn bundle_files(outdir: &Path) -> Result<Option<Vec<PathBuf>>> {
    let meta_path = outdir.join(ENV_META_FILE);
    if !meta_path.exists() {
        return Ok(None);
    }

    let content = tokio::fs::read_to_string(&meta_path)
        .await
        .io_context(|| format!("reading {:?}", meta_path))?;

    let mut names = Vec::new();
    if let Ok(meta) = serde_json::from_str::<serde_json::Value>(&content) {
        referenced_filenames(&meta, &mut names);
    }

    let mut files = vec![meta_path];
    for name in names {
        let is_plain = Path::new(&name)
            .file_name()
            .map(|f| f == name.as_str())
            .unwrap_or(false);
        if !is_plain {
            continue;
        }
        let path = outdir.join(&name);
        if !files.contains(&path) {
            files.push(path);
        }
    }
    Ok(Some(files))
}

/// Remove the bundle left in `outdir` by a previous run.
pub async fn remove_previous_bundle(outdir: &Path) -> Result<()> {
    let Some(files) = bundle_files(outdir).await? else {
        return Ok(());
    };
    for file in files {
        if file.is_file() {
            debug!("Removing previous bundle file {:?}", file);
            tokio::fs::remove_file(&file)
                .await
                .io_context(|| format!("removing {:?}", file))?;
        }
    }
    Ok(())
}

/// Pack the staging prefix into `outdir` and return the produced files.
pub async fn pack_environment<P: Packer>(
    packer: &P,
    staging: &StagingPrefix,
    filter: &FileFilter,
    outdir: &Path,
    handler: &dyn ProgressHandler,
) -> Result<Vec<PathBuf>> {
    let prefix = staging.prefix();
    handler.on_progress(BuildPhase::Packing {
        prefix: prefix.to_string_lossy().to_string(),
    });

    remove_previous_bundle(outdir).await?;

    packer
        .pack(&PackRequest {
            prefix: &prefix,
            relocate_prefix: RELOCATE_PREFIX,
            outdir,
            filter,
            work_dir: &staging.work_dir(),
            use_cache: false,
        })
        .await?;

    let files = bundle_files(outdir)
        .await?
        .ok_or_else(|| BuildError::MissingArtifact {
            path: outdir.join(ENV_META_FILE),
        })?;

    handler.on_progress(BuildPhase::PackComplete {
        file_count: files.len(),
    });
    Ok(files)
}

/// Copy the engine script and binary from `<prefix>/bin` into `outdir`.
pub async fn copy_runtime_files(staging: &StagingPrefix, outdir: &Path) -> Result<Vec<PathBuf>> {
    let bin_dir = staging.bin_dir();

    // Check everything first so a missing binary does not leave half a copy.
    for file in RUNTIME_FILES {
        let source = bin_dir.join(file);
        if !source.is_file() {
            return Err(BuildError::MissingArtifact { path: source });
        }
    }

    let mut copied = Vec::new();
    for file in RUNTIME_FILES {
        let source = bin_dir.join(file);
        let destination = outdir.join(file);
        tokio::fs::copy(&source, &destination)
            .await
            .io_context(|| format!("copying {:?} to {:?}", source, destination))?;
        info!("Copied {}", file);
        copied.push(destination);
    }
    Ok(copied)
}
