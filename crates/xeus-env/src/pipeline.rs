//! The build, run top to bottom once per invocation.
//!
//! resolve → stage → create environment → relocate pip packages → pack →
//! copy engine files → (worker) → (lab extensions) → cleanup.
//!
//! External collaborators (host installer, packer, backend probe, progress
//! sink) are injectable so the whole run can be driven without network or
//! real package managers.

use log::{error, info, warn};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::backend::{select_backend, Availability, BackendChoice};
use crate::condarc::EnvOverride;
use crate::error::{IoContext, Result};
use crate::filter::FilterSource;
use crate::labextensions::copy_lab_extensions;
use crate::pack::{copy_runtime_files, pack_environment, EmpackCli, Packer};
use crate::progress::{BuildPhase, LogHandler, ProgressHandler};
use crate::relocate::{relocate, HostInstaller, PipInstaller};
use crate::spec::{
    resolve, EnvironmentSpec, Resolution, SpecRequest, DEFAULT_ENV_NAME, PYTHON_VERSION,
};
use crate::staging::StagingPrefix;
use crate::worker::install_worker;

/// Everything a caller can configure about a build.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub python_version: String,
    /// Explicit xeus-python version; counts as a request to build.
    pub kernel_version: Option<String>,
    pub packages: Vec<String>,
    pub environment_file: Option<PathBuf>,
    /// Staging root; the prefix lives at `<root>/envs/<name>`.
    pub root_prefix: PathBuf,
    pub env_name: String,
    pub filter: FilterSource,
    pub output_dir: PathBuf,
    pub build_worker: bool,
    /// Build even if only the defaults were requested.
    pub force: bool,
    pub backend: BackendChoice,
    pub keep_staging: bool,
    pub cleanup_on_failure: bool,
    /// Where to copy lab extensions found in the environment, if anywhere.
    pub labextensions_dir: Option<PathBuf>,
    /// Interpreter used to run pip for the host install.
    pub host_python: PathBuf,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            python_version: PYTHON_VERSION.to_string(),
            kernel_version: None,
            packages: Vec::new(),
            environment_file: None,
            root_prefix: std::env::temp_dir().join("xeus-python-kernel"),
            env_name: DEFAULT_ENV_NAME.to_string(),
            filter: FilterSource::Builtin,
            output_dir: PathBuf::from("."),
            build_worker: false,
            force: false,
            backend: BackendChoice::Auto,
            keep_staging: false,
            cleanup_on_failure: false,
            labextensions_dir: None,
            host_python: PathBuf::from("python3"),
        }
    }
}

impl BuildOptions {
    fn spec_request(&self) -> SpecRequest {
        SpecRequest {
            python_version: self.python_version.clone(),
            kernel_version: self.kernel_version.clone(),
            packages: self.packages.clone(),
            environment_file: self.environment_file.clone(),
            env_name: self.env_name.clone(),
            force: self.force,
        }
    }
}

/// Files produced by a successful build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildOutput {
    pub env_name: String,
    pub backend: String,
    /// Staging prefix the bundle was packed from. Removed after the run
    /// unless staging is kept.
    pub prefix: PathBuf,
    pub output_dir: PathBuf,
    pub bundle_files: Vec<PathBuf>,
    pub runtime_files: Vec<PathBuf>,
    pub relocated_files: usize,
    pub worker_entry: Option<PathBuf>,
    pub lab_extensions: Vec<PathBuf>,
}

/// Result of [`Pipeline::run`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BuildOutcome {
    /// Only defaults were requested; nothing was created.
    NothingToDo,
    Built(BuildOutput),
}

/// A configured build.
pub struct Pipeline<I = PipInstaller, P = EmpackCli> {
    options: BuildOptions,
    installer: I,
    packer: P,
    availability: Option<Availability>,
    handler: Arc<dyn ProgressHandler>,
}

impl Pipeline {
    /// A pipeline using pip, empack and the backends found on this machine.
    pub fn new(options: BuildOptions) -> Self {
        let installer = PipInstaller::new(options.host_python.clone());
        Self {
            options,
            installer,
            packer: EmpackCli::default(),
            availability: None,
            handler: Arc::new(LogHandler),
        }
    }
}

impl<I: HostInstaller, P: Packer> Pipeline<I, P> {
    pub fn with_installer<J: HostInstaller>(self, installer: J) -> Pipeline<J, P> {
        Pipeline {
            options: self.options,
            installer,
            packer: self.packer,
            availability: self.availability,
            handler: self.handler,
        }
    }

    pub fn with_packer<Q: Packer>(self, packer: Q) -> Pipeline<I, Q> {
        Pipeline {
            options: self.options,
            installer: self.installer,
            packer,
            availability: self.availability,
            handler: self.handler,
        }
    }

    /// Use a fixed backend availability instead of probing PATH.
    pub fn with_availability(mut self, availability: Availability) -> Self {
        self.availability = Some(availability);
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn ProgressHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    /// Run the build.
    pub async fn run(&self) -> Result<BuildOutcome> {
        let spec = match resolve(&self.options.spec_request())? {
            Resolution::NothingToDo => {
                info!("No extra packages or environment file requested, nothing to build");
                return Ok(BuildOutcome::NothingToDo);
            }
            Resolution::Build(spec) => spec,
        };

        self.handler.on_progress(BuildPhase::Resolved {
            env_name: spec.name.clone(),
            spec_count: spec.specifiers.len(),
            pip_count: spec.pip_specifiers.len(),
        });

        let staging = StagingPrefix::new(&self.options.root_prefix, &spec.name);

        match self.build(&spec, &staging).await {
            Ok(output) => {
                if !self.options.keep_staging {
                    staging.cleanup().await?;
                }
                self.handler.on_progress(BuildPhase::Ready {
                    output_dir: output.output_dir.to_string_lossy().to_string(),
                });
                Ok(BuildOutcome::Built(output))
            }
            Err(e) => {
                self.handler.on_progress(BuildPhase::Error {
                    message: e.to_string(),
                });
                if self.options.cleanup_on_failure {
                    if let Err(cleanup_err) = staging.cleanup().await {
                        warn!("Failed to clean up {:?}: {}", staging.root(), cleanup_err);
                    }
                } else {
                    error!("Build failed, staging left at {:?}", staging.prefix());
                }
                Err(e)
            }
        }
    }

    async fn build(&self, spec: &EnvironmentSpec, staging: &StagingPrefix) -> Result<BuildOutput> {
        let options = &self.options;

        // Held through packing; dropping it on any early return restores CONDARC.
        let mut condarc = EnvOverride::condarc();

        staging.prepare().await?;
        tokio::fs::create_dir_all(&options.output_dir)
            .await
            .io_context(|| format!("creating {:?}", options.output_dir))?;

        let availability = match &self.availability {
            Some(availability) => availability.clone(),
            None => Availability::probe().await,
        };
        let backend = select_backend(&availability, options.backend)?;
        backend
            .create(spec, staging, &condarc, self.handler.clone())
            .await?;

        let relocated_files = relocate(
            &self.installer,
            staging,
            &spec.pip_specifiers,
            &options.python_version,
            self.handler.as_ref(),
        )
        .await?;

        let filter = options.filter.resolve().await?;
        let bundle_files = pack_environment(
            &self.packer,
            staging,
            &filter,
            &options.output_dir,
            self.handler.as_ref(),
        )
        .await?;

        condarc.restore();

        self.handler.on_progress(BuildPhase::CopyingRuntime);
        let runtime_files = copy_runtime_files(staging, &options.output_dir).await?;

        let worker_entry = if options.build_worker {
            self.handler.on_progress(BuildPhase::PatchingWorker);
            Some(install_worker(staging, &options.output_dir).await?)
        } else {
            None
        };

        let lab_extensions = match &options.labextensions_dir {
            Some(dest) => {
                let copied = copy_lab_extensions(staging, dest).await?;
                self.handler.on_progress(BuildPhase::CopyingLabExtensions {
                    count: copied.len(),
                });
                copied
            }
            None => Vec::new(),
        };

        Ok(BuildOutput {
            env_name: spec.name.clone(),
            backend: backend.name().to_string(),
            prefix: staging.prefix(),
            output_dir: options.output_dir.clone(),
            bundle_files,
            runtime_files,
            relocated_files,
            worker_entry,
            lab_extensions,
        })
    }
}
