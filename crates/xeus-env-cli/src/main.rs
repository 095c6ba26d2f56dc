//! xeus-env CLI entry point.
//!
//! Builds the emscripten environment for xeus-python and writes the packed
//! bundle, the kernel engine files and (optionally) the worker template to
//! the output directory.

use std::path::PathBuf;

use clap::Parser;
use log::info;
use xeus_env::spec::{DEFAULT_ENV_NAME, PYTHON_VERSION};
use xeus_env::{BackendChoice, BuildOptions, BuildOutcome, FilterSource, Pipeline};

#[derive(Parser, Debug)]
#[command(name = "xeus-env")]
#[command(about = "Build the emscripten environment for the xeus-python kernel")]
struct Cli {
    /// Python version of the environment
    #[arg(long, default_value = PYTHON_VERSION)]
    python_version: String,

    /// xeus-python version (default: the pinned release)
    #[arg(long)]
    xeus_python_version: Option<String>,

    /// Extra conda package to install (repeatable)
    #[arg(long = "package", value_name = "SPEC")]
    packages: Vec<String>,

    /// Conda environment file to merge in
    #[arg(long)]
    environment_file: Option<PathBuf>,

    /// Staging root (default: <tmp>/xeus-python-kernel)
    #[arg(long)]
    root_prefix: Option<PathBuf>,

    /// Name of the environment under <root>/envs
    #[arg(long, default_value = DEFAULT_ENV_NAME)]
    env_name: String,

    /// empack filter config: local path or http(s) URL
    #[arg(long, default_value = "")]
    empack_config: String,

    /// Directory receiving the build output
    #[arg(long, default_value = ".")]
    output_path: PathBuf,

    /// Also install the patched worker template
    #[arg(long)]
    build_worker: bool,

    /// Skip the build when only the defaults were requested
    #[arg(long)]
    lazy: bool,

    /// Backend: auto, rattler, mamba, micromamba or conda
    #[arg(long, default_value = "auto")]
    backend: BackendChoice,

    /// Keep the staging prefix after a successful build
    #[arg(long)]
    keep_staging: bool,

    /// Remove the staging prefix when the build fails
    #[arg(long)]
    cleanup_on_failure: bool,

    /// Copy lab extensions found in the environment into this directory
    #[arg(long)]
    labextensions_dir: Option<PathBuf>,

    /// Host interpreter used to run pip
    #[arg(long, default_value = "python3")]
    python: PathBuf,

    /// Print the build summary as JSON
    #[arg(long)]
    json: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn into_options(self) -> BuildOptions {
        let defaults = BuildOptions::default();
        BuildOptions {
            python_version: self.python_version,
            kernel_version: self.xeus_python_version,
            packages: self.packages,
            environment_file: self.environment_file,
            root_prefix: self.root_prefix.unwrap_or(defaults.root_prefix),
            env_name: self.env_name,
            filter: FilterSource::parse(&self.empack_config),
            output_dir: self.output_path,
            build_worker: self.build_worker,
            force: !self.lazy,
            backend: self.backend,
            keep_staging: self.keep_staging,
            cleanup_on_failure: self.cleanup_on_failure,
            labextensions_dir: self.labextensions_dir,
            host_python: self.python,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let json = cli.json;
    let options = cli.into_options();

    info!("Output directory: {:?}", options.output_dir);
    info!("Staging root: {:?}", options.root_prefix);

    let outcome = Pipeline::new(options).run().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    match outcome {
        BuildOutcome::NothingToDo => {
            println!("Nothing to build: no extra packages or environment file given");
        }
        BuildOutcome::Built(output) => {
            println!("Built {} with {}", output.env_name, output.backend);
            for file in output.runtime_files.iter().chain(&output.bundle_files) {
                println!("  {}", file.display());
            }
            if let Some(worker) = &output.worker_entry {
                println!("  {}", worker.display());
            }
            for ext in &output.lab_extensions {
                println!("  {}", ext.display());
            }
        }
    }
    Ok(())
}
