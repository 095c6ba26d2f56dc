//! Build the emscripten-wasm32 Python environment a browser xeus-python
//! kernel boots from.
//!
//! A run merges the requested packages into one environment description, creates the
//! environment with the first available backend (rattler in process, then
//! `mamba`, `micromamba`, `conda`), relocates pure-Python pip packages into
//! it, packs it with `empack`, copies the kernel engine next to the bundle
//! and optionally installs the worker template and lab extensions.
//!
//! ```no_run
//! use xeus_env::{BuildOptions, BuildOutcome, Pipeline};
//!
//! # async fn run() -> xeus_env::Result<()> {
//! let options = BuildOptions {
//!     packages: vec!["numpy".to_string()],
//!     output_dir: "dist".into(),
//!     ..Default::default()
//! };
//! match Pipeline::new(options).run().await? {
//!     BuildOutcome::Built(output) => println!("{} files", output.bundle_files.len()),
//!     BuildOutcome::NothingToDo => println!("nothing to build"),
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod condarc;
pub mod error;
pub mod filter;
pub mod fs_util;
pub mod labextensions;
pub mod pack;
pub mod pipeline;
pub mod progress;
#[cfg(feature = "rattler")]
pub mod rattler_backend;
pub mod relocate;
pub mod spec;
pub mod staging;
pub mod worker;

pub use backend::{select_backend, Availability, Backend, BackendChoice};
pub use error::{BuildError, Result};
pub use filter::{FileFilter, FilterSource};
pub use pack::{EmpackCli, PackRequest, Packer};
pub use pipeline::{BuildOptions, BuildOutcome, BuildOutput, Pipeline};
pub use progress::{BuildPhase, LogHandler, ProgressHandler};
pub use relocate::{HostInstaller, InstallRequest, PipInstaller};
pub use spec::{resolve, EnvironmentSpec, PipSpecifier, Resolution, SpecRequest};
pub use staging::StagingPrefix;
