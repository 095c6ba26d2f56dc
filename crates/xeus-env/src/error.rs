//! Error type shared by every pipeline step.

use std::path::PathBuf;

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, BuildError>;

/// Errors that terminate a build.
///
/// None of these are retried. The `CONDARC` override is restored whichever
/// variant ends the run.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(
        "Failed to create the emscripten environment: no usable backend found \
         (tried {tried}). Install mamba, micromamba or conda."
    )]
    BackendUnavailable { tried: String },

    #[error("{tool} failed with {status}")]
    BackendExecutionFailed { tool: String, status: String },

    #[error(
        "Cannot install binary PyPI package ({}), only pure Python packages are supported",
        path.display()
    )]
    UnsupportedArtifact { path: PathBuf },

    #[error("Install record entry {path:?} points outside the environment prefix")]
    InvalidRecordEntry { path: String },

    #[error("Expected build output not found at {}", path.display())]
    MissingArtifact { path: PathBuf },

    #[error("Failed to fetch filter config from {url}: {reason}")]
    RemoteConfigFetchFailed { url: String, reason: String },

    #[error("Invalid environment file {}: {reason}", path.display())]
    InvalidEnvironmentFile { path: PathBuf, reason: String },

    #[error("Invalid filter config {}: {reason}", path.display())]
    InvalidConfig { path: PathBuf, reason: String },

    #[error("Invalid package specifier {spec:?}: {reason}")]
    InvalidSpecifier { spec: String, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl BuildError {
    /// Wrap an I/O error with a short description of what was being done.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BuildError::Io {
            context: context.into(),
            source,
        }
    }

    /// Build a [`BuildError::BackendExecutionFailed`] from a finished process.
    pub fn exit_status(tool: impl Into<String>, status: std::process::ExitStatus) -> Self {
        let status = match status.code() {
            Some(code) => format!("exit code {}", code),
            None => "termination by signal".to_string(),
        };
        BuildError::BackendExecutionFailed {
            tool: tool.into(),
            status,
        }
    }
}

/// Attach context to `std::io::Result` values.
pub(crate) trait IoContext<T> {
    fn io_context<C: Into<String>>(self, context: impl FnOnce() -> C) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<C: Into<String>>(self, context: impl FnOnce() -> C) -> Result<T> {
        self.map_err(|e| BuildError::io(context(), e))
    }
}
