//! Progress reporting for a build.
//!
//! Provides [`BuildPhase`] events covering the pipeline from package resolution
//! to the final output directory, and a [`ProgressHandler`] trait that
//! consumers implement to route events to their UI layer. The in-process
//! backend also reports repodata, solve, download and link progress through
//! [`RattlerReporter`].

use serde::{Deserialize, Serialize};

/// Progress phases during a build.
///
/// Serializable so a front end can forward them as JSON lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum BuildPhase {
    /// Specifiers merged, about to create the environment.
    Resolved {
        env_name: String,
        spec_count: usize,
        pip_count: usize,
    },
    /// Backend picked for this run.
    BackendSelected { backend: String },
    /// Running an external tool.
    RunningCommand { tool: String, args: Vec<String> },
    /// Fetching package metadata from channels.
    FetchingRepodata { channels: Vec<String> },
    /// Repodata fetch complete.
    RepodataComplete {
        record_count: usize,
        elapsed_ms: u64,
    },
    /// Solving dependency graph.
    Solving { spec_count: usize },
    /// Solve complete.
    SolveComplete {
        package_count: usize,
        elapsed_ms: u64,
    },
    /// Installing packages (aggregate phase).
    Installing { total: usize },
    /// Download progress for individual packages.
    DownloadProgress {
        completed: usize,
        total: usize,
        current_package: String,
    },
    /// Linking packages into the prefix.
    LinkProgress {
        completed: usize,
        total: usize,
        current_package: String,
    },
    /// Installation complete.
    InstallComplete { elapsed_ms: u64 },
    /// Installing and relocating pure-Python pip packages.
    RelocatingPipPackages { packages: Vec<String> },
    /// Packing the prefix.
    Packing { prefix: String },
    /// Packer finished.
    PackComplete { file_count: usize },
    /// Copying the kernel engine files.
    CopyingRuntime,
    /// Copying and patching the worker template.
    PatchingWorker,
    /// Copying federated lab extensions.
    CopyingLabExtensions { count: usize },
    /// Build output is ready.
    Ready { output_dir: String },
    /// An error occurred.
    Error { message: String },
}

/// Trait for receiving build progress events.
pub trait ProgressHandler: Send + Sync {
    fn on_progress(&self, phase: BuildPhase);
}

/// Log-only progress handler.
///
/// Writes progress phases to the `log` crate.
pub struct LogHandler;

impl ProgressHandler for LogHandler {
    fn on_progress(&self, phase: BuildPhase) {
        match &phase {
            BuildPhase::Resolved {
                env_name,
                spec_count,
                pip_count,
            } => {
                log::info!(
                    "Building {env_name}: {spec_count} conda specs, {pip_count} pip packages"
                );
            }
            BuildPhase::BackendSelected { backend } => {
                log::info!("Creating environment with {backend}");
            }
            BuildPhase::RunningCommand { tool, args } => {
                log::debug!("Running {tool} {}", args.join(" "));
            }
            BuildPhase::FetchingRepodata { channels } => {
                log::info!("Fetching repodata from: {channels:?}");
            }
            BuildPhase::RepodataComplete {
                record_count,
                elapsed_ms,
            } => {
                log::info!("Loaded {record_count} package records in {elapsed_ms}ms");
            }
            BuildPhase::Solving { spec_count } => {
                log::info!("Solving {spec_count} specs...");
            }
            BuildPhase::SolveComplete {
                package_count,
                elapsed_ms,
            } => {
                log::info!("Resolved {package_count} packages in {elapsed_ms}ms");
            }
            BuildPhase::Installing { total } => {
                log::info!("Installing {total} packages...");
            }
            BuildPhase::DownloadProgress {
                completed, total, ..
            } => {
                log::debug!("Download {completed}/{total}");
            }
            BuildPhase::LinkProgress {
                completed, total, ..
            } => {
                log::debug!("Link {completed}/{total}");
            }
            BuildPhase::InstallComplete { elapsed_ms } => {
                log::info!("Installation complete in {elapsed_ms}ms");
            }
            BuildPhase::RelocatingPipPackages { packages } => {
                log::info!("Installing pip packages: {packages:?}");
            }
            BuildPhase::Packing { prefix } => {
                log::info!("Packing {prefix}");
            }
            BuildPhase::PackComplete { file_count } => {
                log::info!("Packed environment into {file_count} files");
            }
            BuildPhase::CopyingRuntime => {
                log::info!("Copying xeus-python engine files");
            }
            BuildPhase::PatchingWorker => {
                log::info!("Installing worker template");
            }
            BuildPhase::CopyingLabExtensions { count } => {
                log::info!("Copying {count} lab extensions");
            }
            BuildPhase::Ready { output_dir } => {
                log::info!("Ready: {output_dir}");
            }
            BuildPhase::Error { message } => {
                log::error!("Error: {message}");
            }
        }
    }
}

#[cfg(feature = "rattler")]
pub use reporter::RattlerReporter;

#[cfg(feature = "rattler")]
mod reporter {
    use rattler::install::{Reporter, Transaction};
    use rattler_conda_types::{PrefixRecord, RepoDataRecord};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, RwLock};
    use std::time::Instant;

    use super::{BuildPhase, ProgressHandler};

    /// Rattler [`Reporter`] implementation that delegates to [`ProgressHandler`].
    ///
    /// Download events are throttled to one every 100ms.
    pub struct RattlerReporter {
        handler: Arc<dyn ProgressHandler>,
        total: AtomicUsize,
        downloaded: AtomicUsize,
        linked: AtomicUsize,
        /// Package names indexed by operation/cache index.
        package_names: RwLock<HashMap<usize, String>>,
        current_download: RwLock<Option<String>>,
        last_download_emit: RwLock<Option<Instant>>,
    }

    impl RattlerReporter {
        pub fn new(handler: Arc<dyn ProgressHandler>) -> Self {
            Self {
                handler,
                total: AtomicUsize::new(0),
                downloaded: AtomicUsize::new(0),
                linked: AtomicUsize::new(0),
                package_names: RwLock::new(HashMap::new()),
                current_download: RwLock::new(None),
                last_download_emit: RwLock::new(None),
            }
        }

        fn name_of(&self, index: usize) -> String {
            self.package_names
                .read()
                .ok()
                .and_then(|names| names.get(&index).cloned())
                .unwrap_or_default()
        }

        fn emit_download_progress(&self, force: bool) {
            if let Ok(mut last_emit) = self.last_download_emit.write() {
                if let Some(last) = *last_emit {
                    if !force && last.elapsed().as_millis() < 100 {
                        return;
                    }
                }
                *last_emit = Some(Instant::now());
            }

            let current_package = self
                .current_download
                .read()
                .ok()
                .and_then(|c| c.clone())
                .unwrap_or_default();

            self.handler.on_progress(BuildPhase::DownloadProgress {
                completed: self.downloaded.load(Ordering::SeqCst),
                total: self.total.load(Ordering::SeqCst),
                current_package,
            });
        }

        fn emit_link_progress(&self, current_package: String) {
            self.handler.on_progress(BuildPhase::LinkProgress {
                completed: self.linked.load(Ordering::SeqCst),
                total: self.total.load(Ordering::SeqCst),
                current_package,
            });
        }

        fn remember(&self, index: usize, record: &RepoDataRecord) -> String {
            let name = record.package_record.name.as_source().to_string();
            if let Ok(mut names) = self.package_names.write() {
                names.insert(index, name.clone());
            }
            name
        }
    }

    impl Reporter for RattlerReporter {
        fn on_transaction_start(&self, transaction: &Transaction<PrefixRecord, RepoDataRecord>) {
            self.total
                .store(transaction.operations.len(), Ordering::SeqCst);
        }

        fn on_transaction_operation_start(&self, _operation: usize) {}

        fn on_populate_cache_start(&self, cache_entry: usize, record: &RepoDataRecord) -> usize {
            self.remember(cache_entry, record);
            cache_entry
        }

        fn on_validate_start(&self, cache_entry: usize) -> usize {
            cache_entry
        }

        fn on_validate_complete(&self, _validate_idx: usize) {}

        fn on_download_start(&self, cache_entry: usize) -> usize {
            let name = self.name_of(cache_entry);
            if let Ok(mut current) = self.current_download.write() {
                *current = Some(name);
            }
            cache_entry
        }

        fn on_download_progress(&self, _download_idx: usize, _progress: u64, _total: Option<u64>) {
            self.emit_download_progress(false);
        }

        fn on_download_completed(&self, _download_idx: usize) {
            self.downloaded.fetch_add(1, Ordering::SeqCst);
            self.emit_download_progress(true);
        }

        fn on_populate_cache_complete(&self, _cache_entry: usize) {}

        fn on_unlink_start(&self, operation: usize, _record: &PrefixRecord) -> usize {
            operation
        }

        fn on_unlink_complete(&self, _index: usize) {}

        fn on_link_start(&self, operation: usize, record: &RepoDataRecord) -> usize {
            let name = self.remember(operation, record);
            self.emit_link_progress(name);
            operation
        }

        fn on_link_complete(&self, index: usize) {
            self.linked.fetch_add(1, Ordering::SeqCst);
            self.emit_link_progress(self.name_of(index));
        }

        fn on_transaction_operation_complete(&self, _operation: usize) {}

        fn on_transaction_complete(&self) {}

        fn on_post_link_start(&self, _package_name: &str, _script_path: &str) -> usize {
            0
        }

        fn on_post_link_complete(&self, _index: usize, _success: bool) {}

        fn on_pre_unlink_start(&self, _package_name: &str, _script_path: &str) -> usize {
            0
        }

        fn on_pre_unlink_complete(&self, _index: usize, _success: bool) {}
    }
}
