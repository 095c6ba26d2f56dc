//! In-process backend: solve and install an emscripten prefix with rattler.
//!
//! repodata fetch → solve → download → link, all targeting
//! `emscripten-wasm32`. Host virtual packages are not detected since none of
//! them describe the wasm target.

use log::info;
use rattler::{default_cache_dir, install::Installer, package_cache::PackageCache};
use rattler_conda_types::{Channel, ChannelConfig, MatchSpec, ParseMatchSpecOptions, Platform};
use rattler_repodata_gateway::Gateway;
use rattler_solve::{resolvo, SolverImpl, SolverTask};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{BuildError, Result};
use crate::progress::{BuildPhase, ProgressHandler, RattlerReporter};
use crate::spec::EnvironmentSpec;
use crate::staging::StagingPrefix;

const TOOL: &str = "rattler";

fn failed(message: String) -> BuildError {
    BuildError::BackendExecutionFailed {
        tool: TOOL.to_string(),
        status: message,
    }
}

/// Create `staging.prefix()` from `spec` without any external tool.
pub async fn create_environment(
    spec: &EnvironmentSpec,
    staging: &StagingPrefix,
    handler: Arc<dyn ProgressHandler>,
) -> Result<()> {
    let env_path = staging.prefix();
    let channel_config = ChannelConfig::default_with_root_dir(staging.root().to_path_buf());

    let channels: Vec<Channel> = spec
        .channels
        .iter()
        .map(|c| {
            Channel::from_str(c, &channel_config).map_err(|e| BuildError::InvalidSpecifier {
                spec: c.clone(),
                reason: e.to_string(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let match_spec_options = ParseMatchSpecOptions::strict();
    let specs: Vec<MatchSpec> = spec
        .specifiers
        .iter()
        .map(|s| {
            MatchSpec::from_str(s, match_spec_options).map_err(|e| BuildError::InvalidSpecifier {
                spec: s.clone(),
                reason: e.to_string(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    handler.on_progress(BuildPhase::FetchingRepodata {
        channels: channels.iter().map(|c| c.name().to_string()).collect(),
    });

    // Rattler cache
    let rattler_cache_dir = default_cache_dir().map_err(|e| {
        failed(format!("could not determine rattler cache directory: {}", e))
    })?;
    rattler_cache::ensure_cache_dir(&rattler_cache_dir).map_err(|e| {
        failed(format!("could not create rattler cache directory: {}", e))
    })?;

    // HTTP client
    let download_client = reqwest::Client::builder()
        .build()
        .map_err(|e| failed(format!("could not build HTTP client: {}", e)))?;
    let download_client = reqwest_middleware::ClientBuilder::new(download_client).build();

    // Gateway
    let gateway = Gateway::builder()
        .with_cache_dir(rattler_cache_dir.join(rattler_cache::REPODATA_CACHE_DIR))
        .with_package_cache(PackageCache::new(
            rattler_cache_dir.join(rattler_cache::PACKAGE_CACHE_DIR),
        ))
        .with_client(download_client.clone())
        .finish();

    let target_platform = Platform::EmscriptenWasm32;
    let platforms = vec![target_platform, Platform::NoArch];

    let repodata_start = Instant::now();
    let repo_data = gateway
        .query(channels, platforms, specs.clone())
        .recursive(true)
        .await
        .map_err(|e| {
            failed(format!("Failed to fetch package metadata: {}", e))
        })?;

    let total_records: usize = repo_data.iter().map(|r| r.len()).sum();
    let repodata_elapsed = repodata_start.elapsed();
    info!(
        "Loaded {} package records in {:?}",
        total_records, repodata_elapsed
    );
    handler.on_progress(BuildPhase::RepodataComplete {
        record_count: total_records,
        elapsed_ms: repodata_elapsed.as_millis() as u64,
    });

    // Solve
    handler.on_progress(BuildPhase::Solving {
        spec_count: specs.len(),
    });

    let solve_start = Instant::now();
    let solver_task = SolverTask {
        virtual_packages: Vec::new(),
        specs,
        ..SolverTask::from_iter(&repo_data)
    };

    let required_packages = resolvo::Solver
        .solve(solver_task)
        .map_err(|e| {
            failed(format!("Failed to solve dependencies: {}", e))
        })?
        .records;
    let solve_elapsed = solve_start.elapsed();

    info!(
        "Solved: {} packages to install in {:?}",
        required_packages.len(),
        solve_elapsed
    );
    handler.on_progress(BuildPhase::SolveComplete {
        package_count: required_packages.len(),
        elapsed_ms: solve_elapsed.as_millis() as u64,
    });

    // Install
    handler.on_progress(BuildPhase::Installing {
        total: required_packages.len(),
    });

    let reporter = RattlerReporter::new(handler.clone());
    let install_start = Instant::now();

    Installer::new()
        .with_download_client(download_client)
        .with_target_platform(target_platform)
        .with_reporter(reporter)
        .install(&env_path, required_packages)
        .await
        .map_err(|e| {
            failed(format!("Failed to install packages: {}", e))
        })?;

    let install_elapsed = install_start.elapsed();
    info!(
        "Emscripten environment ready at {:?} (install took {:?})",
        env_path, install_elapsed
    );
    handler.on_progress(BuildPhase::InstallComplete {
        elapsed_ms: install_elapsed.as_millis() as u64,
    });

    Ok(())
}
