//! Kernel worker template.
//!
//! `share/xeus-lite` in the built prefix ships a TypeScript worker with
//! placeholder tokens. We copy it next to the bundle and point it at the
//! engine script and the packed environment.

use log::info;
use std::path::{Path, PathBuf};

use crate::error::{BuildError, IoContext, Result};
use crate::fs_util::copy_dir_recursive;
use crate::staging::StagingPrefix;

/// Entry script of the template.
pub const WORKER_ENTRY: &str = "worker.ts";

const KERNEL_FILE_TOKEN: &str = "XEUS_KERNEL_FILE";
const KERNEL_FILE_VALUE: &str = "'xpython_wasm.js'";

const DATA_FILE_TOKEN: &str = "LANGUAGE_DATA_FILE";
const DATA_FILE_VALUE: &str = "'python_data.js'";

const LOAD_DATA_STATEMENT: &str = "importScripts(DATA_FILE);";
const BOOTSTRAP_SNIPPET: &str = "
    await globalThis.Module.bootstrap_from_empack_packed_environment(
        `./empack_env_meta.json`, /* packages_json_url */
        \".\",                      /* package_tarballs_root_url */
        false                     /* verbose */
    );
";

/// `<prefix>/share/xeus-lite`
pub fn template_dir(staging: &StagingPrefix) -> PathBuf {
    staging.prefix().join("share").join("xeus-lite")
}

/// Substitute the placeholders of a worker source. Tokens that do not
/// occur are left alone.
pub fn patch_worker_source(source: &str) -> String {
    source
        .replace(KERNEL_FILE_TOKEN, KERNEL_FILE_VALUE)
        .replace(DATA_FILE_TOKEN, DATA_FILE_VALUE)
        .replace(LOAD_DATA_STATEMENT, BOOTSTRAP_SNIPPET)
}

/// Copy the template into `output_dir` and patch its entry script.
///
/// Returns the path of the patched entry script.
pub async fn install_worker(staging: &StagingPrefix, output_dir: &Path) -> Result<PathBuf> {
    let template = template_dir(staging);
    if !template.is_dir() {
        return Err(BuildError::MissingArtifact { path: template });
    }
    if !template.join(WORKER_ENTRY).is_file() {
        return Err(BuildError::MissingArtifact {
            path: template.join(WORKER_ENTRY),
        });
    }

    copy_dir_recursive(&template, output_dir).await?;

    let entry = output_dir.join(WORKER_ENTRY);
    let source = tokio::fs::read_to_string(&entry)
        .await
        .io_context(|| format!("reading {:?}", entry))?;
    tokio::fs::write(&entry, patch_worker_source(&source))
        .await
        .io_context(|| format!("writing {:?}", entry))?;

    info!("Patched worker at {:?}", entry);
    Ok(entry)
}
