//! Federated front-end extensions shipped inside the built environment.
//!
//! Extensions live under `<prefix>/share/jupyter/labextensions`, either as
//! `<name>/package.json` or `@scope/<name>/package.json`. Each one is copied
//! to `<dest>/<package name>`; when two directories declare the same package
//! name, the one discovered last wins.

use log::debug;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{BuildError, IoContext, Result};
use crate::fs_util::{copy_dir_recursive, remove_existing};
use crate::staging::StagingPrefix;

#[derive(Debug, Deserialize)]
struct PackageJson {
    name: String,
}

/// One extension found in the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabExtension {
    pub name: String,
    pub source: PathBuf,
}

/// `<prefix>/share/jupyter/labextensions`
pub fn extensions_root(staging: &StagingPrefix) -> PathBuf {
    staging
        .prefix()
        .join("share")
        .join("jupyter")
        .join("labextensions")
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

async fn sorted_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .io_context(|| format!("reading {:?}", dir))?;
    let mut dirs = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .io_context(|| format!("reading {:?}", dir))?
    {
        let path = entry.path();
        if is_dir(&path).await {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

async fn read_package(package_json: &Path) -> Result<LabExtension> {
    let content = tokio::fs::read_to_string(package_json)
        .await
        .io_context(|| format!("reading {:?}", package_json))?;
    let package: PackageJson =
        serde_json::from_str(&content).map_err(|e| BuildError::InvalidConfig {
            path: package_json.to_path_buf(),
            reason: e.to_string(),
        })?;
    Ok(LabExtension {
        name: package.name,
        source: package_json
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default(),
    })
}

/// Every extension under `root`, in path order. A missing root yields none.
pub async fn discover(root: &Path) -> Result<Vec<LabExtension>> {
    if !is_dir(root).await {
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    for dir in sorted_subdirs(root).await? {
        let package_json = dir.join("package.json");
        if is_file(&package_json).await {
            found.push(read_package(&package_json).await?);
            continue;
        }
        // @scope/<name>
        for nested in sorted_subdirs(&dir).await? {
            let package_json = nested.join("package.json");
            if is_file(&package_json).await {
                found.push(read_package(&package_json).await?);
            }
        }
    }
    debug!("Found {} lab extensions under {:?}", found.len(), root);
    Ok(found)
}

/// Pair each extension with its destination, keeping only the last
/// extension for a given package name.
pub fn plan_copies(extensions: &[LabExtension], dest: &Path) -> Vec<(PathBuf, PathBuf)> {
    let mut by_name: BTreeMap<&str, &Path> = BTreeMap::new();
    for ext in extensions {
        by_name.insert(ext.name.as_str(), ext.source.as_path());
    }
    by_name
        .into_iter()
        .map(|(name, source)| (source.to_path_buf(), dest.join(name)))
        .collect()
}

/// Copy every extension found in the environment into `dest`, replacing
/// earlier copies. Returns the destination directories.
pub async fn copy_lab_extensions(staging: &StagingPrefix, dest: &Path) -> Result<Vec<PathBuf>> {
    let extensions = discover(&extensions_root(staging)).await?;
    let plan = plan_copies(&extensions, dest);

    let mut copied = Vec::with_capacity(plan.len());
    for (source, destination) in plan {
        debug!("Copying lab extension {:?} to {:?}", source, destination);
        remove_existing(&destination).await?;
        copy_dir_recursive(&source, &destination).await?;
        copied.push(destination);
    }
    Ok(copied)
}
