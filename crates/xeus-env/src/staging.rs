//! The disposable tree holding one emscripten environment before packing.

use log::info;
use std::path::{Path, PathBuf};

use crate::error::{IoContext, Result};

/// Location of an environment under a staging root.
///
/// The prefix lives at `<root>/envs/<name>`; scratch files produced while
/// packing go to `<root>/work`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingPrefix {
    root: PathBuf,
    name: String,
}

impl StagingPrefix {
    pub fn new(root: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            name: name.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn envs_dir(&self) -> PathBuf {
        self.root.join("envs")
    }

    /// `<root>/envs/<name>`
    pub fn prefix(&self) -> PathBuf {
        self.envs_dir().join(&self.name)
    }

    pub fn work_dir(&self) -> PathBuf {
        self.root.join("work")
    }

    /// `<prefix>/bin`
    pub fn bin_dir(&self) -> PathBuf {
        self.prefix().join("bin")
    }

    /// `<prefix>/lib/python<version>/site-packages`
    pub fn site_packages(&self, python_version: &str) -> PathBuf {
        self.prefix()
            .join("lib")
            .join(format!("python{}", python_version))
            .join("site-packages")
    }

    /// Clear anything left by earlier runs and create the root.
    pub async fn prepare(&self) -> Result<()> {
        for dir in [self.envs_dir(), self.work_dir()] {
            if dir.exists() {
                info!("Removing stale staging directory {:?}", dir);
                tokio::fs::remove_dir_all(&dir)
                    .await
                    .io_context(|| format!("removing {:?}", dir))?;
            }
        }
        tokio::fs::create_dir_all(&self.root)
            .await
            .io_context(|| format!("creating {:?}", self.root))?;
        Ok(())
    }

    /// Remove the environments and scratch files. The root itself is kept.
    pub async fn cleanup(&self) -> Result<()> {
        for dir in [self.envs_dir(), self.work_dir()] {
            if dir.exists() {
                tokio::fs::remove_dir_all(&dir)
                    .await
                    .io_context(|| format!("removing {:?}", dir))?;
            }
        }
        Ok(())
    }
}
