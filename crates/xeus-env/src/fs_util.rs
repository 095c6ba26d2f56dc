//! Directory copying shared by the worker and lab-extension steps.

use std::path::Path;

use crate::error::{IoContext, Result};

/// Recursively copy `src` into `dst`, overwriting files that already exist.
///
/// Symlinks are recreated on unix and copied as files elsewhere.
pub async fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dst)
        .await
        .io_context(|| format!("creating {:?}", dst))?;

    let mut entries = tokio::fs::read_dir(src)
        .await
        .io_context(|| format!("reading {:?}", src))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .io_context(|| format!("reading {:?}", src))?
    {
        let ty = entry
            .file_type()
            .await
            .io_context(|| format!("inspecting {:?}", entry.path()))?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if ty.is_dir() {
            Box::pin(copy_dir_recursive(&src_path, &dst_path)).await?;
        } else if ty.is_symlink() {
            remove_existing(&dst_path).await?;
            #[cfg(unix)]
            {
                let link_target = tokio::fs::read_link(&src_path)
                    .await
                    .io_context(|| format!("reading link {:?}", src_path))?;
                tokio::fs::symlink(&link_target, &dst_path)
                    .await
                    .io_context(|| format!("linking {:?}", dst_path))?;
            }
            #[cfg(not(unix))]
            tokio::fs::copy(&src_path, &dst_path)
                .await
                .io_context(|| format!("copying {:?}", src_path))?;
        } else {
            tokio::fs::copy(&src_path, &dst_path)
                .await
                .io_context(|| format!("copying {:?} to {:?}", src_path, dst_path))?;
        }
    }

    Ok(())
}

/// Remove whatever sits at `path` so it can be replaced.
pub async fn remove_existing(path: &Path) -> Result<()> {
    let Ok(meta) = tokio::fs::symlink_metadata(path).await else {
        return Ok(());
    };
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path)
            .await
            .io_context(|| format!("removing {:?}", path))
    } else {
        tokio::fs::remove_file(path)
            .await
            .io_context(|| format!("removing {:?}", path))
    }
}
