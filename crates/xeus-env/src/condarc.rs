//! Scoped override of the process-wide `CONDARC` variable.
//!
//! mamba and conda have no command-line flag to pin the target subdir for
//! `install`, so the platform is written to a `.condarc` file and `CONDARC` is
//! pointed at it. [`EnvOverride`] captures the prior value when created and
//! restores it (or removes the variable) exactly once, when dropped or
//! explicitly restored.

use log::debug;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::error::{IoContext, Result};

/// Variable read by conda-compatible tools for their configuration file.
pub const CONDARC_VAR: &str = "CONDARC";

/// Guard over one process-wide environment variable.
#[derive(Debug)]
pub struct EnvOverride {
    key: &'static str,
    /// `Some(prior)` until restored; the inner option is the captured value.
    original: Option<Option<OsString>>,
}

impl EnvOverride {
    /// Capture the current value of `key`. Nothing is modified yet.
    pub fn capture(key: &'static str) -> Self {
        Self {
            key,
            original: Some(std::env::var_os(key)),
        }
    }

    /// Capture `CONDARC`.
    pub fn condarc() -> Self {
        Self::capture(CONDARC_VAR)
    }

    /// Point the variable at `value` for the rest of the guard's lifetime.
    pub fn set(&self, value: impl AsRef<std::ffi::OsStr>) {
        debug!("Setting {}={:?}", self.key, value.as_ref());
        std::env::set_var(self.key, value);
    }

    /// Restore the captured value now. Later calls (and the drop) are no-ops.
    pub fn restore(&mut self) {
        let Some(original) = self.original.take() else {
            return;
        };
        match original {
            Some(value) => {
                debug!("Restoring {}={:?}", self.key, value);
                std::env::set_var(self.key, value);
            }
            None => {
                debug!("Removing {}", self.key);
                std::env::remove_var(self.key);
            }
        }
    }
}

impl Drop for EnvOverride {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Write a `.condarc` pinning `subdir` inside `prefix` and point `guard` at it.
pub fn install_platform_config(guard: &EnvOverride, prefix: &Path, subdir: &str) -> Result<PathBuf> {
    let path = prefix.join(".condarc");
    std::fs::create_dir_all(prefix).io_context(|| format!("creating {:?}", prefix))?;
    std::fs::write(&path, format!("subdir: {}", subdir))
        .io_context(|| format!("writing {:?}", path))?;
    guard.set(&path);
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const TEST_VAR: &str = "XEUS_ENV_TEST_OVERRIDE";

    #[test]
    #[serial]
    fn test_restores_previous_value() {
        std::env::set_var(TEST_VAR, "before");
        {
            let guard = EnvOverride::capture(TEST_VAR);
            guard.set("during");
            assert_eq!(std::env::var(TEST_VAR).unwrap(), "during");
        }
        assert_eq!(std::env::var(TEST_VAR).unwrap(), "before");
        std::env::remove_var(TEST_VAR);
    }

    #[test]
    #[serial]
    fn test_removes_when_previously_unset() {
        std::env::remove_var(TEST_VAR);
        {
            let guard = EnvOverride::capture(TEST_VAR);
            guard.set("during");
        }
        assert!(std::env::var_os(TEST_VAR).is_none());
    }

    #[test]
    #[serial]
    fn test_restore_happens_once() {
        std::env::set_var(TEST_VAR, "before");
        let mut guard = EnvOverride::capture(TEST_VAR);
        guard.set("during");
        guard.restore();
        assert_eq!(std::env::var(TEST_VAR).unwrap(), "before");

        // A later change must survive the guard being dropped.
        std::env::set_var(TEST_VAR, "after");
        drop(guard);
        assert_eq!(std::env::var(TEST_VAR).unwrap(), "after");
        std::env::remove_var(TEST_VAR);
    }

    #[test]
    #[serial]
    fn test_restored_on_error_path() {
        std::env::remove_var(TEST_VAR);

        fn failing_step() -> std::result::Result<(), String> {
            let guard = EnvOverride::capture(TEST_VAR);
            guard.set("during");
            Err("backend exploded".to_string())
        }

        assert!(failing_step().is_err());
        assert!(std::env::var_os(TEST_VAR).is_none());
    }

    #[test]
    #[serial]
    fn test_install_platform_config() {
        let temp = tempfile::TempDir::new().unwrap();
        let prefix = temp.path().join("envs").join("test");
        let original = std::env::var_os(CONDARC_VAR);
        {
            let guard = EnvOverride::condarc();
            let path = install_platform_config(&guard, &prefix, "emscripten-wasm32").unwrap();
            assert_eq!(
                std::fs::read_to_string(&path).unwrap(),
                "subdir: emscripten-wasm32"
            );
            assert_eq!(std::env::var_os(CONDARC_VAR), Some(path.into_os_string()));
        }
        assert_eq!(std::env::var_os(CONDARC_VAR), original);
    }
}
