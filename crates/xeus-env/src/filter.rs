//! File filter configuration handed to the packer.
//!
//! The filter decides which files of the prefix end up in the bundle. It is
//! read from a local YAML file, fetched from an `http(s)` URL, or taken from
//! the built-in default.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BuildError, Result};

/// Built-in filter used when no config is given.
pub const DEFAULT_FILTER_YAML: &str = include_str!("default_filter.yaml");

/// Upper bound on fetching a remote filter config.
pub const REMOTE_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// One include/exclude rule. Exactly one of the fields is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatternRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
}

/// Rules applied to one package (or to every package, for `default`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRules {
    #[serde(default)]
    pub include_patterns: Vec<PatternRule>,
    #[serde(default)]
    pub exclude_patterns: Vec<PatternRule>,
}

/// Complete filter configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFilter {
    #[serde(default)]
    pub packages: BTreeMap<String, FilterRules>,
    #[serde(default)]
    pub default: FilterRules,
}

impl FileFilter {
    /// Parse and validate a YAML filter document.
    pub fn from_yaml(content: &str) -> std::result::Result<Self, String> {
        let filter: FileFilter = serde_yaml::from_str(content).map_err(|e| e.to_string())?;
        filter.validate()?;
        Ok(filter)
    }

    pub fn to_yaml(&self) -> std::result::Result<String, String> {
        serde_yaml::to_string(self).map_err(|e| e.to_string())
    }

    /// The built-in filter.
    pub fn builtin() -> Self {
        // The embedded document is covered by tests.
        Self::from_yaml(DEFAULT_FILTER_YAML).unwrap_or_default()
    }

    fn validate(&self) -> std::result::Result<(), String> {
        let sections = self
            .packages
            .iter()
            .map(|(name, rules)| (name.as_str(), rules))
            .chain(std::iter::once(("default", &self.default)));

        for (section, rules) in sections {
            for rule in rules.include_patterns.iter().chain(&rules.exclude_patterns) {
                if rule.pattern.is_some() == rule.regex.is_some() {
                    return Err(format!(
                        "rule in `{}` must set exactly one of `pattern` or `regex`",
                        section
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Where the filter comes from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FilterSource {
    #[default]
    Builtin,
    Local(PathBuf),
    Remote(url::Url),
}

impl FilterSource {
    /// Classify a user-supplied location. An empty string means the default.
    pub fn parse(location: &str) -> Self {
        if location.is_empty() {
            return FilterSource::Builtin;
        }
        match url::Url::parse(location) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => FilterSource::Remote(url),
            _ => FilterSource::Local(PathBuf::from(location)),
        }
    }

    /// Load the filter. Network and parse failures are fatal.
    pub async fn resolve(&self) -> Result<FileFilter> {
        match self {
            FilterSource::Builtin => {
                debug!("Using the built-in filter config");
                Ok(FileFilter::builtin())
            }
            FilterSource::Local(path) => load_local(path).await,
            FilterSource::Remote(url) => fetch_remote(url, REMOTE_FETCH_TIMEOUT).await,
        }
    }
}

async fn load_local(path: &Path) -> Result<FileFilter> {
    let invalid = |reason: String| BuildError::InvalidConfig {
        path: path.to_path_buf(),
        reason,
    };
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| invalid(e.to_string()))?;
    FileFilter::from_yaml(&content).map_err(invalid)
}

/// Fetch and parse a filter config over HTTP.
pub async fn fetch_remote(url: &url::Url, timeout: Duration) -> Result<FileFilter> {
    let failed = |reason: String| BuildError::RemoteConfigFetchFailed {
        url: url.to_string(),
        reason,
    };

    info!("Fetching filter config from {}", url);

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| failed(e.to_string()))?;

    if !response.status().is_success() {
        return Err(failed(format!("server returned {}", response.status())));
    }

    let content = response.text().await.map_err(|e| failed(e.to_string()))?;
    FileFilter::from_yaml(&content).map_err(failed)
}
