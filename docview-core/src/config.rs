use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::error::ConfigError;

/// Tunables for the whole search pipeline. Every section falls back to its
/// defaults when missing from `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub search: SearchConfig,
    pub window: WindowConfig,
    pub locator: LocatorConfig,
    pub highlight: HighlightConfig,
    pub render: RenderConfig,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "debounce_ms")]
    pub debounce: Duration,
    /// Queries shorter than this (in chars) never reach the engine.
    pub min_query_len: usize,
    pub max_matches: usize,
    pub case_sensitive: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(200),
            min_query_len: 2,
            max_matches: crate::engine::DEFAULT_MATCH_LIMIT,
            case_sensitive: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Pages kept materialized on each side of the most visible page.
    pub buffer: u32,
    pub min_visible_ratio: f32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            buffer: 2,
            min_visible_ratio: 0.25,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorConfig {
    pub initial_radius: u32,
    pub widened_radius: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "probe_delay_ms")]
    pub probe_delay: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "retry_step_ms")]
    pub retry_step: Duration,
    pub max_attempts: u32,
    pub widened_attempts: u32,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            initial_radius: 5,
            widened_radius: 10,
            probe_delay: Duration::from_millis(120),
            retry_step: Duration::from_millis(100),
            max_attempts: 5,
            widened_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HighlightConfig {
    pub pages_per_step: usize,
}

impl Default for HighlightConfig {
    fn default() -> Self {
        Self { pages_per_step: 4 }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Delay between a page entering the window and its text layer being queryable.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "latency_ms")]
    pub latency: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "retry_delay_ms")]
    pub retry_delay: Duration,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(40),
            retry_delay: Duration::from_millis(250),
        }
    }
}

impl ViewerConfig {
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("net", "docview", "docview")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Like [`ViewerConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    #[test]
    fn partial_config_keeps_defaults_for_missing_keys() {
        let raw = r#"
            [search]
            debounce_ms = 350

            [locator]
            widened_radius = 12
        "#;
        let config: ViewerConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.search.debounce, Duration::from_millis(350));
        assert_eq!(config.search.min_query_len, 2);
        assert_eq!(config.locator.widened_radius, 12);
        assert_eq!(config.locator.initial_radius, 5);
        assert_eq!(config.window, WindowConfig::default());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let config = ViewerConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, ViewerConfig::default());
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[search\ndebounce_ms = ").unwrap();
        match ViewerConfig::load(&path) {
            Err(ConfigError::Parse { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn config_round_trips_through_toml() {
        let mut config = ViewerConfig::default();
        config.render.latency = Duration::from_millis(5);
        let encoded = toml::to_string(&config).unwrap();
        assert!(encoded.contains("latency_ms = 5"));
        let decoded: ViewerConfig = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded, config);
    }
}
