use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum SearchError {
    #[error("search query is empty")]
    EmptyQuery,
    #[error("invalid search pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
    #[error("match engine panicked: {0}")]
    EnginePanicked(String),
    #[error("match engine worker is unavailable")]
    WorkerUnavailable,
    #[error("match {index} out of range ({count} matches)")]
    MatchOutOfRange { index: usize, count: usize },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config file {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
