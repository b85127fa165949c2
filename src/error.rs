//! Error types for each boundary of the engine.
//!
//! Store, configuration and download operations propagate these with `?`.
//! Catalog and playback-session operations never surface them to callers:
//! they log and degrade instead.

use std::path::PathBuf;

use thiserror::Error;

/// Failures raised by the library store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(rusqlite::Error),

    /// A key or foreign-key constraint rejected a write. Upserts make this a
    /// modeling bug rather than a runtime condition.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("database connection lock poisoned")]
    LockPoisoned,

    #[error("failed to prepare database location {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if err.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation) {
            StoreError::ConstraintViolation(err.to_string())
        } else {
            StoreError::Sqlite(err)
        }
    }
}

/// Failures raised by local or remote catalog providers.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("catalog request failed: {0}")]
    Transport(String),

    #[error("catalog response could not be decoded: {0}")]
    Decode(String),

    #[error("catalog i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures raised while attaching to a playback device.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to connect to playback device: {0}")]
    ConnectFailed(String),
}

/// Failures raised by a blob fetcher.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch failed: {0}")]
    Transport(String),

    #[error("fetch i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures raised when starting a download.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("song {song_id} has no remote origin")]
    NotRemote { song_id: i64 },

    #[error("song {song_id} already plays from a local file")]
    AlreadyLocal { song_id: i64 },

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Failures raised while loading or persisting configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine the user configuration directory")]
    MissingConfigDir,

    #[error("config i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("config edit error: {0}")]
    Edit(#[from] toml_edit::TomlError),
}
