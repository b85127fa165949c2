//! Persistent engine configuration model and defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::backends::deezer::DEFAULT_API_BASE_URL;

pub const APP_DIR_NAME: &str = "playdeck";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DATABASE_FILE_NAME: &str = "library.db";
/// Folder under the music directory that downloads land in.
pub const DOWNLOAD_FOLDER_NAME: &str = "Playlist";

pub const MIN_POSITION_POLL_INTERVAL_MS: u64 = 100;
pub const MAX_POSITION_POLL_INTERVAL_MS: u64 = 999;

/// Root configuration persisted to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub downloads: DownloadsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local music scanning preferences.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LibraryConfig {
    /// Root scanned for local songs. Defaults to the user's music folder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub music_root: Option<PathBuf>,
    /// Only local songs whose path contains this folder name are listed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_filter: Option<String>,
}

/// Remote catalog endpoint settings.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RemoteConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PlaybackConfig {
    /// How often the playback position is sampled while bound.
    #[serde(default = "default_position_poll_interval_ms")]
    pub position_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct DownloadsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct StorageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LoggingConfig {
    /// One of `error`, `warn`, `info`, `debug`, `trace`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            position_poll_interval_ms: default_position_poll_interval_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl RemoteConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl PlaybackConfig {
    pub fn position_poll_interval(&self) -> Duration {
        Duration::from_millis(self.position_poll_interval_ms)
    }
}

impl LoggingConfig {
    /// Parsed level, falling back to `Info` for unknown names.
    pub fn level_filter(&self) -> log::LevelFilter {
        self.level.trim().parse().unwrap_or(log::LevelFilter::Info)
    }
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_read_timeout_secs() -> u64 {
    15
}

fn default_position_poll_interval_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Clamps values that would break the engine if taken literally.
pub fn sanitize_config(mut config: Config) -> Config {
    config.playback.position_poll_interval_ms = config
        .playback
        .position_poll_interval_ms
        .clamp(MIN_POSITION_POLL_INTERVAL_MS, MAX_POSITION_POLL_INTERVAL_MS);
    config.remote.connect_timeout_secs = config.remote.connect_timeout_secs.max(1);
    config.remote.read_timeout_secs = config.remote.read_timeout_secs.max(1);
    let api_base_url = config.remote.api_base_url.trim().trim_end_matches('/');
    config.remote.api_base_url = if api_base_url.is_empty() {
        default_api_base_url()
    } else {
        api_base_url.to_string()
    };
    config.library.folder_filter = config
        .library
        .folder_filter
        .map(|folder| folder.trim().to_string())
        .filter(|folder| !folder.is_empty());
    config
}
