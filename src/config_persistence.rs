use std::path::{Path, PathBuf};

use log::{info, warn};
use toml_edit::{value, DocumentMut, Item, Table};

use crate::{
    config::{
        sanitize_config, Config, APP_DIR_NAME, CONFIG_FILE_NAME, DATABASE_FILE_NAME,
        DOWNLOAD_FOLDER_NAME,
    },
    error::ConfigError,
};

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
        .ok_or(ConfigError::MissingConfigDir)
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ConfigError + '_ {
    move |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Loads the config at `path`, writing the defaults there first if the file
/// does not exist. An unparseable file is left alone and the defaults are
/// used instead.
pub fn load_or_create(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        let default_config = Config::default();
        std::fs::write(path, toml::to_string_pretty(&default_config)?).map_err(io_error(path))?;
        info!("Wrote default configuration to {}", path.display());
        return Ok(default_config);
    }

    let text = std::fs::read_to_string(path).map_err(io_error(path))?;
    match toml::from_str::<Config>(&text) {
        Ok(config) => Ok(sanitize_config(config)),
        Err(err) => {
            warn!(
                "Failed to parse config {} ({}). Using defaults.",
                path.display(),
                err
            );
            Ok(Config::default())
        }
    }
}

fn fallback_music_dir() -> PathBuf {
    dirs::audio_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Music")))
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn resolve_music_root(config: &Config) -> PathBuf {
    config
        .library
        .music_root
        .clone()
        .unwrap_or_else(fallback_music_dir)
}

pub fn resolve_download_dir(config: &Config) -> PathBuf {
    config
        .downloads
        .directory
        .clone()
        .unwrap_or_else(|| fallback_music_dir().join(DOWNLOAD_FOLDER_NAME))
}

pub fn resolve_database_path(config: &Config) -> PathBuf {
    if let Some(path) = &config.storage.database_path {
        return path.clone();
    }
    match dirs::data_dir() {
        Some(dir) => dir.join(APP_DIR_NAME).join(DATABASE_FILE_NAME),
        None => {
            warn!("No user data directory; keeping the library database in the working directory");
            PathBuf::from(DATABASE_FILE_NAME)
        }
    }
}

fn set_table_value_preserving_decor(table: &mut Table, key: &str, item: Item) {
    let existing_value_decor = table
        .get(key)
        .and_then(|current| current.as_value().map(|value| value.decor().clone()));
    table[key] = item;
    if let Some(existing_value_decor) = existing_value_decor {
        if let Some(next_value) = table[key].as_value_mut() {
            *next_value.decor_mut() = existing_value_decor;
        }
    }
}

fn ensure_section_table(document: &mut DocumentMut, key: &str) {
    let root = document.as_table_mut();
    let should_replace = !matches!(root.get(key), Some(item) if item.is_table());
    if should_replace {
        root.insert(key, Item::Table(Table::new()));
    }
}

/// Rewrites `library.folder_filter` in a config document, keeping every other
/// key and comment as written.
pub fn set_folder_filter_in_document(
    existing_text: &str,
    folder_filter: Option<&str>,
) -> Result<String, ConfigError> {
    let mut document = existing_text.parse::<DocumentMut>()?;
    ensure_section_table(&mut document, "library");
    if let Some(library) = document
        .as_table_mut()
        .get_mut("library")
        .and_then(Item::as_table_mut)
    {
        match folder_filter {
            Some(folder) => {
                set_table_value_preserving_decor(library, "folder_filter", value(folder))
            }
            None => {
                library.remove("folder_filter");
            }
        }
    }
    Ok(document.to_string())
}

pub fn persist_folder_filter(path: &Path, folder_filter: Option<&str>) -> Result<(), ConfigError> {
    let existing_text = if path.exists() {
        std::fs::read_to_string(path).map_err(io_error(path))?
    } else {
        String::new()
    };
    let updated_text = set_folder_filter_in_document(&existing_text, folder_filter)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    std::fs::write(path, updated_text).map_err(io_error(path))
}
