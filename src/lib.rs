//! Playback session and library synchronization engine.
//!
//! The crate keeps four song catalogs (local files, remote trending, remote
//! search results and the open playlist) in one id space, drives a playback
//! device through a mirrored queue, and persists playlists and downloaded
//! tracks in SQLite with live, self-refreshing queries.

pub mod app_bootstrap;
pub mod backends;
pub mod catalog;
pub mod config;
pub mod config_persistence;
pub mod device;
pub mod download;
pub mod error;
pub mod library_manager;
pub mod library_store;
pub mod live_query;
pub mod playback_session;
pub mod protocol;
pub mod queue;
pub mod song;

#[cfg(test)]
mod test_support;

pub use app_bootstrap::services::{EngineCollaborators, EngineServices};
pub use config::{sanitize_config, Config};
pub use song::Song;
