//! Canonical song representation and the cross-source id scheme.
//!
//! Local songs keep the local catalog's native id. Remote songs, and every
//! record derived from one (downloads, playlist memberships), use
//! `remote_track_id + REMOTE_ID_OFFSET` so a logical track keeps one id
//! whether it plays from the network or from the local cache.

use crate::catalog::{LocalRecord, RemoteTrack};
use crate::device::QueueItem;
use crate::library_store::{DownloadedTrack, PlaylistMember};

/// Added to remote track ids to keep them disjoint from local ids.
pub const REMOTE_ID_OFFSET: i64 = 1_000_000_000_000;

/// Returns the song id a remote track maps to.
pub fn remote_song_id(remote_track_id: i64) -> i64 {
    remote_track_id + REMOTE_ID_OFFSET
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Song {
    pub id: i64,
    pub title: String,
    pub artist: String,
    pub duration_ms: u64,
    /// URI or filesystem path the playback device can open.
    pub playable_location: String,
    pub album_art_location: Option<String>,
    pub is_local: bool,
    /// Present only for remote-origin tracks.
    pub remote_track_id: Option<i64>,
    pub album_name: Option<String>,
}

impl Song {
    pub fn from_remote_track(track: &RemoteTrack) -> Self {
        Self {
            id: remote_song_id(track.id),
            title: track.title.clone(),
            artist: track.artist.name.clone(),
            duration_ms: u64::from(track.duration_s) * 1000,
            playable_location: track.preview_url.clone(),
            album_art_location: track.album.cover_url.clone(),
            is_local: false,
            remote_track_id: Some(track.id),
            album_name: Some(track.album.title.clone()),
        }
    }

    /// Rebuilds a downloaded remote track. It now plays from the local file
    /// but keeps its remote identity.
    pub fn from_downloaded(record: &DownloadedTrack) -> Self {
        Self {
            id: remote_song_id(record.remote_track_id),
            title: record.title.clone(),
            artist: record.artist.clone(),
            duration_ms: record.duration_ms,
            playable_location: record.local_file_path.clone(),
            album_art_location: record.album_art_location.clone(),
            is_local: true,
            remote_track_id: Some(record.remote_track_id),
            album_name: record.album_name.clone(),
        }
    }

    pub fn from_member(member: &PlaylistMember) -> Self {
        Self {
            id: member.song_id,
            title: member.title.clone(),
            artist: member.artist.clone(),
            duration_ms: member.duration_ms,
            playable_location: member.playable_location.clone(),
            album_art_location: member.album_art_location.clone(),
            is_local: member.is_local,
            remote_track_id: member.remote_track_id,
            album_name: member.album_name.clone(),
        }
    }

    pub fn from_local_record(record: &LocalRecord) -> Self {
        Self {
            id: record.native_id,
            title: record.title.clone(),
            artist: record.artist.clone(),
            duration_ms: record.duration_ms,
            playable_location: record.path.clone(),
            album_art_location: record.album_art_location.clone(),
            is_local: true,
            remote_track_id: None,
            album_name: None,
        }
    }

    pub fn is_remote_origin(&self) -> bool {
        self.remote_track_id.is_some()
    }

    pub fn to_queue_item(&self) -> QueueItem {
        QueueItem {
            id: self.id,
            location: self.playable_location.clone(),
            title: self.title.clone(),
            artist: self.artist.clone(),
            album_art_location: self.album_art_location.clone(),
        }
    }
}
