//! Event-bus protocol shared by all runtime components.
//!
//! This module defines the message payloads exchanged between the library
//! write worker, the catalog aggregator, the playback session and the
//! download coordinator, plus the small state enums they publish.

use crate::song::Song;

/// One of the independently populated song collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceList {
    Local,
    Trending,
    SearchResults,
    ActivePlaylist,
}

/// Transport state of the active playback session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    #[default]
    Idle,
    Playing,
    Paused,
}

/// Attachment state between the session and the playback device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindingState {
    #[default]
    Unbound,
    Binding,
    Bound,
}

/// Top-level envelope for all bus traffic.
#[derive(Debug, Clone)]
pub enum Message {
    Library(LibraryMessage),
    Catalog(CatalogMessage),
    Session(SessionMessage),
    Download(DownloadMessage),
}

/// Persistence commands and their notifications.
#[derive(Debug, Clone)]
pub enum LibraryMessage {
    CreatePlaylist {
        name: String,
    },
    PlaylistCreated {
        playlist_id: i64,
        name: String,
    },
    DeletePlaylist {
        playlist_id: i64,
    },
    PlaylistDeleted {
        playlist_id: i64,
    },
    AddSongToPlaylist {
        playlist_id: i64,
        song: Song,
    },
    SongAddedToPlaylist {
        playlist_id: i64,
        song_id: i64,
    },
    RemoveSongFromPlaylist {
        playlist_id: i64,
        song_id: i64,
    },
    SongRemovedFromPlaylist {
        playlist_id: i64,
        song_id: i64,
    },
    /// Asks which playlists already hold a song, e.g. for an "add to
    /// playlist" picker.
    RequestPlaylistsForSong {
        song_id: i64,
    },
    PlaylistsForSong {
        song_id: i64,
        playlist_ids: Vec<i64>,
    },
    RemoveDownload {
        remote_track_id: i64,
    },
    DownloadRemoved {
        remote_track_id: i64,
    },
    WriteFailed {
        operation: String,
        error: String,
    },
}

/// Catalog list notifications.
#[derive(Debug, Clone)]
pub enum CatalogMessage {
    /// Full replacement snapshot of one source list.
    ListUpdated {
        source: SourceList,
        songs: Vec<Song>,
    },
    FolderFilterChanged(Option<String>),
}

/// Observable playback session state.
#[derive(Debug, Clone)]
pub enum SessionMessage {
    BindingChanged(BindingState),
    QueueChanged {
        source: Option<SourceList>,
        length: usize,
        cursor: Option<usize>,
    },
    CurrentSongChanged(Option<Song>),
    TransportChanged(TransportState),
    PositionChanged {
        position_ms: u64,
        queue_index: usize,
    },
}

/// Download lifecycle notifications.
#[derive(Debug, Clone)]
pub enum DownloadMessage {
    Started {
        fetch_id: u64,
        remote_track_id: i64,
    },
    Completed {
        fetch_id: u64,
        remote_track_id: i64,
        local_file_path: String,
    },
    Failed {
        fetch_id: u64,
        remote_track_id: i64,
        error: String,
    },
}
