//! Durable storage for playlists, playlist membership and downloaded tracks.
//!
//! All writes are upserts keyed the way the tables are keyed, so repeating a
//! write never duplicates a row. Every committed write announces the tables
//! it touched so open `LiveQuery` subscriptions re-emit their snapshot.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::live_query::{LiveQuery, Table};
use crate::song::Song;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Playlist {
    pub id: i64,
    pub name: String,
    /// Unix time in milliseconds.
    pub created_at: i64,
}

/// One song inside one playlist, with the song's metadata denormalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistMember {
    pub playlist_id: i64,
    pub song_id: i64,
    pub title: String,
    pub artist: String,
    pub duration_ms: u64,
    pub playable_location: String,
    pub album_art_location: Option<String>,
    pub is_local: bool,
    pub remote_track_id: Option<i64>,
    pub album_name: Option<String>,
    /// Unix time in milliseconds.
    pub added_at: i64,
}

impl PlaylistMember {
    pub fn from_song(playlist_id: i64, song: &Song) -> Self {
        Self {
            playlist_id,
            song_id: song.id,
            title: song.title.clone(),
            artist: song.artist.clone(),
            duration_ms: song.duration_ms,
            playable_location: song.playable_location.clone(),
            album_art_location: song.album_art_location.clone(),
            is_local: song.is_local,
            remote_track_id: song.remote_track_id,
            album_name: song.album_name.clone(),
            added_at: unix_time_ms(),
        }
    }
}

/// A remote track cached on local storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedTrack {
    pub remote_track_id: i64,
    pub title: String,
    pub artist: String,
    pub album_name: Option<String>,
    pub album_art_location: Option<String>,
    pub local_file_path: String,
    pub duration_ms: u64,
    /// Unix time in milliseconds.
    pub downloaded_at: i64,
}

pub(crate) fn unix_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

/// Shared handle to the library database.
#[derive(Clone)]
pub struct LibraryStore {
    conn: Arc<Mutex<Connection>>,
    changes: broadcast::Sender<Table>,
}

impl LibraryStore {
    /// Opens (creating if needed) the database file at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let conn = Connection::open(path)?;
        info!("Opened library database at {}", path.display());
        Self::from_connection(conn)
    }

    pub fn new_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        initialize_schema(&conn)?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            changes,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn notify(&self, tables: &[Table]) {
        for table in tables {
            // No receivers simply means nobody is watching.
            let _ = self.changes.send(*table);
        }
    }

    /// Raw table-change notifications, one message per touched table.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<Table> {
        self.changes.subscribe()
    }

    fn live<T, F>(&self, name: &str, tables: &'static [Table], query: F) -> LiveQuery<T>
    where
        T: Clone + Default + Send + Sync + 'static,
        F: Fn(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let changes = self.changes.subscribe();
        let conn = Arc::clone(&self.conn);
        LiveQuery::spawn(name, tables, changes, move || {
            let guard = conn.lock().map_err(|_| StoreError::LockPoisoned)?;
            Ok(query(&*guard)?)
        })
    }

    // Playlists

    /// Live list of playlists, newest first.
    pub fn list_playlists(&self) -> LiveQuery<Vec<Playlist>> {
        self.live("playlists", &[Table::Playlists], query_playlists)
    }

    pub fn playlists(&self) -> Result<Vec<Playlist>, StoreError> {
        let conn = self.lock()?;
        Ok(query_playlists(&conn)?)
    }

    pub fn playlist(&self, playlist_id: i64) -> Result<Option<Playlist>, StoreError> {
        let conn = self.lock()?;
        let playlist = conn
            .query_row(
                "SELECT id, name, created_at FROM playlists WHERE id = ?1",
                params![playlist_id],
                playlist_from_row,
            )
            .optional()?;
        Ok(playlist)
    }

    /// Creates a playlist and returns its generated id. Names are free text
    /// and need not be unique.
    pub fn create_playlist(&self, name: &str) -> Result<i64, StoreError> {
        let id = {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO playlists (name, created_at) VALUES (?1, ?2)",
                params![name, unix_time_ms()],
            )?;
            conn.last_insert_rowid()
        };
        debug!("Created playlist {} ({})", name, id);
        self.notify(&[Table::Playlists]);
        Ok(id)
    }

    /// Deletes a playlist together with all of its membership rows.
    pub fn delete_playlist(&self, playlist_id: i64) -> Result<(), StoreError> {
        {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM playlist_members WHERE playlist_id = ?1",
                params![playlist_id],
            )?;
            tx.execute("DELETE FROM playlists WHERE id = ?1", params![playlist_id])?;
            tx.commit()?;
        }
        debug!("Deleted playlist {}", playlist_id);
        self.notify(&[Table::Playlists, Table::PlaylistMembers]);
        Ok(())
    }

    // Membership

    /// Live membership of one playlist, most recently added first.
    pub fn list_members(&self, playlist_id: i64) -> LiveQuery<Vec<PlaylistMember>> {
        self.live(
            "playlist_members",
            &[Table::PlaylistMembers],
            move |conn: &Connection| query_members(conn, playlist_id),
        )
    }

    pub fn members(&self, playlist_id: i64) -> Result<Vec<PlaylistMember>, StoreError> {
        let conn = self.lock()?;
        Ok(query_members(&conn, playlist_id)?)
    }

    /// Inserts or replaces the row keyed by `(playlist_id, song_id)`.
    pub fn add_member(&self, member: &PlaylistMember) -> Result<(), StoreError> {
        {
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR REPLACE INTO playlist_members (
                    playlist_id, song_id, title, artist, duration, path, album_art_uri,
                    is_local, remote_track_id, album_name, added_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    member.playlist_id,
                    member.song_id,
                    member.title,
                    member.artist,
                    member.duration_ms as i64,
                    member.playable_location,
                    member.album_art_location,
                    member.is_local,
                    member.remote_track_id,
                    member.album_name,
                    member.added_at,
                ],
            )?;
        }
        self.notify(&[Table::PlaylistMembers]);
        Ok(())
    }

    /// Removes one membership row; absent rows are not an error.
    pub fn remove_member(&self, playlist_id: i64, song_id: i64) -> Result<(), StoreError> {
        let removed = {
            let conn = self.lock()?;
            conn.execute(
                "DELETE FROM playlist_members WHERE playlist_id = ?1 AND song_id = ?2",
                params![playlist_id, song_id],
            )?
        };
        if removed > 0 {
            self.notify(&[Table::PlaylistMembers]);
        }
        Ok(())
    }

    pub fn member_count(&self, playlist_id: i64) -> LiveQuery<usize> {
        self.live(
            "playlist_member_count",
            &[Table::PlaylistMembers],
            move |conn: &Connection| query_member_count(conn, playlist_id),
        )
    }

    pub fn count_members(&self, playlist_id: i64) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        Ok(query_member_count(&conn, playlist_id)?)
    }

    pub fn playlists_containing(&self, song_id: i64) -> Result<Vec<i64>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT playlist_id FROM playlist_members WHERE song_id = ?1")?;
        let ids = stmt
            .query_map(params![song_id], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn has_member(&self, playlist_id: i64, song_id: i64) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM playlist_members WHERE playlist_id = ?1 AND song_id = ?2",
            params![playlist_id, song_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // Downloads

    /// Live list of downloaded tracks, most recent first.
    pub fn list_downloads(&self) -> LiveQuery<Vec<DownloadedTrack>> {
        self.live("downloads", &[Table::Downloads], query_downloads)
    }

    pub fn downloads(&self) -> Result<Vec<DownloadedTrack>, StoreError> {
        let conn = self.lock()?;
        Ok(query_downloads(&conn)?)
    }

    /// Inserts or replaces the record keyed by `remote_track_id`.
    pub fn upsert_download(&self, record: &DownloadedTrack) -> Result<(), StoreError> {
        {
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR REPLACE INTO downloads (
                    remote_track_id, title, artist, album_name, album_art_url,
                    local_file_path, duration, downloaded_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.remote_track_id,
                    record.title,
                    record.artist,
                    record.album_name,
                    record.album_art_location,
                    record.local_file_path,
                    record.duration_ms as i64,
                    record.downloaded_at,
                ],
            )?;
        }
        self.notify(&[Table::Downloads]);
        Ok(())
    }

    pub fn remove_download(&self, remote_track_id: i64) -> Result<(), StoreError> {
        let removed = {
            let conn = self.lock()?;
            conn.execute(
                "DELETE FROM downloads WHERE remote_track_id = ?1",
                params![remote_track_id],
            )?
        };
        if removed > 0 {
            self.notify(&[Table::Downloads]);
        }
        Ok(())
    }

    pub fn is_downloaded(&self, remote_track_id: i64) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM downloads WHERE remote_track_id = ?1",
            params![remote_track_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Live set of remote track ids that have a downloaded record.
    pub fn list_downloaded_ids(&self) -> LiveQuery<HashSet<i64>> {
        self.live("downloaded_ids", &[Table::Downloads], query_downloaded_ids)
    }

    pub fn downloaded_ids(&self) -> Result<HashSet<i64>, StoreError> {
        let conn = self.lock()?;
        Ok(query_downloaded_ids(&conn)?)
    }
}

fn initialize_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS playlists (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS playlist_members (
            playlist_id INTEGER NOT NULL,
            song_id INTEGER NOT NULL,
            title TEXT NOT NULL,
            artist TEXT NOT NULL,
            duration INTEGER NOT NULL,
            path TEXT NOT NULL,
            album_art_uri TEXT,
            is_local INTEGER NOT NULL DEFAULT 1,
            remote_track_id INTEGER,
            album_name TEXT,
            added_at INTEGER NOT NULL,
            PRIMARY KEY (playlist_id, song_id),
            FOREIGN KEY (playlist_id) REFERENCES playlists(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_playlist_members_playlist
            ON playlist_members (playlist_id);

        CREATE TABLE IF NOT EXISTS downloads (
            remote_track_id INTEGER PRIMARY KEY NOT NULL,
            title TEXT NOT NULL,
            artist TEXT NOT NULL,
            album_name TEXT,
            album_art_url TEXT,
            local_file_path TEXT NOT NULL,
            duration INTEGER NOT NULL,
            downloaded_at INTEGER NOT NULL
        );",
    )
}

fn playlist_from_row(row: &Row<'_>) -> rusqlite::Result<Playlist> {
    Ok(Playlist {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: row.get(2)?,
    })
}

fn query_playlists(conn: &Connection) -> rusqlite::Result<Vec<Playlist>> {
    let mut stmt =
        conn.prepare("SELECT id, name, created_at FROM playlists ORDER BY created_at DESC, id DESC")?;
    let playlists = stmt
        .query_map([], playlist_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(playlists)
}

fn query_members(conn: &Connection, playlist_id: i64) -> rusqlite::Result<Vec<PlaylistMember>> {
    let mut stmt = conn.prepare(
        "SELECT playlist_id, song_id, title, artist, duration, path, album_art_uri,
                is_local, remote_track_id, album_name, added_at
         FROM playlist_members
         WHERE playlist_id = ?1
         ORDER BY added_at DESC, rowid DESC",
    )?;
    let members = stmt
        .query_map(params![playlist_id], |row| {
            Ok(PlaylistMember {
                playlist_id: row.get(0)?,
                song_id: row.get(1)?,
                title: row.get(2)?,
                artist: row.get(3)?,
                duration_ms: row.get::<_, i64>(4)?.max(0) as u64,
                playable_location: row.get(5)?,
                album_art_location: row.get(6)?,
                is_local: row.get(7)?,
                remote_track_id: row.get(8)?,
                album_name: row.get(9)?,
                added_at: row.get(10)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(members)
}

fn query_member_count(conn: &Connection, playlist_id: i64) -> rusqlite::Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM playlist_members WHERE playlist_id = ?1",
        params![playlist_id],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as usize)
}

fn query_downloads(conn: &Connection) -> rusqlite::Result<Vec<DownloadedTrack>> {
    let mut stmt = conn.prepare(
        "SELECT remote_track_id, title, artist, album_name, album_art_url,
                local_file_path, duration, downloaded_at
         FROM downloads
         ORDER BY downloaded_at DESC, rowid DESC",
    )?;
    let downloads = stmt
        .query_map([], |row| {
            Ok(DownloadedTrack {
                remote_track_id: row.get(0)?,
                title: row.get(1)?,
                artist: row.get(2)?,
                album_name: row.get(3)?,
                album_art_location: row.get(4)?,
                local_file_path: row.get(5)?,
                duration_ms: row.get::<_, i64>(6)?.max(0) as u64,
                downloaded_at: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(downloads)
}

fn query_downloaded_ids(conn: &Connection) -> rusqlite::Result<HashSet<i64>> {
    let mut stmt = conn.prepare("SELECT remote_track_id FROM downloads")?;
    let ids = stmt
        .query_map([], |row| row.get::<_, i64>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(ids)
}
