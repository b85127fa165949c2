//! Catalog aggregation: the four browsable song lists and the lookups the
//! playback session uses to find a song across them.
//!
//! Lists are refreshed on worker threads. Each refresh is tagged with a
//! per-list generation taken when it is issued; a response whose generation
//! has since been superseded is dropped, so a slow search can never overwrite
//! the results of a newer one. Provider failures empty the list instead of
//! surfacing an error.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};

use log::{debug, error, trace, warn};
use tokio::sync::broadcast::{error::RecvError, Receiver, Sender};

use crate::{
    error::ProviderError,
    library_store::LibraryStore,
    live_query::{LiveQuery, Table},
    protocol::{self, CatalogMessage, SourceList},
    song::Song,
};

/// Record returned by the local catalog provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRecord {
    pub native_id: i64,
    pub title: String,
    pub artist: String,
    pub duration_ms: u64,
    pub path: String,
    pub album_id: Option<i64>,
    pub album_art_location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteArtist {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAlbum {
    pub title: String,
    pub cover_url: Option<String>,
}

/// Track returned by the remote catalog provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: i64,
    pub title: String,
    pub duration_s: u32,
    pub preview_url: String,
    pub artist: RemoteArtist,
    pub album: RemoteAlbum,
}

/// Songs stored on the device. Blocking; always called off the caller's
/// thread.
pub trait LocalCatalogProvider: Send + Sync {
    fn query(&self, folder_filter: Option<&str>) -> Result<Vec<LocalRecord>, ProviderError>;
}

/// Remote search and chart endpoints. Blocking.
pub trait RemoteCatalogProvider: Send + Sync {
    fn search(&self, query: &str) -> Result<Vec<RemoteTrack>, ProviderError>;
    fn trending(&self) -> Result<Vec<RemoteTrack>, ProviderError>;
}

/// Handle to a refresh running in the background.
#[must_use = "dropping the handle detaches the refresh; call wait() to block on it"]
pub struct PendingRefresh(Option<JoinHandle<()>>);

impl PendingRefresh {
    fn done() -> Self {
        Self(None)
    }

    /// Blocks until the refresh has been applied or discarded.
    pub fn wait(self) {
        if let Some(handle) = self.0 {
            if handle.join().is_err() {
                error!("Catalog refresh worker panicked");
            }
        }
    }
}

/// Reduces a folder selection to the name matched against local paths.
///
/// Document-tree style selections (`primary:Music/Download`) keep the text
/// after the last `:`; plain paths keep their last segment.
pub fn normalize_folder_selection(selection: &str) -> Option<String> {
    let selection = selection.trim();
    let name = match selection.rfind(':') {
        Some(index) => &selection[index + 1..],
        None => selection
            .trim_end_matches(['/', '\\'])
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default(),
    };
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_string())
}

#[derive(Default)]
struct CatalogLists {
    local: Vec<Song>,
    trending: Vec<Song>,
    search_results: Vec<Song>,
    active_playlist: Vec<Song>,
    active_playlist_id: Option<i64>,
    folder_filter: Option<String>,
    local_generation: u64,
    trending_generation: u64,
    search_generation: u64,
    playlist_generation: u64,
}

impl CatalogLists {
    fn songs(&self, source: SourceList) -> &Vec<Song> {
        match source {
            SourceList::Local => &self.local,
            SourceList::Trending => &self.trending,
            SourceList::SearchResults => &self.search_results,
            SourceList::ActivePlaylist => &self.active_playlist,
        }
    }

    fn songs_mut(&mut self, source: SourceList) -> &mut Vec<Song> {
        match source {
            SourceList::Local => &mut self.local,
            SourceList::Trending => &mut self.trending,
            SourceList::SearchResults => &mut self.search_results,
            SourceList::ActivePlaylist => &mut self.active_playlist,
        }
    }

    fn generation_mut(&mut self, source: SourceList) -> &mut u64 {
        match source {
            SourceList::Local => &mut self.local_generation,
            SourceList::Trending => &mut self.trending_generation,
            SourceList::SearchResults => &mut self.search_generation,
            SourceList::ActivePlaylist => &mut self.playlist_generation,
        }
    }

    fn next_generation(&mut self, source: SourceList) -> u64 {
        let generation = self.generation_mut(source);
        *generation = generation.wrapping_add(1);
        *generation
    }
}

struct CatalogInner {
    local_provider: Arc<dyn LocalCatalogProvider>,
    remote_provider: Arc<dyn RemoteCatalogProvider>,
    store: LibraryStore,
    lists: Mutex<CatalogLists>,
    downloaded_ids: LiveQuery<HashSet<i64>>,
    bus_producer: Sender<protocol::Message>,
}

impl CatalogInner {
    fn lists(&self) -> MutexGuard<'_, CatalogLists> {
        self.lists.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `songs` unless a newer request for `source` was issued after
    /// `generation`.
    fn apply(&self, source: SourceList, generation: u64, songs: Vec<Song>) -> bool {
        let mut lists = self.lists();
        if *lists.generation_mut(source) != generation {
            debug!(
                "Catalog: discarding stale {:?} response (generation {})",
                source, generation
            );
            return false;
        }
        *lists.songs_mut(source) = songs.clone();
        let _ = self.bus_producer.send(protocol::Message::Catalog(
            CatalogMessage::ListUpdated { source, songs },
        ));
        true
    }

    fn load_active_playlist(&self, playlist_id: i64) -> Vec<Song> {
        match self.store.members(playlist_id) {
            Ok(members) => members.iter().map(Song::from_member).collect(),
            Err(err) => {
                warn!(
                    "Catalog: failed to load members of playlist {}: {}",
                    playlist_id, err
                );
                Vec::new()
            }
        }
    }

    /// Re-reads the active playlist after a membership change.
    fn reload_active_playlist(&self) {
        let (playlist_id, generation) = {
            let lists = self.lists();
            match lists.active_playlist_id {
                Some(id) => (id, lists.playlist_generation),
                None => return,
            }
        };
        match self.store.playlist(playlist_id) {
            Ok(Some(_)) => {
                let songs = self.load_active_playlist(playlist_id);
                self.apply(SourceList::ActivePlaylist, generation, songs);
            }
            Ok(None) => {
                debug!("Catalog: active playlist {} was deleted", playlist_id);
                let mut lists = self.lists();
                if lists.playlist_generation == generation {
                    lists.active_playlist_id = None;
                    lists.active_playlist.clear();
                    let _ = self.bus_producer.send(protocol::Message::Catalog(
                        CatalogMessage::ListUpdated {
                            source: SourceList::ActivePlaylist,
                            songs: Vec::new(),
                        },
                    ));
                }
            }
            Err(err) => warn!(
                "Catalog: failed to look up playlist {}: {}",
                playlist_id, err
            ),
        }
    }
}

/// Shared handle to the four catalog lists.
#[derive(Clone)]
pub struct CatalogAggregator {
    inner: Arc<CatalogInner>,
}

impl CatalogAggregator {
    pub fn new(
        local_provider: Arc<dyn LocalCatalogProvider>,
        remote_provider: Arc<dyn RemoteCatalogProvider>,
        store: LibraryStore,
        bus_producer: Sender<protocol::Message>,
        folder_filter: Option<String>,
    ) -> Self {
        let changes = store.subscribe_changes();
        let downloaded_ids = store.list_downloaded_ids();
        let inner = Arc::new(CatalogInner {
            local_provider,
            remote_provider,
            store,
            lists: Mutex::new(CatalogLists {
                folder_filter,
                ..CatalogLists::default()
            }),
            downloaded_ids,
            bus_producer,
        });
        spawn_playlist_follower(Arc::downgrade(&inner), changes);
        Self { inner }
    }

    fn spawn_refresh<F>(&self, source: SourceList, fetch: F) -> PendingRefresh
    where
        F: FnOnce(&CatalogInner) -> Vec<Song> + Send + 'static,
    {
        let generation = self.inner.lists().next_generation(source);
        let inner = Arc::clone(&self.inner);
        PendingRefresh(Some(thread::spawn(move || {
            let songs = fetch(&inner);
            trace!("Catalog: {:?} refresh returned {} song(s)", source, songs.len());
            inner.apply(source, generation, songs);
        })))
    }

    /// Re-queries the local provider with the current folder filter.
    pub fn refresh_local(&self) -> PendingRefresh {
        let folder_filter = self.folder_filter();
        self.spawn_refresh(SourceList::Local, move |inner| {
            match inner.local_provider.query(folder_filter.as_deref()) {
                Ok(records) => records.iter().map(Song::from_local_record).collect(),
                Err(err) => {
                    warn!("Catalog: local catalog query failed: {}", err);
                    Vec::new()
                }
            }
        })
    }

    pub fn refresh_trending(&self) -> PendingRefresh {
        self.spawn_refresh(SourceList::Trending, |inner| {
            match inner.remote_provider.trending() {
                Ok(tracks) => tracks.iter().map(Song::from_remote_track).collect(),
                Err(err) => {
                    warn!("Catalog: trending request failed: {}", err);
                    Vec::new()
                }
            }
        })
    }

    /// Replaces the search results with the results for `query`. A blank
    /// query clears them without contacting the provider.
    pub fn search(&self, query: &str) -> PendingRefresh {
        let query = query.trim().to_string();
        if query.is_empty() {
            let generation = self.inner.lists().next_generation(SourceList::SearchResults);
            self.inner
                .apply(SourceList::SearchResults, generation, Vec::new());
            return PendingRefresh::done();
        }
        self.spawn_refresh(SourceList::SearchResults, move |inner| {
            match inner.remote_provider.search(&query) {
                Ok(tracks) => tracks.iter().map(Song::from_remote_track).collect(),
                Err(err) => {
                    warn!("Catalog: search for {:?} failed: {}", query, err);
                    Vec::new()
                }
            }
        })
    }

    /// Applies a new folder selection and refreshes the local list.
    pub fn set_folder_filter(&self, selection: Option<&str>) -> PendingRefresh {
        let folder_filter = selection.and_then(normalize_folder_selection);
        self.inner.lists().folder_filter = folder_filter.clone();
        debug!("Catalog: folder filter set to {:?}", folder_filter);
        let _ = self.inner.bus_producer.send(protocol::Message::Catalog(
            CatalogMessage::FolderFilterChanged(folder_filter),
        ));
        self.refresh_local()
    }

    pub fn folder_filter(&self) -> Option<String> {
        self.inner.lists().folder_filter.clone()
    }

    /// Makes `playlist_id` the active playlist and keeps it in sync with
    /// membership changes until another playlist is opened or it is closed.
    pub fn open_playlist(&self, playlist_id: i64) {
        let generation = {
            let mut lists = self.inner.lists();
            lists.active_playlist_id = Some(playlist_id);
            lists.next_generation(SourceList::ActivePlaylist)
        };
        let songs = self.inner.load_active_playlist(playlist_id);
        self.inner
            .apply(SourceList::ActivePlaylist, generation, songs);
    }

    pub fn close_playlist(&self) {
        let generation = {
            let mut lists = self.inner.lists();
            lists.active_playlist_id = None;
            lists.next_generation(SourceList::ActivePlaylist)
        };
        self.inner
            .apply(SourceList::ActivePlaylist, generation, Vec::new());
    }

    pub fn active_playlist_id(&self) -> Option<i64> {
        self.inner.lists().active_playlist_id
    }

    pub fn list(&self, source: SourceList) -> Vec<Song> {
        self.inner.lists().songs(source).clone()
    }

    pub fn local_songs(&self) -> Vec<Song> {
        self.list(SourceList::Local)
    }

    pub fn trending(&self) -> Vec<Song> {
        self.list(SourceList::Trending)
    }

    pub fn search_results(&self) -> Vec<Song> {
        self.list(SourceList::SearchResults)
    }

    pub fn active_playlist(&self) -> Vec<Song> {
        self.list(SourceList::ActivePlaylist)
    }

    /// Finds the first list in `order` containing `song_id` and returns that
    /// list with the song's index in it.
    pub fn locate(
        &self,
        song_id: i64,
        order: &[SourceList],
    ) -> Option<(SourceList, Vec<Song>, usize)> {
        let lists = self.inner.lists();
        order.iter().find_map(|source| {
            let songs = lists.songs(*source);
            songs
                .iter()
                .position(|song| song.id == song_id)
                .map(|index| (*source, songs.clone(), index))
        })
    }

    /// First song with `song_id` across the lists in `order`.
    pub fn resolve(&self, song_id: i64, order: &[SourceList]) -> Option<Song> {
        let lists = self.inner.lists();
        order.iter().find_map(|source| {
            lists
                .songs(*source)
                .iter()
                .find(|song| song.id == song_id)
                .cloned()
        })
    }

    /// Whether a downloaded record exists for the song's remote track.
    pub fn is_marked_downloaded(&self, song: &Song) -> bool {
        match song.remote_track_id {
            Some(remote_track_id) => self
                .inner
                .downloaded_ids
                .with_current(|ids| ids.contains(&remote_track_id)),
            None => false,
        }
    }

    pub fn downloaded_ids(&self) -> HashSet<i64> {
        self.inner.downloaded_ids.current()
    }
}

fn spawn_playlist_follower(inner: Weak<CatalogInner>, mut changes: Receiver<Table>) {
    thread::spawn(move || loop {
        let relevant = match changes.blocking_recv() {
            Ok(table) => matches!(table, Table::Playlists | Table::PlaylistMembers),
            Err(RecvError::Lagged(_)) => true,
            Err(RecvError::Closed) => break,
        };
        let Some(catalog) = inner.upgrade() else {
            break;
        };
        if relevant {
            catalog.reload_active_playlist();
        }
    });
}
