//! Download coordinator: turns remote songs into cached local files.
//!
//! A download is registered under the fetch id the fetcher hands back. The
//! completion listener removes that registration when the matching completion
//! arrives, so each download is processed at most once and nothing is left
//! behind afterwards. The caller that started a download does not need to
//! stay around for it to be recorded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;

use log::{debug, error, info, trace, warn};
use tokio::sync::broadcast::{error::RecvError, Receiver, Sender};

use crate::{
    error::{DownloadError, FetchError},
    library_store::{unix_time_ms, DownloadedTrack, LibraryStore},
    protocol::{self, DownloadMessage},
    song::Song,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Succeeded,
    Failed(String),
}

/// Completion notice for one fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCompletion {
    pub fetch_id: u64,
    pub outcome: FetchOutcome,
}

/// Background URL-to-file fetcher.
pub trait BlobFetcher: Send + Sync {
    /// Starts fetching `url` into `destination` and returns the fetch id that
    /// its completion will carry.
    fn enqueue(&self, url: &str, destination: &Path) -> Result<u64, FetchError>;
    fn subscribe(&self) -> Receiver<FetchCompletion>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadHandle {
    pub fetch_id: u64,
    pub remote_track_id: i64,
    pub destination: PathBuf,
}

struct PendingDownload {
    song: Song,
    remote_track_id: i64,
    destination: PathBuf,
}

struct DownloadInner {
    fetcher: Arc<dyn BlobFetcher>,
    store: LibraryStore,
    download_dir: PathBuf,
    pending: Mutex<HashMap<u64, PendingDownload>>,
    bus_producer: Sender<protocol::Message>,
}

pub struct DownloadCoordinator {
    inner: Arc<DownloadInner>,
}

/// File name a song is downloaded under: `"{title} - {artist}.mp3"` with
/// every character outside `[A-Za-z0-9.-_ ]` replaced by `_`.
pub fn download_file_name(song: &Song) -> String {
    format!("{} - {}.mp3", song.title, song.artist)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl DownloadInner {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, PendingDownload>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, message: DownloadMessage) {
        let _ = self.bus_producer.send(protocol::Message::Download(message));
    }

    fn handle_completion(&self, completion: FetchCompletion) {
        let Some(download) = self.pending().remove(&completion.fetch_id) else {
            trace!(
                "DownloadCoordinator: ignoring completion for unknown fetch {}",
                completion.fetch_id
            );
            return;
        };
        let fetch_id = completion.fetch_id;
        let remote_track_id = download.remote_track_id;

        match completion.outcome {
            FetchOutcome::Succeeded => {
                let local_file_path = download.destination.to_string_lossy().into_owned();
                let record = DownloadedTrack {
                    remote_track_id,
                    title: download.song.title.clone(),
                    artist: download.song.artist.clone(),
                    album_name: download.song.album_name.clone(),
                    album_art_location: download.song.album_art_location.clone(),
                    local_file_path: local_file_path.clone(),
                    duration_ms: download.song.duration_ms,
                    downloaded_at: unix_time_ms(),
                };
                match self.store.upsert_download(&record) {
                    Ok(()) => {
                        info!(
                            "Downloaded {} - {} to {}",
                            record.title, record.artist, local_file_path
                        );
                        self.publish(DownloadMessage::Completed {
                            fetch_id,
                            remote_track_id,
                            local_file_path,
                        });
                    }
                    Err(err) => {
                        error!(
                            "DownloadCoordinator: failed to record download of track {}: {}",
                            remote_track_id, err
                        );
                        self.publish(DownloadMessage::Failed {
                            fetch_id,
                            remote_track_id,
                            error: err.to_string(),
                        });
                    }
                }
            }
            FetchOutcome::Failed(reason) => {
                warn!(
                    "DownloadCoordinator: fetch {} for track {} failed: {}",
                    fetch_id, remote_track_id, reason
                );
                self.publish(DownloadMessage::Failed {
                    fetch_id,
                    remote_track_id,
                    error: reason,
                });
            }
        }
    }

    /// Completes pending downloads whose file is already on disk. Used after
    /// completions were missed; the rest stay pending until their own
    /// completion arrives.
    fn settle_after_lag(&self) {
        let finished: Vec<u64> = self
            .pending()
            .iter()
            .filter(|(_, download)| download.destination.exists())
            .map(|(fetch_id, _)| *fetch_id)
            .collect();
        for fetch_id in finished {
            self.handle_completion(FetchCompletion {
                fetch_id,
                outcome: FetchOutcome::Succeeded,
            });
        }
    }
}

impl DownloadCoordinator {
    pub fn new(
        fetcher: Arc<dyn BlobFetcher>,
        store: LibraryStore,
        download_dir: PathBuf,
        bus_producer: Sender<protocol::Message>,
    ) -> Self {
        let completions = fetcher.subscribe();
        let inner = Arc::new(DownloadInner {
            fetcher,
            store,
            download_dir,
            pending: Mutex::new(HashMap::new()),
            bus_producer,
        });
        spawn_completion_listener(Arc::downgrade(&inner), completions);
        Self { inner }
    }

    pub fn download_dir(&self) -> &Path {
        &self.inner.download_dir
    }

    pub fn download_path(&self, song: &Song) -> PathBuf {
        self.inner.download_dir.join(download_file_name(song))
    }

    /// True when the song already plays from local storage or its download
    /// file is present.
    pub fn is_downloaded(&self, song: &Song) -> bool {
        song.is_local || self.download_path(song).exists()
    }

    /// Starts downloading a remote song's stream into the download directory.
    pub fn download(&self, song: &Song) -> Result<DownloadHandle, DownloadError> {
        let remote_track_id = song
            .remote_track_id
            .ok_or(DownloadError::NotRemote { song_id: song.id })?;
        if song.is_local {
            return Err(DownloadError::AlreadyLocal { song_id: song.id });
        }
        let destination = self.download_path(song);

        // Registering under the same lock keeps a fast completion from
        // arriving before its registration.
        let fetch_id = {
            let mut pending = self.inner.pending();
            let fetch_id = self
                .inner
                .fetcher
                .enqueue(&song.playable_location, &destination)?;
            pending.insert(
                fetch_id,
                PendingDownload {
                    song: song.clone(),
                    remote_track_id,
                    destination: destination.clone(),
                },
            );
            fetch_id
        };
        debug!(
            "DownloadCoordinator: fetch {} started for track {} -> {}",
            fetch_id,
            remote_track_id,
            destination.display()
        );
        self.inner.publish(DownloadMessage::Started {
            fetch_id,
            remote_track_id,
        });

        Ok(DownloadHandle {
            fetch_id,
            remote_track_id,
            destination,
        })
    }

    /// Downloads that have been started but not yet completed.
    pub fn pending_count(&self) -> usize {
        self.inner.pending().len()
    }
}

fn spawn_completion_listener(
    inner: Weak<DownloadInner>,
    mut completions: Receiver<FetchCompletion>,
) {
    thread::spawn(move || loop {
        match completions.blocking_recv() {
            Ok(completion) => {
                let Some(coordinator) = inner.upgrade() else {
                    break;
                };
                coordinator.handle_completion(completion);
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(
                    "DownloadCoordinator: missed {} fetch completion(s)",
                    skipped
                );
                let Some(coordinator) = inner.upgrade() else {
                    break;
                };
                coordinator.settle_after_lag();
            }
            Err(RecvError::Closed) => break,
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::song::remote_song_id;
    use crate::test_support::{
        assert_no_message, local_song, remote_song, wait_for_message, wait_until, FakeFetcher,
    };
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct DownloadHarness {
        coordinator: DownloadCoordinator,
        fetcher: Arc<FakeFetcher>,
        store: LibraryStore,
        receiver: Receiver<protocol::Message>,
        _dir: tempfile::TempDir,
    }

    impl DownloadHarness {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let (bus_sender, _) = broadcast::channel(256);
            let receiver = bus_sender.subscribe();
            let store = LibraryStore::new_in_memory().expect("in-memory store");
            let fetcher = Arc::new(FakeFetcher::new());
            let coordinator = DownloadCoordinator::new(
                fetcher.clone(),
                store.clone(),
                dir.path().join("Playlist"),
                bus_sender,
            );
            Self {
                coordinator,
                fetcher,
                store,
                receiver,
                _dir: dir,
            }
        }
    }

    #[test]
    fn test_download_file_name_replaces_unsafe_characters() {
        let mut song = remote_song(1, "Back/In: Black?");
        song.artist = "AC/DC".to_string();

        assert_eq!(download_file_name(&song), "Back_In_ Black_ - AC_DC.mp3");

        song.title = "Déjà Vu".to_string();
        song.artist = "Beyoncé".to_string();
        assert_eq!(download_file_name(&song), "D_j_ Vu - Beyonc_.mp3");
    }

    #[test]
    fn test_local_only_song_is_rejected() {
        let harness = DownloadHarness::new();

        let err = harness
            .coordinator
            .download(&local_song(3, "Local"))
            .expect_err("local songs have no remote origin");

        assert!(matches!(err, DownloadError::NotRemote { song_id: 3 }));
        assert!(harness.fetcher.enqueued().is_empty());
    }

    #[test]
    fn test_successful_completion_is_recorded_once() {
        let mut harness = DownloadHarness::new();
        let song = remote_song(3_135_556, "Harder Better");

        let handle = harness.coordinator.download(&song).expect("start download");
        let enqueued = harness.fetcher.enqueued();
        assert_eq!(enqueued.len(), 1);
        assert_eq!(enqueued[0].1, song.playable_location);
        assert_eq!(enqueued[0].2, handle.destination);
        assert_eq!(harness.coordinator.pending_count(), 1);

        harness
            .fetcher
            .complete(handle.fetch_id, FetchOutcome::Succeeded);
        wait_for_message(&mut harness.receiver, Duration::from_secs(1), |m| {
            matches!(
                m,
                protocol::Message::Download(DownloadMessage::Completed { fetch_id, .. })
                    if *fetch_id == handle.fetch_id
            )
        });

        let downloads = harness.store.downloads().expect("downloads");
        assert_eq!(downloads.len(), 1);
        assert_eq!(downloads[0].remote_track_id, 3_135_556);
        assert_eq!(
            Song::from_downloaded(&downloads[0]).id,
            remote_song_id(3_135_556)
        );
        assert_eq!(harness.coordinator.pending_count(), 0);

        harness
            .fetcher
            .complete(handle.fetch_id, FetchOutcome::Succeeded);
        assert_no_message(&mut harness.receiver, Duration::from_millis(100), |m| {
            matches!(m, protocol::Message::Download(DownloadMessage::Completed { .. }))
        });
        assert_eq!(harness.store.downloads().expect("downloads").len(), 1);
    }

    #[test]
    fn test_failed_fetch_records_nothing() {
        let mut harness = DownloadHarness::new();
        let handle = harness
            .coordinator
            .download(&remote_song(9, "Broken"))
            .expect("start download");

        harness.fetcher.complete(
            handle.fetch_id,
            FetchOutcome::Failed("connection reset".to_string()),
        );
        let message = wait_for_message(&mut harness.receiver, Duration::from_secs(1), |m| {
            matches!(m, protocol::Message::Download(DownloadMessage::Failed { .. }))
        });

        if let protocol::Message::Download(DownloadMessage::Failed { error, .. }) = message {
            assert_eq!(error, "connection reset");
        }
        assert!(harness.store.downloads().expect("downloads").is_empty());
        assert_eq!(harness.coordinator.pending_count(), 0);
    }

    #[test]
    fn test_unmatched_completion_is_ignored() {
        let harness = DownloadHarness::new();
        let handle = harness
            .coordinator
            .download(&remote_song(4, "Waiting"))
            .expect("start download");

        harness
            .fetcher
            .complete(handle.fetch_id + 100, FetchOutcome::Succeeded);
        harness
            .fetcher
            .complete(handle.fetch_id, FetchOutcome::Succeeded);

        wait_until(Duration::from_secs(1), || {
            harness.coordinator.pending_count() == 0
        });
        assert_eq!(harness.store.downloads().expect("downloads").len(), 1);
    }

    #[test]
    fn test_completion_is_recorded_after_caller_is_gone() {
        let harness = DownloadHarness::new();
        let fetch_id = {
            let song = remote_song(21, "Fire And Forget");
            harness
                .coordinator
                .download(&song)
                .expect("start download")
                .fetch_id
        };

        harness.fetcher.complete(fetch_id, FetchOutcome::Succeeded);

        wait_until(Duration::from_secs(1), || {
            harness.store.is_downloaded(21).unwrap_or(false)
        });
    }

    #[test]
    fn test_missed_completions_settle_downloads_already_on_disk() {
        let mut harness = DownloadHarness::new();
        let landed = harness
            .coordinator
            .download(&remote_song(31, "Landed"))
            .expect("start download");
        let in_flight = harness
            .coordinator
            .download(&remote_song(32, "In Flight"))
            .expect("start download");
        std::fs::create_dir_all(harness.coordinator.download_dir()).expect("create dir");
        std::fs::write(&landed.destination, b"ID3").expect("write file");

        harness.coordinator.inner.settle_after_lag();

        wait_for_message(&mut harness.receiver, Duration::from_secs(1), |m| {
            matches!(
                m,
                protocol::Message::Download(DownloadMessage::Completed { fetch_id, .. })
                    if *fetch_id == landed.fetch_id
            )
        });
        assert!(harness.store.is_downloaded(31).expect("is_downloaded"));
        assert!(!harness.store.is_downloaded(32).expect("is_downloaded"));
        assert_eq!(harness.coordinator.pending_count(), 1);

        harness
            .fetcher
            .complete(in_flight.fetch_id, FetchOutcome::Succeeded);
        wait_until(Duration::from_secs(1), || {
            harness.coordinator.pending_count() == 0
        });
        assert_eq!(harness.store.downloads().expect("downloads").len(), 2);
    }

    #[test]
    fn test_is_downloaded_checks_flag_and_file() {
        let harness = DownloadHarness::new();
        let song = remote_song(8, "On Disk");
        assert!(!harness.coordinator.is_downloaded(&song));

        let path = harness.coordinator.download_path(&song);
        std::fs::create_dir_all(harness.coordinator.download_dir()).expect("create dir");
        std::fs::write(&path, b"ID3").expect("write file");
        assert!(harness.coordinator.is_downloaded(&song));

        let mut cached = remote_song(10, "Cached");
        cached.is_local = true;
        assert!(harness.coordinator.is_downloaded(&cached));
        assert!(matches!(
            harness.coordinator.download(&cached),
            Err(DownloadError::AlreadyLocal { .. })
        ));
    }
}
