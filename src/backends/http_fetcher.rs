//! Blob fetcher that streams HTTP responses to disk on worker threads.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use log::{debug, warn};
use tokio::sync::broadcast::{self, Receiver, Sender};

use crate::download::{BlobFetcher, FetchCompletion, FetchOutcome};
use crate::error::FetchError;

const COMPLETION_CHANNEL_CAPACITY: usize = 64;

pub struct HttpBlobFetcher {
    http_client: ureq::Agent,
    next_fetch_id: AtomicU64,
    completions: Sender<FetchCompletion>,
}

impl HttpBlobFetcher {
    pub fn new(http_client: ureq::Agent) -> Self {
        let (completions, _) = broadcast::channel(COMPLETION_CHANNEL_CAPACITY);
        Self {
            http_client,
            next_fetch_id: AtomicU64::new(1),
            completions,
        }
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

/// Downloads into `<destination>.part` and renames on success so a
/// destination file only ever exists complete.
fn fetch_to_file(
    http_client: &ureq::Agent,
    url: &str,
    destination: &Path,
) -> Result<u64, FetchError> {
    let response = http_client
        .get(url)
        .call()
        .map_err(|err| FetchError::Transport(err.to_string()))?;
    let partial = partial_path(destination);
    let written = {
        let mut writer = BufWriter::new(File::create(&partial)?);
        let written = io::copy(&mut response.into_reader(), &mut writer);
        let flushed = writer.flush();
        match written.and_then(|written| flushed.map(|()| written)) {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&partial);
                return Err(err.into());
            }
        }
    };
    fs::rename(&partial, destination)?;
    Ok(written)
}

impl BlobFetcher for HttpBlobFetcher {
    fn enqueue(&self, url: &str, destination: &Path) -> Result<u64, FetchError> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        let fetch_id = self.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        let http_client = self.http_client.clone();
        let completions = self.completions.clone();
        let url = url.to_string();
        let destination = destination.to_path_buf();

        thread::spawn(move || {
            let outcome = match fetch_to_file(&http_client, &url, &destination) {
                Ok(bytes) => {
                    debug!(
                        "Fetched {} bytes from {} into {}",
                        bytes,
                        url,
                        destination.display()
                    );
                    FetchOutcome::Succeeded
                }
                Err(err) => {
                    warn!("Fetch of {} failed: {}", url, err);
                    FetchOutcome::Failed(err.to_string())
                }
            };
            let _ = completions.send(FetchCompletion { fetch_id, outcome });
        });

        Ok(fetch_id)
    }

    fn subscribe(&self) -> Receiver<FetchCompletion> {
        self.completions.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::http_agent;
    use crate::test_support::serve_http_once;
    use std::time::Duration;

    fn fetcher() -> HttpBlobFetcher {
        HttpBlobFetcher::new(http_agent(Duration::from_secs(2), Duration::from_secs(2)))
    }

    #[test]
    fn test_partial_path_appends_suffix() {
        assert_eq!(
            partial_path(Path::new("/music/Playlist/a - b.mp3")),
            PathBuf::from("/music/Playlist/a - b.mp3.part")
        );
    }

    #[test]
    fn test_successful_fetch_writes_destination() {
        let dir = tempfile::tempdir().expect("tempdir");
        let destination = dir.path().join("Playlist").join("song.mp3");
        let url = format!("{}/preview.mp3", serve_http_once("200 OK", "ID3-audio"));
        let fetcher = fetcher();
        let mut completions = fetcher.subscribe();

        let fetch_id = fetcher.enqueue(&url, &destination).expect("enqueue");
        let completion = completions.blocking_recv().expect("completion");

        assert_eq!(completion.fetch_id, fetch_id);
        assert_eq!(completion.outcome, FetchOutcome::Succeeded);
        assert_eq!(
            fs::read_to_string(&destination).expect("read destination"),
            "ID3-audio"
        );
        assert!(!partial_path(&destination).exists());
    }

    #[test]
    fn test_http_error_reports_failure_without_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let destination = dir.path().join("missing.mp3");
        let url = format!("{}/gone.mp3", serve_http_once("404 Not Found", "{}"));
        let fetcher = fetcher();
        let mut completions = fetcher.subscribe();

        let fetch_id = fetcher.enqueue(&url, &destination).expect("enqueue");
        let completion = completions.blocking_recv().expect("completion");

        assert_eq!(completion.fetch_id, fetch_id);
        assert!(matches!(completion.outcome, FetchOutcome::Failed(_)));
        assert!(!destination.exists());
    }

    #[test]
    fn test_fetch_ids_are_unique() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = fetcher();

        let first = fetcher
            .enqueue("not a url", &dir.path().join("a.mp3"))
            .expect("enqueue");
        let second = fetcher
            .enqueue("not a url", &dir.path().join("b.mp3"))
            .expect("enqueue");

        assert_ne!(first, second);
    }
}
