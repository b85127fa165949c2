//! Live snapshots over library tables.
//!
//! Each write to the library store announces the tables it touched on a
//! broadcast channel. A `LiveQuery` re-runs its query whenever one of its
//! tables changes and publishes the full result set through a `watch`
//! channel, so consumers always hold the current rows without explicit
//! invalidation.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;

use log::{debug, error, trace};
use tokio::sync::{
    broadcast::{self, error::RecvError},
    watch,
};

use crate::error::StoreError;

/// Tables whose mutations are announced on the change channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Playlists,
    PlaylistMembers,
    Downloads,
}

/// Long-lived subscription to the result of one query.
pub struct LiveQuery<T> {
    receiver: watch::Receiver<T>,
    stopped: Arc<AtomicBool>,
}

impl<T> LiveQuery<T>
where
    T: Clone + Default + Send + Sync + 'static,
{
    /// Starts a worker that keeps `query` fresh against `tables`.
    ///
    /// `changes` must be subscribed before this call so no write between the
    /// subscription and the initial query can be missed.
    pub(crate) fn spawn<F>(
        name: &str,
        tables: &'static [Table],
        mut changes: broadcast::Receiver<Table>,
        mut query: F,
    ) -> Self
    where
        F: FnMut() -> Result<T, StoreError> + Send + 'static,
    {
        let initial = run_query(name, &mut query).unwrap_or_default();
        let (sender, receiver) = watch::channel(initial);
        let stopped = Arc::new(AtomicBool::new(false));
        let worker_stopped = Arc::clone(&stopped);
        let worker_name = name.to_string();

        let spawn_result = thread::Builder::new()
            .name(format!("live-query:{name}"))
            .spawn(move || loop {
                let should_refresh = match changes.blocking_recv() {
                    Ok(table) => tables.contains(&table),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(
                            "Live query {} lagged, skipped {} change(s); refreshing",
                            worker_name, skipped
                        );
                        true
                    }
                    Err(RecvError::Closed) => break,
                };
                if worker_stopped.load(Ordering::Acquire) || sender.is_closed() {
                    break;
                }
                if !should_refresh {
                    continue;
                }
                if let Some(snapshot) = run_query(&worker_name, &mut query) {
                    trace!("Live query {} re-emitting snapshot", worker_name);
                    sender.send_replace(snapshot);
                }
            });
        if let Err(err) = spawn_result {
            error!("Failed to start live query {}: {}", name, err);
        }

        Self { receiver, stopped }
    }

    /// Clone of the latest snapshot.
    pub fn current(&self) -> T {
        self.receiver.borrow().clone()
    }

    /// Runs `f` against the latest snapshot without cloning it.
    pub fn with_current<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.receiver.borrow())
    }

    /// A receiver that is notified on every re-emitted snapshot.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.receiver.clone()
    }
}

impl<T> Drop for LiveQuery<T> {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::Release);
    }
}

fn run_query<T, F>(name: &str, query: &mut F) -> Option<T>
where
    F: FnMut() -> Result<T, StoreError>,
{
    match query() {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
            error!("Live query {} failed: {}", name, err);
            None
        }
    }
}
