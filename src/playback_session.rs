//! Playback session controller.
//!
//! The session is the only writer of queue, transport and position state. It
//! mirrors the queue it loaded into the bound `PlaybackDevice`, follows the
//! device's events on a listener thread and samples the playback position on
//! a poller thread. Commands issued while no device is bound are dropped.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, trace};
use tokio::sync::broadcast::{error::RecvError, Receiver, Sender};

use crate::{
    catalog::CatalogAggregator,
    device::{DeviceConnector, DeviceEvent, PlaybackDevice},
    protocol::{self, BindingState, SessionMessage, SourceList, TransportState},
    queue::{PlaybackQueue, QueueSnapshot},
    song::Song,
};

/// Lists searched, in order, for the list a requested song is played from.
/// The local list is the fallback after these.
const PLAY_SOURCE_ORDER: [SourceList; 3] = [
    SourceList::Trending,
    SourceList::SearchResults,
    SourceList::ActivePlaylist,
];

struct SessionState {
    binding: BindingState,
    device: Option<Arc<dyn PlaybackDevice>>,
    // Bumped on every bind and unbind; listeners of an older binding exit.
    bind_generation: u64,
    queue: PlaybackQueue,
    transport: TransportState,
    current_song: Option<Song>,
    position_ms: u64,
    last_published_position: Option<(u64, usize)>,
    shut_down: bool,
}

struct SessionInner {
    state: Mutex<SessionState>,
    catalog: CatalogAggregator,
    bus_producer: Sender<protocol::Message>,
}

struct PollTask {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct PlaybackSession {
    inner: Arc<SessionInner>,
    poll_interval: Duration,
    poller: Mutex<Option<PollTask>>,
}

impl SessionInner {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, message: SessionMessage) {
        let _ = self.bus_producer.send(protocol::Message::Session(message));
    }

    fn bound_device(&self) -> Option<Arc<dyn PlaybackDevice>> {
        let state = self.state();
        match state.binding {
            BindingState::Bound => state.device.clone(),
            _ => None,
        }
    }

    fn set_transport(&self, state: &mut SessionState, transport: TransportState) {
        if state.transport != transport {
            state.transport = transport;
            self.publish(SessionMessage::TransportChanged(transport));
        }
    }

    /// Finds the song behind a device item id: the queue first, then the
    /// catalog lists. Moves the cursor when the queue holds it.
    fn resolve_item(&self, item_id: i64) -> Option<Song> {
        let queue_source = {
            let mut state = self.state();
            if let Some(index) = state.queue.index_of(item_id) {
                state.queue.set_cursor(index);
                return state.queue.current_song().cloned();
            }
            state.queue.source()
        };
        let mut order: Vec<SourceList> = queue_source.into_iter().collect();
        order.extend(
            PLAY_SOURCE_ORDER
                .iter()
                .copied()
                .filter(|source| Some(*source) != queue_source),
        );
        self.catalog.resolve(item_id, &order)
    }

    fn handle_item_transition(&self, item_id: i64) {
        let song = self.resolve_item(item_id);
        if song.is_none() {
            debug!(
                "PlaybackSession: device item {} not found in any list",
                item_id
            );
        }
        let mut state = self.state();
        state.position_ms = 0;
        if state.current_song != song {
            state.current_song = song.clone();
            self.publish(SessionMessage::CurrentSongChanged(song));
        }
    }

    fn handle_playing_changed(&self, playing: bool) {
        let mut state = self.state();
        let transport = if playing {
            TransportState::Playing
        } else if state.current_song.is_some() {
            TransportState::Paused
        } else {
            TransportState::Idle
        };
        self.set_transport(&mut state, transport);
    }

    /// Pulls current song, transport and position from a freshly bound
    /// device.
    fn reconcile(&self, device: &Arc<dyn PlaybackDevice>) {
        let item_id = device.current_item_id();
        let playing = device.is_playing();
        let position_ms = device.current_position_ms();

        let song = item_id.and_then(|id| self.resolve_item(id));
        let mut state = self.state();
        if state.current_song != song {
            state.current_song = song.clone();
            self.publish(SessionMessage::CurrentSongChanged(song));
        }
        let transport = match (playing, item_id) {
            (true, _) => TransportState::Playing,
            (false, Some(_)) => TransportState::Paused,
            (false, None) => TransportState::Idle,
        };
        self.set_transport(&mut state, transport);
        state.position_ms = position_ms;
        if let Some(cursor) = state.queue.cursor() {
            state.last_published_position = Some((position_ms, cursor));
            self.publish(SessionMessage::PositionChanged {
                position_ms,
                queue_index: cursor,
            });
        }
    }

    /// One position sample. Samples that straddle a queue rebuild are
    /// dropped, and nothing is published without a valid cursor.
    fn poll_position(&self) {
        let (device, generation) = {
            let state = self.state();
            if state.binding != BindingState::Bound {
                return;
            }
            match &state.device {
                Some(device) => (Arc::clone(device), state.queue.generation()),
                None => return,
            }
        };
        let position_ms = device.current_position_ms();

        let mut state = self.state();
        if state.queue.generation() != generation {
            trace!("PlaybackSession: discarding position sampled across a queue rebuild");
            return;
        }
        let Some(cursor) = state.queue.cursor() else {
            return;
        };
        state.position_ms = position_ms;
        if state.last_published_position != Some((position_ms, cursor)) {
            state.last_published_position = Some((position_ms, cursor));
            self.publish(SessionMessage::PositionChanged {
                position_ms,
                queue_index: cursor,
            });
        }
    }
}

impl PlaybackSession {
    pub fn new(
        catalog: CatalogAggregator,
        bus_producer: Sender<protocol::Message>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                state: Mutex::new(SessionState {
                    binding: BindingState::Unbound,
                    device: None,
                    bind_generation: 0,
                    queue: PlaybackQueue::new(),
                    transport: TransportState::Idle,
                    current_song: None,
                    position_ms: 0,
                    last_published_position: None,
                    shut_down: false,
                }),
                catalog,
                bus_producer,
            }),
            poll_interval,
            poller: Mutex::new(None),
        }
    }

    /// Attaches to a playback device. A no-op unless currently unbound.
    ///
    /// On success the session adopts whatever the device is already doing.
    /// On failure it logs and returns to `Unbound`; every later command is
    /// dropped until a bind succeeds.
    pub fn bind(&self, connector: &dyn DeviceConnector) {
        {
            let mut state = self.inner.state();
            if state.shut_down || state.binding != BindingState::Unbound {
                debug!(
                    "PlaybackSession: bind ignored in state {:?}",
                    state.binding
                );
                return;
            }
            state.binding = BindingState::Binding;
        }
        self.inner
            .publish(SessionMessage::BindingChanged(BindingState::Binding));

        let device = match connector.connect() {
            Ok(device) => device,
            Err(err) => {
                error!("PlaybackSession: {}", err);
                self.inner.state().binding = BindingState::Unbound;
                self.inner
                    .publish(SessionMessage::BindingChanged(BindingState::Unbound));
                return;
            }
        };

        let events = device.subscribe();
        let generation = {
            let mut state = self.inner.state();
            if state.shut_down {
                if state.binding != BindingState::Unbound {
                    state.binding = BindingState::Unbound;
                    self.inner
                        .publish(SessionMessage::BindingChanged(BindingState::Unbound));
                }
                return;
            }
            state.bind_generation = state.bind_generation.wrapping_add(1);
            state.device = Some(Arc::clone(&device));
            state.binding = BindingState::Bound;
            state.bind_generation
        };
        info!("PlaybackSession: bound to playback device");
        self.inner
            .publish(SessionMessage::BindingChanged(BindingState::Bound));

        spawn_event_listener(Arc::downgrade(&self.inner), generation, events);
        self.inner.reconcile(&device);
        self.ensure_poller();
    }

    /// Detaches from the device. The device keeps its own queue.
    pub fn unbind(&self) {
        {
            let mut state = self.inner.state();
            if state.binding == BindingState::Unbound {
                return;
            }
            state.binding = BindingState::Unbound;
            state.device = None;
            state.bind_generation = state.bind_generation.wrapping_add(1);
        }
        debug!("PlaybackSession: unbound from playback device");
        self.inner
            .publish(SessionMessage::BindingChanged(BindingState::Unbound));
    }

    pub fn is_bound(&self) -> bool {
        self.binding_state() == BindingState::Bound
    }

    pub fn binding_state(&self) -> BindingState {
        self.inner.state().binding
    }

    fn ensure_poller(&self) {
        let mut poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if poller.is_some() {
            return;
        }
        let (stop, stop_rx) = mpsc::channel::<()>();
        let inner = Arc::downgrade(&self.inner);
        let interval = self.poll_interval;
        let handle = thread::spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
            let Some(session) = inner.upgrade() else {
                break;
            };
            session.poll_position();
        });
        *poller = Some(PollTask { stop, handle });
    }

    fn device_or_log(&self, command: &str) -> Option<Arc<dyn PlaybackDevice>> {
        let device = self.inner.bound_device();
        if device.is_none() {
            debug!("PlaybackSession: dropping {} while unbound", command);
        }
        device
    }

    /// Plays `song`, building a queue from the list it was picked from.
    ///
    /// If the device is already on this song only playback is resumed;
    /// otherwise the queue is rebuilt from the first list containing the
    /// song (trending, search results, active playlist, then local) or, if
    /// none does, from the song alone.
    pub fn play_song(&self, song: &Song) {
        let Some(device) = self.device_or_log("play_song") else {
            return;
        };

        if device.current_item_id() == Some(song.id) {
            if !device.is_playing() {
                device.play();
            }
            return;
        }

        let (source, songs, index) = match self
            .inner
            .catalog
            .locate(song.id, &PLAY_SOURCE_ORDER)
            .or_else(|| self.inner.catalog.locate(song.id, &[SourceList::Local]))
        {
            Some((source, songs, index)) => (Some(source), songs, index),
            None => (None, vec![song.clone()], 0),
        };

        let items = {
            let mut state = self.inner.state();
            state.queue.rebuild(songs, index, source);
            state.position_ms = 0;
            state.last_published_position = None;
            let current = state.queue.current_song().cloned();
            self.inner.publish(SessionMessage::QueueChanged {
                source,
                length: state.queue.len(),
                cursor: state.queue.cursor(),
            });
            if state.current_song != current {
                state.current_song = current.clone();
                self.inner
                    .publish(SessionMessage::CurrentSongChanged(current));
            }
            state.queue.queue_items()
        };
        debug!(
            "PlaybackSession: loading {} item(s) from {:?} at index {}",
            items.len(),
            source,
            index
        );
        device.load_queue(&items, index, 0);
        device.play();
    }

    pub fn pause(&self) {
        if let Some(device) = self.device_or_log("pause") {
            device.pause();
        }
    }

    pub fn resume(&self) {
        if let Some(device) = self.device_or_log("resume") {
            device.play();
        }
    }

    pub fn seek_to(&self, position_ms: u64) {
        if let Some(device) = self.device_or_log("seek") {
            device.seek(position_ms);
        }
    }

    pub fn skip_next(&self) {
        if let Some(device) = self.device_or_log("skip_next") {
            device.skip_next();
        }
    }

    pub fn skip_previous(&self) {
        if let Some(device) = self.device_or_log("skip_previous") {
            device.skip_previous();
        }
    }

    pub fn current_song(&self) -> Option<Song> {
        self.inner.state().current_song.clone()
    }

    pub fn transport(&self) -> TransportState {
        self.inner.state().transport
    }

    pub fn position_ms(&self) -> u64 {
        self.inner.state().position_ms
    }

    pub fn queue_snapshot(&self) -> QueueSnapshot {
        self.inner.state().queue.snapshot()
    }

    /// Stops the poller and drops the binding. The session cannot be bound
    /// again afterwards.
    pub fn shutdown(&self) {
        self.inner.state().shut_down = true;
        self.unbind();
        let task = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.stop.send(());
            if task.handle.join().is_err() {
                error!("PlaybackSession: position poller panicked");
            }
        }
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_event_listener(
    inner: Weak<SessionInner>,
    generation: u64,
    mut events: Receiver<DeviceEvent>,
) {
    thread::spawn(move || loop {
        let event = match events.blocking_recv() {
            Ok(event) => Some(event),
            Err(RecvError::Lagged(skipped)) => {
                debug!("PlaybackSession: missed {} device event(s)", skipped);
                None
            }
            Err(RecvError::Closed) => break,
        };
        let Some(session) = inner.upgrade() else {
            break;
        };
        {
            let state = session.state();
            if state.bind_generation != generation || state.binding != BindingState::Bound {
                break;
            }
        }
        match event {
            Some(DeviceEvent::ItemTransitioned(item_id)) => {
                session.handle_item_transition(item_id)
            }
            Some(DeviceEvent::PlayingChanged(playing)) => session.handle_playing_changed(playing),
            None => {
                if let Some(device) = session.bound_device() {
                    session.reconcile(&device);
                }
            }
        }
    });
}
