//! Shared fakes and helpers for unit tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::broadcast::{self, error::TryRecvError, Receiver, Sender};

use crate::catalog::{
    LocalCatalogProvider, LocalRecord, RemoteAlbum, RemoteArtist, RemoteCatalogProvider,
    RemoteTrack,
};
use crate::device::{DeviceConnector, DeviceEvent, PlaybackDevice, QueueItem};
use crate::download::{BlobFetcher, FetchCompletion, FetchOutcome};
use crate::error::{DeviceError, FetchError, ProviderError};
use crate::protocol;
use crate::song::Song;

pub fn wait_for_message<F>(
    receiver: &mut Receiver<protocol::Message>,
    timeout: Duration,
    mut predicate: F,
) -> protocol::Message
where
    F: FnMut(&protocol::Message) -> bool,
{
    let start = Instant::now();
    loop {
        if start.elapsed() > timeout {
            panic!("timed out waiting for expected message");
        }
        match receiver.try_recv() {
            Ok(message) => {
                if predicate(&message) {
                    return message;
                }
            }
            Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(5)),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => panic!("bus closed while waiting for message"),
        }
    }
}

pub fn assert_no_message<F>(
    receiver: &mut Receiver<protocol::Message>,
    timeout: Duration,
    mut predicate: F,
) where
    F: FnMut(&protocol::Message) -> bool,
{
    let start = Instant::now();
    loop {
        if start.elapsed() > timeout {
            return;
        }
        match receiver.try_recv() {
            Ok(message) => {
                if predicate(&message) {
                    panic!("received unexpected message: {:?}", message);
                }
            }
            Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(5)),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => return,
        }
    }
}

pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut predicate: F) {
    let start = Instant::now();
    while !predicate() {
        if start.elapsed() > timeout {
            panic!("timed out waiting for condition");
        }
        thread::sleep(Duration::from_millis(5));
    }
}

pub fn local_record(native_id: i64, title: &str, path: &str) -> LocalRecord {
    LocalRecord {
        native_id,
        title: title.to_string(),
        artist: "Local Artist".to_string(),
        duration_ms: 180_000,
        path: path.to_string(),
        album_id: None,
        album_art_location: None,
    }
}

pub fn local_song(native_id: i64, title: &str) -> Song {
    Song::from_local_record(&local_record(
        native_id,
        title,
        &format!("/music/Download/{native_id}.mp3"),
    ))
}

pub fn remote_track(id: i64, title: &str) -> RemoteTrack {
    RemoteTrack {
        id,
        title: title.to_string(),
        duration_s: 30,
        preview_url: format!("https://cdn.example/preview/{id}.mp3"),
        artist: RemoteArtist {
            name: "Remote Artist".to_string(),
        },
        album: RemoteAlbum {
            title: "Remote Album".to_string(),
            cover_url: Some(format!("https://cdn.example/cover/{id}.jpg")),
        },
    }
}

pub fn remote_song(track_id: i64, title: &str) -> Song {
    Song::from_remote_track(&remote_track(track_id, title))
}

/// Local provider over a fixed record set with substring folder filtering.
pub struct StaticLocalProvider {
    records: Vec<LocalRecord>,
    last_filter: Mutex<Option<Option<String>>>,
}

impl StaticLocalProvider {
    pub fn new(records: Vec<LocalRecord>) -> Self {
        Self {
            records,
            last_filter: Mutex::new(None),
        }
    }

    /// The filter passed to the most recent query, if any query ran.
    pub fn last_filter(&self) -> Option<Option<String>> {
        self.last_filter.lock().expect("filter lock").clone()
    }
}

impl LocalCatalogProvider for StaticLocalProvider {
    fn query(&self, folder_filter: Option<&str>) -> Result<Vec<LocalRecord>, ProviderError> {
        *self.last_filter.lock().expect("filter lock") = Some(folder_filter.map(str::to_string));
        Ok(self
            .records
            .iter()
            .filter(|record| folder_filter.map_or(true, |folder| record.path.contains(folder)))
            .cloned()
            .collect())
    }
}

/// Remote provider with canned responses, optional failure and per-query
/// gates that hold a search until released.
#[derive(Default)]
pub struct ScriptedRemoteProvider {
    search_results: Mutex<HashMap<String, Vec<RemoteTrack>>>,
    trending: Mutex<Vec<RemoteTrack>>,
    failing: AtomicBool,
    gates: Mutex<HashMap<String, mpsc::Receiver<()>>>,
    queries: Mutex<Vec<String>>,
}

impl ScriptedRemoteProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_search_results(&self, query: &str, tracks: Vec<RemoteTrack>) {
        self.search_results
            .lock()
            .expect("search lock")
            .insert(query.to_string(), tracks);
    }

    pub fn set_trending(&self, tracks: Vec<RemoteTrack>) {
        *self.trending.lock().expect("trending lock") = tracks;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Blocks the next search for `query` until the returned sender fires.
    pub fn gate_search(&self, query: &str) -> mpsc::Sender<()> {
        let (sender, receiver) = mpsc::channel();
        self.gates
            .lock()
            .expect("gate lock")
            .insert(query.to_string(), receiver);
        sender
    }

    pub fn search_queries(&self) -> Vec<String> {
        self.queries.lock().expect("queries lock").clone()
    }
}

impl RemoteCatalogProvider for ScriptedRemoteProvider {
    fn search(&self, query: &str) -> Result<Vec<RemoteTrack>, ProviderError> {
        self.queries
            .lock()
            .expect("queries lock")
            .push(query.to_string());
        let gate = self.gates.lock().expect("gate lock").remove(query);
        if let Some(gate) = gate {
            let _ = gate.recv_timeout(Duration::from_secs(5));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProviderError::Transport("scripted failure".to_string()));
        }
        Ok(self
            .search_results
            .lock()
            .expect("search lock")
            .get(query)
            .cloned()
            .unwrap_or_default())
    }

    fn trending(&self) -> Result<Vec<RemoteTrack>, ProviderError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProviderError::Decode("scripted failure".to_string()));
        }
        Ok(self.trending.lock().expect("trending lock").clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    LoadQueue { ids: Vec<i64>, start_index: usize },
    Play,
    Pause,
    Seek(u64),
    SkipNext,
    SkipPrevious,
}

#[derive(Default)]
struct FakeDeviceState {
    items: Vec<QueueItem>,
    index: Option<usize>,
    position_ms: u64,
    playing: bool,
}

/// In-memory playback device that reports events the way a real player
/// would.
pub struct FakeDevice {
    state: Mutex<FakeDeviceState>,
    events: Sender<DeviceEvent>,
    calls: Mutex<Vec<DeviceCall>>,
}

impl FakeDevice {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            state: Mutex::new(FakeDeviceState::default()),
            events,
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Seeds the device as if another session had left it mid-playback.
    pub fn preload(&self, items: Vec<QueueItem>, index: usize, position_ms: u64, playing: bool) {
        let mut state = self.state.lock().expect("device lock");
        state.items = items;
        state.index = Some(index);
        state.position_ms = position_ms;
        state.playing = playing;
    }

    pub fn set_position(&self, position_ms: u64) {
        self.state.lock().expect("device lock").position_ms = position_ms;
    }

    /// Simulates the device moving on its own to the item with `item_id`.
    pub fn transition_to(&self, item_id: i64) {
        {
            let mut state = self.state.lock().expect("device lock");
            state.index = state.items.iter().position(|item| item.id == item_id);
            state.position_ms = 0;
        }
        let _ = self.events.send(DeviceEvent::ItemTransitioned(item_id));
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn load_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, DeviceCall::LoadQueue { .. }))
            .count()
    }

    fn record(&self, call: DeviceCall) {
        self.calls.lock().expect("calls lock").push(call);
    }

    fn set_playing(&self, playing: bool) {
        let changed = {
            let mut state = self.state.lock().expect("device lock");
            let changed = state.playing != playing;
            state.playing = playing;
            changed
        };
        if changed {
            let _ = self.events.send(DeviceEvent::PlayingChanged(playing));
        }
    }

    fn move_by(&self, forward: bool) {
        let item_id = {
            let mut state = self.state.lock().expect("device lock");
            let Some(index) = state.index else {
                return;
            };
            let next = if forward {
                index + 1
            } else {
                index.saturating_sub(1)
            };
            if next >= state.items.len() || next == index {
                return;
            }
            state.index = Some(next);
            state.position_ms = 0;
            state.items[next].id
        };
        let _ = self.events.send(DeviceEvent::ItemTransitioned(item_id));
    }
}

impl PlaybackDevice for FakeDevice {
    fn load_queue(&self, items: &[QueueItem], start_index: usize, start_position_ms: u64) {
        self.record(DeviceCall::LoadQueue {
            ids: items.iter().map(|item| item.id).collect(),
            start_index,
        });
        let item_id = {
            let mut state = self.state.lock().expect("device lock");
            state.items = items.to_vec();
            state.index = Some(start_index);
            state.position_ms = start_position_ms;
            items.get(start_index).map(|item| item.id)
        };
        if let Some(item_id) = item_id {
            let _ = self.events.send(DeviceEvent::ItemTransitioned(item_id));
        }
    }

    fn play(&self) {
        self.record(DeviceCall::Play);
        self.set_playing(true);
    }

    fn pause(&self) {
        self.record(DeviceCall::Pause);
        self.set_playing(false);
    }

    fn seek(&self, position_ms: u64) {
        self.record(DeviceCall::Seek(position_ms));
        self.set_position(position_ms);
    }

    fn skip_next(&self) {
        self.record(DeviceCall::SkipNext);
        self.move_by(true);
    }

    fn skip_previous(&self) {
        self.record(DeviceCall::SkipPrevious);
        self.move_by(false);
    }

    fn current_item_id(&self) -> Option<i64> {
        let state = self.state.lock().expect("device lock");
        state
            .index
            .and_then(|index| state.items.get(index))
            .map(|item| item.id)
    }

    fn current_position_ms(&self) -> u64 {
        self.state.lock().expect("device lock").position_ms
    }

    fn is_playing(&self) -> bool {
        self.state.lock().expect("device lock").playing
    }

    fn subscribe(&self) -> Receiver<DeviceEvent> {
        self.events.subscribe()
    }
}

pub struct FakeConnector {
    device: Arc<FakeDevice>,
    failing: AtomicBool,
    connects: AtomicUsize,
    gate: Mutex<Option<mpsc::Receiver<()>>>,
}

impl FakeConnector {
    pub fn new(device: Arc<FakeDevice>) -> Self {
        Self {
            device,
            failing: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            gate: Mutex::new(None),
        }
    }

    pub fn failing(device: Arc<FakeDevice>) -> Self {
        let connector = Self::new(device);
        connector.failing.store(true, Ordering::SeqCst);
        connector
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Holds the next `connect` until the returned sender fires or drops.
    pub fn gate_connect(&self) -> mpsc::Sender<()> {
        let (sender, receiver) = mpsc::channel();
        *self.gate.lock().expect("gate lock") = Some(receiver);
        sender
    }
}

impl DeviceConnector for FakeConnector {
    fn connect(&self) -> Result<Arc<dyn PlaybackDevice>, DeviceError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().expect("gate lock").take();
        if let Some(gate) = gate {
            let _ = gate.recv_timeout(Duration::from_secs(5));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeviceError::ConnectFailed("service unavailable".to_string()));
        }
        let device: Arc<dyn PlaybackDevice> = self.device.clone();
        Ok(device)
    }
}

/// Fetcher whose completions are triggered by the test.
pub struct FakeFetcher {
    next_id: AtomicU64,
    enqueued: Mutex<Vec<(u64, String, PathBuf)>>,
    completions: Sender<FetchCompletion>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        let (completions, _) = broadcast::channel(64);
        Self {
            next_id: AtomicU64::new(1),
            enqueued: Mutex::new(Vec::new()),
            completions,
        }
    }

    pub fn enqueued(&self) -> Vec<(u64, String, PathBuf)> {
        self.enqueued.lock().expect("enqueued lock").clone()
    }

    pub fn complete(&self, fetch_id: u64, outcome: FetchOutcome) {
        let _ = self.completions.send(FetchCompletion { fetch_id, outcome });
    }
}

impl BlobFetcher for FakeFetcher {
    fn enqueue(&self, url: &str, destination: &Path) -> Result<u64, FetchError> {
        let fetch_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.enqueued.lock().expect("enqueued lock").push((
            fetch_id,
            url.to_string(),
            destination.to_path_buf(),
        ));
        Ok(fetch_id)
    }

    fn subscribe(&self) -> Receiver<FetchCompletion> {
        self.completions.subscribe()
    }
}

/// Serves exactly one HTTP response on a loopback port and returns the base
/// URL to reach it.
pub fn serve_http_once(status: &str, body: &str) -> String {
    use std::io::{Read, Write};

    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let address = listener.local_addr().expect("local addr");
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut request = Vec::new();
            let mut buffer = [0u8; 1024];
            while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                match stream.read(&mut buffer) {
                    Ok(0) | Err(_) => break,
                    Ok(read) => request.extend_from_slice(&buffer[..read]),
                }
            }
            let _ = stream.write_all(response.as_bytes());
            let _ = stream.flush();
        }
    });
    format!("http://{address}")
}
