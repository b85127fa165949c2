//! Seam between the playback session and whatever actually renders audio.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::DeviceError;

/// Entry handed to the device when a queue is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    /// Song id, echoed back in `DeviceEvent::ItemTransitioned`.
    pub id: i64,
    pub location: String,
    pub title: String,
    pub artist: String,
    pub album_art_location: Option<String>,
}

/// Asynchronous notifications raised by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The device moved to the item with this song id, either naturally or
    /// because of a skip.
    ItemTransitioned(i64),
    PlayingChanged(bool),
}

/// A bound playback device.
///
/// Implementations own their queue; the session only mirrors it.
pub trait PlaybackDevice: Send + Sync {
    fn load_queue(&self, items: &[QueueItem], start_index: usize, start_position_ms: u64);
    fn play(&self);
    fn pause(&self);
    fn seek(&self, position_ms: u64);
    fn skip_next(&self);
    fn skip_previous(&self);
    fn current_item_id(&self) -> Option<i64>;
    fn current_position_ms(&self) -> u64;
    fn is_playing(&self) -> bool;
    fn subscribe(&self) -> broadcast::Receiver<DeviceEvent>;
}

/// Establishes the connection to a playback device.
pub trait DeviceConnector: Send + Sync {
    fn connect(&self) -> Result<Arc<dyn PlaybackDevice>, DeviceError>;
}
