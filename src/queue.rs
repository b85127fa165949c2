use crate::{device::QueueItem, protocol::SourceList, song::Song};

/// The session's mirror of the queue loaded on the playback device.
#[derive(Debug, Default)]
pub(crate) struct PlaybackQueue {
    songs: Vec<Song>,
    cursor: Option<usize>,
    source: Option<SourceList>,
    // Bumped on every rebuild so in-flight position reads can detect a swap.
    generation: u64,
}

/// Read-only copy of the queue for observers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueSnapshot {
    pub songs: Vec<Song>,
    pub cursor: Option<usize>,
    pub source: Option<SourceList>,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole queue. Out-of-range cursors are dropped.
    pub fn rebuild(&mut self, songs: Vec<Song>, cursor: usize, source: Option<SourceList>) {
        self.cursor = (cursor < songs.len()).then_some(cursor);
        self.songs = songs;
        self.source = source;
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn len(&self) -> usize {
        self.songs.len()
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub fn source(&self) -> Option<SourceList> {
        self.source
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn current_song(&self) -> Option<&Song> {
        self.cursor.and_then(|index| self.songs.get(index))
    }

    pub fn index_of(&self, song_id: i64) -> Option<usize> {
        self.songs.iter().position(|song| song.id == song_id)
    }

    /// Moves the cursor. Returns false, leaving the cursor untouched, when
    /// `index` is out of range.
    pub fn set_cursor(&mut self, index: usize) -> bool {
        if index < self.songs.len() {
            self.cursor = Some(index);
            true
        } else {
            false
        }
    }

    pub fn queue_items(&self) -> Vec<QueueItem> {
        self.songs.iter().map(Song::to_queue_item).collect()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            songs: self.songs.clone(),
            cursor: self.cursor,
            source: self.source,
        }
    }
}
