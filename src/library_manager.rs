use log::{debug, error, trace};
use tokio::sync::broadcast::{error::RecvError, Receiver, Sender};

use crate::{
    library_store::{LibraryStore, PlaylistMember},
    protocol::{self, LibraryMessage},
};

/// Applies library write commands received on the bus.
///
/// Writes are serialized on this worker so the UI never touches the database
/// directly. Every failure is logged and reported as `WriteFailed`; none of
/// them stop the loop.
pub struct LibraryManager {
    bus_consumer: Receiver<protocol::Message>,
    bus_producer: Sender<protocol::Message>,
    store: LibraryStore,
}

impl LibraryManager {
    pub fn new(
        bus_consumer: Receiver<protocol::Message>,
        bus_producer: Sender<protocol::Message>,
        store: LibraryStore,
    ) -> Self {
        Self {
            bus_consumer,
            bus_producer,
            store,
        }
    }

    fn emit(&self, message: LibraryMessage) {
        let _ = self.bus_producer.send(protocol::Message::Library(message));
    }

    fn report_failure(&self, operation: &str, err: impl std::fmt::Display) {
        error!("LibraryManager: {} failed: {}", operation, err);
        self.emit(LibraryMessage::WriteFailed {
            operation: operation.to_string(),
            error: err.to_string(),
        });
    }

    pub fn run(&mut self) {
        loop {
            match self.bus_consumer.blocking_recv() {
                Ok(protocol::Message::Library(message)) => self.handle(message),
                Ok(_) => trace!("LibraryManager: ignoring non-library message"),
                Err(RecvError::Lagged(skipped)) => {
                    debug!("LibraryManager: bus lagged by {} message(s)", skipped);
                }
                Err(RecvError::Closed) => {
                    debug!("LibraryManager: bus closed");
                    break;
                }
            }
        }
    }

    fn handle(&mut self, message: LibraryMessage) {
        match message {
            LibraryMessage::CreatePlaylist { name } => {
                debug!("LibraryManager: creating playlist {}", name);
                match self.store.create_playlist(&name) {
                    Ok(playlist_id) => {
                        self.emit(LibraryMessage::PlaylistCreated { playlist_id, name })
                    }
                    Err(err) => self.report_failure("create playlist", err),
                }
            }
            LibraryMessage::DeletePlaylist { playlist_id } => {
                match self.store.delete_playlist(playlist_id) {
                    Ok(()) => self.emit(LibraryMessage::PlaylistDeleted { playlist_id }),
                    Err(err) => self.report_failure("delete playlist", err),
                }
            }
            LibraryMessage::AddSongToPlaylist { playlist_id, song } => {
                let member = PlaylistMember::from_song(playlist_id, &song);
                match self.store.add_member(&member) {
                    Ok(()) => self.emit(LibraryMessage::SongAddedToPlaylist {
                        playlist_id,
                        song_id: song.id,
                    }),
                    Err(err) => self.report_failure("add song to playlist", err),
                }
            }
            LibraryMessage::RemoveSongFromPlaylist {
                playlist_id,
                song_id,
            } => match self.store.remove_member(playlist_id, song_id) {
                Ok(()) => self.emit(LibraryMessage::SongRemovedFromPlaylist {
                    playlist_id,
                    song_id,
                }),
                Err(err) => self.report_failure("remove song from playlist", err),
            },
            LibraryMessage::RequestPlaylistsForSong { song_id } => {
                match self.store.playlists_containing(song_id) {
                    Ok(playlist_ids) => self.emit(LibraryMessage::PlaylistsForSong {
                        song_id,
                        playlist_ids,
                    }),
                    Err(err) => self.report_failure("look up playlists for song", err),
                }
            }
            LibraryMessage::RemoveDownload { remote_track_id } => {
                match self.store.remove_download(remote_track_id) {
                    Ok(()) => self.emit(LibraryMessage::DownloadRemoved { remote_track_id }),
                    Err(err) => self.report_failure("remove download", err),
                }
            }
            // Notifications, including our own.
            LibraryMessage::PlaylistCreated { .. }
            | LibraryMessage::PlaylistDeleted { .. }
            | LibraryMessage::SongAddedToPlaylist { .. }
            | LibraryMessage::SongRemovedFromPlaylist { .. }
            | LibraryMessage::PlaylistsForSong { .. }
            | LibraryMessage::DownloadRemoved { .. }
            | LibraryMessage::WriteFailed { .. } => {}
        }
    }
}
