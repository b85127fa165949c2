//! Wires the engine's components together from explicitly owned instances.

use std::{any::Any, sync::Arc, thread};

use log::info;
use tokio::sync::broadcast;

use crate::{
    backends::{
        deezer::DeezerCatalog, filesystem::FilesystemCatalog, http_agent,
        http_fetcher::HttpBlobFetcher,
    },
    catalog::{CatalogAggregator, LocalCatalogProvider, RemoteCatalogProvider},
    config::Config,
    config_persistence::{resolve_database_path, resolve_download_dir, resolve_music_root},
    download::{BlobFetcher, DownloadCoordinator},
    error::StoreError,
    library_manager::LibraryManager,
    library_store::LibraryStore,
    playback_session::PlaybackSession,
    protocol::Message,
};

const BUS_CAPACITY: usize = 1024;

/// Providers the engine talks to. Swapped for fakes in tests.
pub struct EngineCollaborators {
    pub local: Arc<dyn LocalCatalogProvider>,
    pub remote: Arc<dyn RemoteCatalogProvider>,
    pub fetcher: Arc<dyn BlobFetcher>,
}

impl EngineCollaborators {
    /// Filesystem scanning, the Deezer API and HTTP downloads, as configured.
    pub fn from_config(config: &Config) -> Self {
        let http_client = http_agent(
            config.remote.connect_timeout(),
            config.remote.read_timeout(),
        );
        Self {
            local: Arc::new(FilesystemCatalog::new(resolve_music_root(config))),
            remote: Arc::new(DeezerCatalog::new(
                http_client.clone(),
                &config.remote.api_base_url,
            )),
            fetcher: Arc::new(HttpBlobFetcher::new(http_client)),
        }
    }
}

/// Running engine: the bus plus one instance of every component.
pub struct EngineServices {
    pub bus_sender: broadcast::Sender<Message>,
    pub store: LibraryStore,
    pub catalog: CatalogAggregator,
    pub session: PlaybackSession,
    pub downloads: DownloadCoordinator,
}

fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "non-string panic payload".to_string()
}

impl EngineServices {
    /// Opens the configured database and starts every component.
    pub fn start(config: &Config, collaborators: EngineCollaborators) -> Result<Self, StoreError> {
        let store = LibraryStore::open(&resolve_database_path(config))?;
        Ok(Self::with_store(config, store, collaborators))
    }

    pub fn with_store(
        config: &Config,
        store: LibraryStore,
        collaborators: EngineCollaborators,
    ) -> Self {
        let (bus_sender, _) = broadcast::channel(BUS_CAPACITY);

        let library_manager_bus_receiver = bus_sender.subscribe();
        let library_manager_bus_sender = bus_sender.clone();
        let library_manager_store = store.clone();
        thread::spawn(move || {
            let run_result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let mut library_manager = LibraryManager::new(
                    library_manager_bus_receiver,
                    library_manager_bus_sender,
                    library_manager_store,
                );
                library_manager.run();
            }));
            if let Err(payload) = run_result {
                log::error!(
                    "LibraryManager thread terminated due to panic: {}",
                    panic_payload_to_string(payload.as_ref())
                );
            }
        });

        let catalog = CatalogAggregator::new(
            collaborators.local,
            collaborators.remote,
            store.clone(),
            bus_sender.clone(),
            config.library.folder_filter.clone(),
        );
        let session = PlaybackSession::new(
            catalog.clone(),
            bus_sender.clone(),
            config.playback.position_poll_interval(),
        );
        let downloads = DownloadCoordinator::new(
            collaborators.fetcher,
            store.clone(),
            resolve_download_dir(config),
            bus_sender.clone(),
        );
        info!("Engine services started");

        Self {
            bus_sender,
            store,
            catalog,
            session,
            downloads,
        }
    }
}
