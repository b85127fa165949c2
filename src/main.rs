use std::{
    error::Error,
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};

use clap::{Parser, Subcommand};
use log::{debug, info};
use playdeck::{
    config_persistence::{default_config_path, load_or_create, persist_folder_filter},
    protocol::{DownloadMessage, LibraryMessage, Message},
    song::Song,
    EngineCollaborators, EngineServices,
};
use tokio::sync::broadcast::{error::TryRecvError, Receiver};

const LIBRARY_REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Parser)]
#[command(name = "playdeck", version, about = "Browse, collect and download music")]
struct Cli {
    /// Configuration file to use instead of the per-user default.
    #[arg(long, env = "PLAYDECK_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log at debug level regardless of the configured level.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the remote chart.
    Trending,
    /// Search the remote catalog.
    Search { query: String },
    /// List local songs, optionally limited to one folder for this run.
    Local {
        #[arg(long)]
        folder: Option<String>,
    },
    /// Set (or clear, when omitted) the saved local folder filter.
    SetFolder { folder: Option<String> },
    /// List playlists, newest first.
    Playlists,
    PlaylistCreate { name: String },
    PlaylistDelete { playlist_id: i64 },
    PlaylistShow { playlist_id: i64 },
    /// Add the first search hit for `query` to a playlist.
    PlaylistAdd { playlist_id: i64, query: String },
    /// Download the first search hit for `query` and wait for it to finish.
    Download { query: String },
    /// List downloaded tracks, most recent first.
    Downloads,
    DownloadRemove { remote_track_id: i64 },
}

fn format_duration(duration_ms: u64) -> String {
    let total_secs = duration_ms / 1000;
    format!("{}:{:02}", total_secs / 60, total_secs % 60)
}

fn print_songs(services: &EngineServices, songs: &[Song]) {
    if songs.is_empty() {
        println!("(no songs)");
        return;
    }
    for song in songs {
        let marker = if services.catalog.is_marked_downloaded(song) {
            " [downloaded]"
        } else {
            ""
        };
        println!(
            "{:>14}  {} - {}  ({}){}",
            song.id,
            song.title,
            song.artist,
            format_duration(song.duration_ms),
            marker
        );
    }
}

/// Polls the bus until `predicate` matches or `timeout` passes.
fn wait_for_reply<F>(
    receiver: &mut Receiver<Message>,
    timeout: Duration,
    mut predicate: F,
) -> Result<Message, Box<dyn Error>>
where
    F: FnMut(&Message) -> bool,
{
    let start = Instant::now();
    loop {
        if start.elapsed() > timeout {
            return Err("timed out waiting for the engine to respond".into());
        }
        match receiver.try_recv() {
            Ok(message) => {
                if let Message::Library(LibraryMessage::WriteFailed { operation, error }) = &message
                {
                    return Err(format!("{operation} failed: {error}").into());
                }
                if predicate(&message) {
                    return Ok(message);
                }
            }
            Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(10)),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => return Err("engine bus closed".into()),
        }
    }
}

/// Sends a library command and waits for its notification.
fn request<F>(
    services: &EngineServices,
    command: LibraryMessage,
    predicate: F,
) -> Result<Message, Box<dyn Error>>
where
    F: FnMut(&Message) -> bool,
{
    let mut receiver = services.bus_sender.subscribe();
    services.bus_sender.send(Message::Library(command))?;
    wait_for_reply(&mut receiver, LIBRARY_REPLY_TIMEOUT, predicate)
}

fn first_search_hit(services: &EngineServices, query: &str) -> Result<Song, Box<dyn Error>> {
    services.catalog.search(query).wait();
    services
        .catalog
        .search_results()
        .into_iter()
        .next()
        .ok_or_else(|| format!("no results for {query:?}").into())
}

fn run(
    command: Command,
    services: &EngineServices,
    config_path: &std::path::Path,
) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Trending => {
            services.catalog.refresh_trending().wait();
            print_songs(services, &services.catalog.trending());
        }
        Command::Search { query } => {
            services.catalog.search(&query).wait();
            print_songs(services, &services.catalog.search_results());
        }
        Command::Local { folder } => {
            match folder {
                Some(folder) => services.catalog.set_folder_filter(Some(&folder)).wait(),
                None => services.catalog.refresh_local().wait(),
            }
            print_songs(services, &services.catalog.local_songs());
        }
        Command::SetFolder { folder } => {
            services.catalog.set_folder_filter(folder.as_deref()).wait();
            let folder_filter = services.catalog.folder_filter();
            persist_folder_filter(config_path, folder_filter.as_deref())?;
            match folder_filter {
                Some(folder) => println!(
                    "Folder filter set to {:?} ({} songs)",
                    folder,
                    services.catalog.local_songs().len()
                ),
                None => println!("Folder filter cleared"),
            }
        }
        Command::Playlists => {
            for playlist in services.store.playlists()? {
                println!(
                    "{:>6}  {}  ({} songs)",
                    playlist.id,
                    playlist.name,
                    services.store.count_members(playlist.id)?
                );
            }
        }
        Command::PlaylistCreate { name } => {
            let reply = request(services, LibraryMessage::CreatePlaylist { name }, |m| {
                matches!(m, Message::Library(LibraryMessage::PlaylistCreated { .. }))
            })?;
            if let Message::Library(LibraryMessage::PlaylistCreated { playlist_id, name }) = reply {
                println!("Created playlist {playlist_id}: {name}");
            }
        }
        Command::PlaylistDelete { playlist_id } => {
            request(services, LibraryMessage::DeletePlaylist { playlist_id }, |m| {
                matches!(
                    m,
                    Message::Library(LibraryMessage::PlaylistDeleted { playlist_id: id })
                        if *id == playlist_id
                )
            })?;
            println!("Deleted playlist {playlist_id}");
        }
        Command::PlaylistShow { playlist_id } => {
            let playlist = services
                .store
                .playlist(playlist_id)?
                .ok_or_else(|| format!("no playlist with id {playlist_id}"))?;
            println!("{}", playlist.name);
            services.catalog.open_playlist(playlist_id);
            print_songs(services, &services.catalog.active_playlist());
        }
        Command::PlaylistAdd { playlist_id, query } => {
            let song = first_search_hit(services, &query)?;
            let song_id = song.id;
            let title = song.title.clone();
            request(
                services,
                LibraryMessage::AddSongToPlaylist { playlist_id, song },
                |m| {
                    matches!(
                        m,
                        Message::Library(LibraryMessage::SongAddedToPlaylist { song_id: id, .. })
                            if *id == song_id
                    )
                },
            )?;
            println!("Added {title:?} to playlist {playlist_id}");
        }
        Command::Download { query } => {
            let song = first_search_hit(services, &query)?;
            let mut receiver = services.bus_sender.subscribe();
            let handle = services.downloads.download(&song)?;
            println!("Downloading {} - {} ...", song.title, song.artist);
            let reply = wait_for_reply(&mut receiver, DOWNLOAD_TIMEOUT, |m| match m {
                Message::Download(DownloadMessage::Completed { fetch_id, .. })
                | Message::Download(DownloadMessage::Failed { fetch_id, .. }) => {
                    *fetch_id == handle.fetch_id
                }
                _ => false,
            })?;
            match reply {
                Message::Download(DownloadMessage::Completed {
                    local_file_path, ..
                }) => println!("Saved to {local_file_path}"),
                Message::Download(DownloadMessage::Failed { error, .. }) => {
                    return Err(format!("download failed: {error}").into())
                }
                _ => {}
            }
        }
        Command::Downloads => {
            let songs: Vec<Song> = services
                .store
                .downloads()?
                .iter()
                .map(Song::from_downloaded)
                .collect();
            print_songs(services, &songs);
        }
        Command::DownloadRemove { remote_track_id } => {
            request(
                services,
                LibraryMessage::RemoveDownload { remote_track_id },
                |m| {
                    matches!(
                        m,
                        Message::Library(LibraryMessage::DownloadRemoved { remote_track_id: id })
                            if *id == remote_track_id
                    )
                },
            )?;
            println!("Removed download record for track {remote_track_id}");
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let config = load_or_create(&config_path)?;

    let mut clog = colog::default_builder();
    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        config.logging.level_filter()
    };
    clog.filter(None, level);
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    info!("Using configuration {}", config_path.display());
    debug!("{:?}", config);

    let collaborators = EngineCollaborators::from_config(&config);
    let services = EngineServices::start(&config, collaborators)?;
    run(cli.command, &services, &config_path)
}
