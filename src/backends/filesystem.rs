//! Local catalog provider that scans a music folder and reads tags with
//! `lofty`.

use std::path::{Path, PathBuf};

use log::{debug, warn};
use lofty::file::{AudioFile, TaggedFileExt};
use lofty::prelude::Accessor;
use lofty::read_from_path;
use lofty::tag::Tag;

use crate::catalog::{LocalCatalogProvider, LocalRecord};
use crate::error::ProviderError;

pub const SUPPORTED_AUDIO_EXTENSIONS: [&str; 7] =
    ["mp3", "wav", "ogg", "flac", "aac", "m4a", "mp4"];

pub const UNKNOWN_ARTIST: &str = "Unknown Artist";

// Keeps generated ids well below the remote id offset.
const LOCAL_ID_MASK: u64 = (1 << 39) - 1;

pub fn is_supported_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            SUPPORTED_AUDIO_EXTENSIONS
                .iter()
                .any(|supported| ext.eq_ignore_ascii_case(supported))
        })
        .unwrap_or(false)
}

pub fn collect_audio_files_from_folder(folder_path: &Path) -> Vec<PathBuf> {
    let mut pending_directories = vec![folder_path.to_path_buf()];
    let mut tracks = Vec::new();

    while let Some(directory) = pending_directories.pop() {
        let entries = match std::fs::read_dir(&directory) {
            Ok(entries) => entries,
            Err(err) => {
                debug!("Failed to read directory {}: {}", directory.display(), err);
                continue;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                debug!("Failed to inspect {}", path.display());
                continue;
            };
            if file_type.is_dir() {
                pending_directories.push(path);
            } else if file_type.is_file() && is_supported_audio_file(&path) {
                tracks.push(path);
            }
        }
    }

    tracks.sort_unstable();
    tracks
}

/// 64-bit FNV-1a.
fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Stable id for a file path, disjoint from remote song ids.
pub fn local_id_for_path(path: &Path) -> i64 {
    (fnv1a(path.to_string_lossy().as_bytes()) & LOCAL_ID_MASK) as i64
}

fn first_non_empty<F>(primary_tag: Option<&Tag>, tags: &[Tag], mut extractor: F) -> Option<String>
where
    F: FnMut(&Tag) -> Option<String>,
{
    primary_tag
        .into_iter()
        .chain(tags.iter())
        .filter_map(|tag| extractor(tag))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

fn read_record(path: &Path) -> LocalRecord {
    let fallback_title = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut record = LocalRecord {
        native_id: local_id_for_path(path),
        title: fallback_title,
        artist: UNKNOWN_ARTIST.to_string(),
        duration_ms: 0,
        path: path.to_string_lossy().into_owned(),
        album_id: None,
        album_art_location: None,
    };

    let tagged_file = match read_from_path(path) {
        Ok(tagged_file) => tagged_file,
        Err(err) => {
            debug!("No readable tags in {}: {}", path.display(), err);
            return record;
        }
    };
    let primary_tag = tagged_file.primary_tag();
    let tags = tagged_file.tags();

    if let Some(title) = first_non_empty(primary_tag, tags, |tag| {
        tag.title().map(|value| value.into_owned())
    }) {
        record.title = title;
    }
    if let Some(artist) = first_non_empty(primary_tag, tags, |tag| {
        tag.artist().map(|value| value.into_owned())
    }) {
        record.artist = artist;
    }
    record.album_id = first_non_empty(primary_tag, tags, |tag| {
        tag.album().map(|value| value.into_owned())
    })
    .map(|album| (fnv1a(album.as_bytes()) & LOCAL_ID_MASK) as i64);
    record.duration_ms = tagged_file.properties().duration().as_millis() as u64;
    record
}

/// Scans `music_root` on every query.
pub struct FilesystemCatalog {
    music_root: PathBuf,
}

impl FilesystemCatalog {
    pub fn new(music_root: PathBuf) -> Self {
        Self { music_root }
    }
}

impl LocalCatalogProvider for FilesystemCatalog {
    /// Returns every supported file whose path contains `folder_filter`,
    /// sorted by title.
    fn query(&self, folder_filter: Option<&str>) -> Result<Vec<LocalRecord>, ProviderError> {
        if !self.music_root.is_dir() {
            warn!(
                "Music folder {} does not exist",
                self.music_root.display()
            );
            return Ok(Vec::new());
        }
        let mut records: Vec<LocalRecord> = collect_audio_files_from_folder(&self.music_root)
            .into_iter()
            .filter(|path| {
                folder_filter.map_or(true, |folder| path.to_string_lossy().contains(folder))
            })
            .map(|path| read_record(&path))
            .collect();
        records.sort_by(|a, b| a.title.cmp(&b.title).then_with(|| a.path.cmp(&b.path)));
        debug!(
            "Local catalog query ({:?}) found {} file(s)",
            folder_filter,
            records.len()
        );
        Ok(records)
    }
}
