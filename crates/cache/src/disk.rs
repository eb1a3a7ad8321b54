//! Disk overflow store for bitmaps
//!
//! Content-addressed PNG files named `{hash}-{format}.png`. The format suffix
//! lets a 16-bit bitmap come back as 16-bit even though PNG stores it as
//! 8-bit RGB. Writes go to a temporary file that is renamed into place, so a
//! crash never leaves a truncated entry under a valid name.
//!
//! Recency follows file modification times: a hit rewrites the mtime, and
//! the index rebuilt at startup orders entries by it.

use crate::bitmap::{pack_rgb565, unpack_rgb565, Bitmap, GeometryError, PixelFormat};
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, GenericImageView, ImageEncoder, ImageFormat};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

const EXTENSION: &str = "png";
const TEMP_EXTENSION: &str = "tmp";

/// Disk store errors
#[derive(Debug, thiserror::Error)]
pub enum DiskStoreError {
    #[error("disk cache I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode or decode cached bitmap: {0}")]
    Image(#[from] image::ImageError),

    #[error("cached bitmap has the wrong size: {0}")]
    Geometry(#[from] GeometryError),

    #[error("invalid cache hash: {0}")]
    InvalidHash(String),
}

/// Statistics for monitoring disk store performance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskCacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries removed to stay under the byte budget or by trimming
    pub evictions: u64,
    pub entry_count: usize,
    /// Bytes of all indexed files
    pub disk_used: u64,
    pub disk_limit: u64,
    pub write_failures: u64,
}

impl DiskCacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone)]
struct DiskEntry {
    path: PathBuf,
    format: PixelFormat,
    bytes: u64,
    modified: SystemTime,
    /// Recency order inside this process; ties in `modified` are common on coarse filesystems
    sequence: u64,
}

struct StoreState {
    entries: HashMap<String, DiskEntry>,
    disk_used: u64,
    disk_limit: u64,
    dir: PathBuf,
    next_sequence: u64,
    stats: DiskCacheStats,
}

impl StoreState {
    fn bump(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    fn forget(&mut self, hash: &str) -> Option<DiskEntry> {
        let entry = self.entries.remove(hash)?;
        self.disk_used = self.disk_used.saturating_sub(entry.bytes);
        Some(entry)
    }

    fn oldest(&self, keep: Option<&str>) -> Option<String> {
        self.entries
            .iter()
            .filter(|(hash, _)| Some(hash.as_str()) != keep)
            .min_by_key(|(_, entry)| (entry.modified, entry.sequence))
            .map(|(hash, _)| hash.clone())
    }

    /// Delete least recently used files until `disk_used <= target`
    fn evict_to(&mut self, target: u64, keep: Option<&str>) -> usize {
        let mut evicted = 0;
        while self.disk_used > target {
            let Some(hash) = self.oldest(keep) else { break };
            if let Some(entry) = self.forget(&hash) {
                remove_quietly(&entry.path);
                self.stats.evictions += 1;
                evicted += 1;
            }
        }
        evicted
    }
}

/// Persistent bitmap store bounded by bytes on disk
///
/// Thread-safe; clones share one index.
#[derive(Clone)]
pub struct DiskOverflowStore {
    state: Arc<Mutex<StoreState>>,
}

impl DiskOverflowStore {
    /// Open (creating if needed) a store in `dir`, indexing files already there
    pub fn open<P: AsRef<Path>>(dir: P, disk_limit: u64) -> Result<Self, DiskStoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let store = Self {
            state: Arc::new(Mutex::new(StoreState {
                entries: HashMap::new(),
                disk_used: 0,
                disk_limit,
                dir,
                next_sequence: 0,
                stats: DiskCacheStats::default(),
            })),
        };
        store.rebuild()?;
        Ok(store)
    }

    /// Rebuild the index from the directory listing and enforce the budget
    ///
    /// Leftover temporary files are deleted; files with foreign names are ignored.
    pub fn rebuild(&self) -> Result<usize, DiskStoreError> {
        let mut state = self.state.lock();
        let mut found = Vec::new();

        for dir_entry in fs::read_dir(&state.dir)? {
            let dir_entry = dir_entry?;
            let path = dir_entry.path();

            if path.extension().and_then(|e| e.to_str()) == Some(TEMP_EXTENSION) {
                remove_quietly(&path);
                continue;
            }

            let Some((hash, format)) = parse_file_name(&path) else {
                continue;
            };
            let metadata = match dir_entry.metadata() {
                Ok(metadata) if metadata.is_file() => metadata,
                _ => continue,
            };
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((hash, format, path, metadata.len(), modified));
        }

        found.sort_by_key(|(_, _, _, _, modified)| *modified);

        state.entries.clear();
        state.disk_used = 0;
        for (hash, format, path, bytes, modified) in found {
            let sequence = state.bump();
            state.disk_used += bytes;
            state.entries.insert(
                hash,
                DiskEntry {
                    path,
                    format,
                    bytes,
                    modified,
                    sequence,
                },
            );
        }

        let limit = state.disk_limit;
        let evicted = state.evict_to(limit, None);
        if evicted > 0 {
            debug!(evicted, "disk store over budget after rebuild");
        }

        Ok(state.entries.len())
    }

    /// Encode and store a bitmap under `hash`, replacing any previous entry
    pub fn put(&self, hash: &str, bitmap: &Bitmap) -> Result<(), DiskStoreError> {
        validate_hash(hash)?;
        let mut state = self.state.lock();

        let path = state.dir.join(file_name(hash, bitmap.format()));
        let temp = path.with_extension(TEMP_EXTENSION);

        let written = write_png(&temp, bitmap).and_then(|()| {
            fs::rename(&temp, &path)?;
            Ok(())
        });
        if let Err(err) = written {
            remove_quietly(&temp);
            state.stats.write_failures += 1;
            return Err(err);
        }

        let bytes = fs::metadata(&path)?.len();
        if let Some(old) = state.forget(hash) {
            if old.path != path {
                remove_quietly(&old.path);
            }
        }

        let sequence = state.bump();
        state.disk_used += bytes;
        state.entries.insert(
            hash.to_string(),
            DiskEntry {
                path,
                format: bitmap.format(),
                bytes,
                modified: SystemTime::now(),
                sequence,
            },
        );

        let limit = state.disk_limit;
        state.evict_to(limit, Some(hash));
        if state.disk_used > limit {
            // The new entry alone exceeds the budget
            if let Some(entry) = state.forget(hash) {
                remove_quietly(&entry.path);
                state.stats.evictions += 1;
            }
        }
        Ok(())
    }

    /// Load the bitmap stored under `hash` and mark it recently used
    pub fn get(&self, hash: &str) -> Result<Option<Bitmap>, DiskStoreError> {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get(hash).cloned() else {
            state.stats.misses += 1;
            return Ok(None);
        };

        let bitmap = match read_png(&entry.path, entry.format) {
            Ok(bitmap) => bitmap,
            Err(DiskStoreError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                state.forget(hash);
                state.stats.misses += 1;
                return Ok(None);
            }
            Err(err) => {
                // Unreadable entries are dropped so they are not retried forever
                if let Some(entry) = state.forget(hash) {
                    remove_quietly(&entry.path);
                }
                state.stats.misses += 1;
                return Err(err);
            }
        };

        let now = SystemTime::now();
        if let Err(err) = touch(&entry.path, now) {
            warn!(path = %entry.path.display(), error = %err, "failed to update disk cache mtime");
        }

        let sequence = state.bump();
        if let Some(entry) = state.entries.get_mut(hash) {
            entry.modified = now;
            entry.sequence = sequence;
        }
        state.stats.hits += 1;
        Ok(Some(bitmap))
    }

    /// Check presence without touching recency
    pub fn contains(&self, hash: &str) -> bool {
        self.state.lock().entries.contains_key(hash)
    }

    /// Delete one entry; returns whether it existed
    pub fn remove(&self, hash: &str) -> Result<bool, DiskStoreError> {
        let mut state = self.state.lock();
        match state.forget(hash) {
            Some(entry) => {
                match fs::remove_file(&entry.path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Evict least recently used entries down to `fraction` of the budget
    pub fn trim_to_fraction(&self, fraction: f64) -> usize {
        let mut state = self.state.lock();
        let target = (state.disk_limit as f64 * fraction.clamp(0.0, 1.0)) as u64;
        state.evict_to(target, None)
    }

    /// Change the byte budget, evicting as needed
    pub fn set_disk_limit(&self, limit: u64) {
        let mut state = self.state.lock();
        state.disk_limit = limit;
        state.evict_to(limit, None);
    }

    /// Delete every indexed entry
    pub fn clear(&self) -> Result<(), DiskStoreError> {
        let mut state = self.state.lock();
        let mut first_error = None;
        for (_, entry) in state.entries.drain() {
            if let Err(err) = fs::remove_file(&entry.path) {
                if err.kind() != io::ErrorKind::NotFound && first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        state.disk_used = 0;

        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    pub fn dir(&self) -> PathBuf {
        self.state.lock().dir.clone()
    }

    pub fn disk_used(&self) -> u64 {
        self.state.lock().disk_used
    }

    pub fn disk_limit(&self) -> u64 {
        self.state.lock().disk_limit
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> DiskCacheStats {
        let state = self.state.lock();
        DiskCacheStats {
            entry_count: state.entries.len(),
            disk_used: state.disk_used,
            disk_limit: state.disk_limit,
            ..state.stats
        }
    }
}

fn file_name(hash: &str, format: PixelFormat) -> String {
    format!("{hash}-{format}.{EXTENSION}")
}

fn parse_file_name(path: &Path) -> Option<(String, PixelFormat)> {
    if path.extension()?.to_str()? != EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let (hash, format) = stem.rsplit_once('-')?;
    if validate_hash(hash).is_err() {
        return None;
    }
    Some((hash.to_string(), format.parse().ok()?))
}

fn validate_hash(hash: &str) -> Result<(), DiskStoreError> {
    if !hash.is_empty() && hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(DiskStoreError::InvalidHash(hash.to_string()))
    }
}

fn write_png(path: &Path, bitmap: &Bitmap) -> Result<(), DiskStoreError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    match bitmap.format() {
        PixelFormat::Rgba8888 => {
            PngEncoder::new(&mut writer).write_image(
                bitmap.pixels(),
                bitmap.width(),
                bitmap.height(),
                ExtendedColorType::Rgba8,
            )?;
        }
        PixelFormat::Rgb565 => {
            let mut rgb = Vec::with_capacity(bitmap.width() as usize * bitmap.height() as usize * 3);
            for pixel in bitmap.pixels().chunks_exact(2) {
                rgb.extend_from_slice(&unpack_rgb565(u16::from_le_bytes([pixel[0], pixel[1]])));
            }
            PngEncoder::new(&mut writer).write_image(
                &rgb,
                bitmap.width(),
                bitmap.height(),
                ExtendedColorType::Rgb8,
            )?;
        }
    }

    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

fn read_png(path: &Path, format: PixelFormat) -> Result<Bitmap, DiskStoreError> {
    let bytes = fs::read(path)?;
    let image = image::load_from_memory_with_format(&bytes, ImageFormat::Png)?;
    let (width, height) = (image.width(), image.height());

    let pixels = match format {
        PixelFormat::Rgba8888 => image.into_rgba8().into_raw(),
        PixelFormat::Rgb565 => {
            let rgb = image.into_rgb8();
            let mut packed = Vec::with_capacity(width as usize * height as usize * 2);
            for pixel in rgb.pixels() {
                let [r, g, b] = pixel.0;
                packed.extend_from_slice(&pack_rgb565(r, g, b).to_le_bytes());
            }
            packed
        }
    };

    Ok(Bitmap::from_pixels(width, height, format, pixels)?)
}

fn touch(path: &Path, when: SystemTime) -> io::Result<()> {
    File::options().write(true).open(path)?.set_modified(when)
}

fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed to remove disk cache file");
        }
    }
}
