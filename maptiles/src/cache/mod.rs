//! Persistent, size-bounded tile cache.
//!
//! Each namespace gets its own directory, and tiles are laid out as
//! `{namespace}/{zoom}/{x}/{y}-{size}.tile`. Files are written to a temporary name first and then
//! renamed, so a crash never leaves a partially written tile behind. Recency of the entries is
//! kept in memory, and persisted as files' modification times, so it survives restarts.

mod entry;

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::SystemTime,
};

use bytes::Bytes;
use chrono::Utc;
use lru::LruCache;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

pub use entry::CachedTile;

use crate::{Error, TileCoordinate};

/// Default size budget of a [`FileCache`], 100 MB.
pub const DEFAULT_SIZE_LIMIT: u64 = 100_000_000;

const TILE_EXTENSION: &str = "tile";
const TEMP_EXTENSION: &str = "tmp";

/// Where and how much a [`FileCache`] stores.
#[derive(Debug, Clone)]
pub struct FileCacheOptions {
    /// Directory shared by all namespaces.
    pub directory: PathBuf,

    /// Subdirectory of [`FileCacheOptions::directory`]. Different tile sources should use
    /// different namespaces, see [`namespace_from_url_template`].
    pub namespace: String,

    /// Total size of stored files, in bytes.
    pub size_limit: u64,
}

impl Default for FileCacheOptions {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            namespace: "default".to_owned(),
            size_limit: DEFAULT_SIZE_LIMIT,
        }
    }
}

/// User's cache directory, falling back to the temporary one on systems which do not have it.
pub fn default_directory() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(env!("CARGO_PKG_NAME"))
}

/// Turn URL template of a tile source into something usable as a [`FileCacheOptions::namespace`].
pub fn namespace_from_url_template(url_template: &str) -> String {
    url_template
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// In-memory knowledge about the files in the namespace directory. Recency is tracked by the
/// order of the LRU, values are file sizes.
struct Index {
    entries: LruCache<TileCoordinate, u64>,
    total_size: u64,
}

impl Index {
    fn empty() -> Self {
        Self {
            entries: LruCache::unbounded(),
            total_size: 0,
        }
    }

    fn insert(&mut self, coordinate: TileCoordinate, size: u64) {
        if let Some(previous) = self.entries.put(coordinate, size) {
            self.total_size -= previous;
        }
        self.total_size += size;
    }

    fn remove(&mut self, coordinate: &TileCoordinate) -> Option<u64> {
        let size = self.entries.pop(coordinate)?;
        self.total_size -= size;
        Some(size)
    }

    /// Rebuild the index from the files on disk. Temporary files left by interrupted writes are
    /// removed on the way.
    async fn scan(root: &Path) -> Result<Self, Error> {
        let mut found = Vec::new();

        for (zoom, zoom_path) in subdirectories::<u8>(root).await? {
            for (x, x_path) in subdirectories::<u32>(&zoom_path).await? {
                for (name, path, metadata) in directory_entries(&x_path).await? {
                    if !metadata.is_file() {
                        continue;
                    }

                    if name.ends_with(TEMP_EXTENSION) {
                        if is_written_by_this_process(&name) {
                            // Store in progress, possibly by another cache of this namespace.
                            continue;
                        }

                        log::debug!("Removing leftover {}.", path.display());
                        if let Err(error) = tokio::fs::remove_file(&path).await {
                            log::warn!("Could not remove {}: {error}", path.display());
                        }
                        continue;
                    }

                    let Some((y, size)) = parse_tile_file_name(&name) else {
                        log::trace!("Ignoring {}.", path.display());
                        continue;
                    };

                    let accessed = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                    found.push((accessed, TileCoordinate { x, y, zoom, size }, metadata.len()));
                }
            }
        }

        // Oldest first, so the most recently used ends up at the front of the LRU.
        found.sort_by_key(|(accessed, ..)| *accessed);

        let mut index = Self::empty();
        for (_, coordinate, size) in found {
            index.insert(coordinate, size);
        }

        log::debug!(
            "Found {} tiles ({} bytes) in {}.",
            index.entries.len(),
            index.total_size,
            root.display()
        );
        Ok(index)
    }
}

/// Temporary files are named `{tile}.{pid}.{counter}.tmp`.
fn is_written_by_this_process(name: &str) -> bool {
    name.strip_suffix(TEMP_EXTENSION)
        .and_then(|stem| stem.strip_suffix('.'))
        .and_then(|stem| stem.rsplit('.').nth(1))
        .and_then(|pid| pid.parse::<u32>().ok())
        .is_some_and(|pid| pid == std::process::id())
}

fn parse_tile_file_name(name: &str) -> Option<(u32, u32)> {
    let stem = name.strip_suffix(TILE_EXTENSION)?.strip_suffix('.')?;
    let (y, size) = stem.split_once('-')?;
    Some((y.parse().ok()?, size.parse().ok()?))
}

/// Entries of a directory. Missing directory is treated as an empty one.
async fn directory_entries(
    directory: &Path,
) -> Result<Vec<(String, PathBuf, std::fs::Metadata)>, Error> {
    let mut read_dir = match tokio::fs::read_dir(directory).await {
        Ok(read_dir) => read_dir,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(Error::io(directory, error)),
    };

    let mut entries = Vec::new();
    while let Some(entry) = read_dir
        .next_entry()
        .await
        .map_err(|error| Error::io(directory, error))?
    {
        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            // Removed while scanning.
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => continue,
            Err(error) => return Err(Error::io(path, error)),
        };

        if let Some(name) = entry.file_name().to_str() {
            entries.push((name.to_owned(), path, metadata));
        }
    }

    Ok(entries)
}

/// Subdirectories, whose names parse as `T`.
async fn subdirectories<T: std::str::FromStr>(
    directory: &Path,
) -> Result<Vec<(T, PathBuf)>, Error> {
    Ok(directory_entries(directory)
        .await?
        .into_iter()
        .filter(|(_, _, metadata)| metadata.is_dir())
        .filter_map(|(name, path, _)| Some((name.parse().ok()?, path)))
        .collect())
}

/// Tile cache storing tiles as files on disk.
///
/// All operations are asynchronous and can be called concurrently. Mutations of the index and
/// the files it describes are serialized.
pub struct FileCache {
    root: PathBuf,
    namespace: String,
    size_limit: AtomicU64,

    /// Loaded lazily, on the first operation which needs it.
    index: Mutex<Option<Index>>,
}

impl FileCache {
    pub fn new(options: FileCacheOptions) -> Self {
        // Namespace must not escape the cache directory.
        let namespace: String = options
            .namespace
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        Self {
            root: options.directory.join(&namespace),
            namespace,
            size_limit: AtomicU64::new(options.size_limit),
            index: Mutex::new(None),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Directory holding the files of this namespace.
    pub fn directory(&self) -> &Path {
        &self.root
    }

    pub fn size_limit(&self) -> u64 {
        self.size_limit.load(Ordering::Relaxed)
    }

    /// Change the size budget. Takes effect with the next store or [`FileCache::purge`].
    pub fn set_size_limit(&self, size_limit: u64) {
        self.size_limit.store(size_limit, Ordering::Relaxed);
    }

    fn path(&self, coordinate: &TileCoordinate) -> PathBuf {
        self.root
            .join(coordinate.zoom.to_string())
            .join(coordinate.x.to_string())
            .join(format!(
                "{}-{}.{TILE_EXTENSION}",
                coordinate.y, coordinate.size
            ))
    }

    async fn index(&self) -> Result<MappedMutexGuard<'_, Index>, Error> {
        let mut guard = self.index.lock().await;
        if guard.is_none() {
            *guard = Some(Index::scan(&self.root).await?);
        }
        Ok(MutexGuard::map(guard, |index| {
            index.get_or_insert_with(Index::empty)
        }))
    }

    /// Get the tile, or `None` if it is not cached.
    pub async fn get(&self, coordinate: &TileCoordinate) -> Result<Option<CachedTile>, Error> {
        let path = self.path(coordinate);

        {
            let mut index = self.index().await?;
            // Promotes the entry in the LRU.
            if index.entries.get(coordinate).is_none() {
                log::trace!("{coordinate} is not cached.");
                return Ok(None);
            }
        }

        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => Bytes::from(raw),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                // Evicted (or removed by someone else) in the meantime.
                log::debug!("{coordinate} disappeared before it could be read.");
                let mut index = self.index().await?;
                // Files are only created with the index locked, so this can not race with
                // a store of the same tile.
                if !tokio::fs::try_exists(&path).await.unwrap_or(true) {
                    index.remove(coordinate);
                }
                return Ok(None);
            }
            Err(error) => return Err(Error::io(path, error)),
        };

        let tile = match entry::decode(raw) {
            Ok(tile) => tile,
            Err(reason) => {
                log::warn!("{} is corrupted: {reason}.", path.display());
                self.remove(coordinate).await?;
                return Err(Error::Corrupted { path, reason });
            }
        };

        touch(path).await;
        Ok(Some(tile))
    }

    /// Store the tile, replacing whatever was stored for this coordinate before. Least recently
    /// used tiles are evicted if the cache grows over its size limit.
    pub async fn store(
        &self,
        coordinate: &TileCoordinate,
        data: &[u8],
        etag: Option<&str>,
    ) -> Result<(), Error> {
        let raw = entry::encode(data, etag, Utc::now());
        let size = raw.len() as u64;
        let path = self.path(coordinate);

        // Loading the index scans for leftover temporary files, so it must happen before this
        // store creates its own.
        drop(self.index().await?);
        let temp_path = self.write_temp(&path, &raw).await?;

        let mut index = self.index().await?;

        if let Err(error) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(Error::io(path, error));
        }

        log::trace!("Stored {coordinate} ({size} bytes).");
        index.insert(*coordinate, size);
        self.evict(&mut index, Some(coordinate)).await
    }

    /// Mark the tile as freshly validated, e.g. after the server responded with
    /// `304 Not Modified`.
    pub async fn mark_up_to_date(&self, coordinate: &TileCoordinate) -> Result<(), Error> {
        let path = self.path(coordinate);
        let mut index = self.index().await?;

        if index.entries.get(coordinate).is_none() {
            return Ok(());
        }

        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                index.remove(coordinate);
                return Ok(());
            }
            Err(error) => return Err(Error::io(path, error)),
        };

        let raw = entry::with_modified(&raw, Utc::now())
            .map_err(|reason| Error::Corrupted {
                path: path.clone(),
                reason,
            })?;

        let temp_path = self.write_temp(&path, &raw).await?;
        tokio::fs::rename(&temp_path, &path)
            .await
            .map_err(|error| Error::io(&path, error))?;

        log::trace!("{coordinate} is up to date.");
        Ok(())
    }

    /// Remove a single tile. Returns whether it was cached.
    pub async fn remove(&self, coordinate: &TileCoordinate) -> Result<bool, Error> {
        let mut index = self.index().await?;
        let path = self.path(coordinate);

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(Error::io(path, error)),
        }

        Ok(index.remove(coordinate).is_some())
    }

    /// Remove all tiles of this namespace.
    pub async fn clear(&self) -> Result<(), Error> {
        let mut guard = self.index.lock().await;

        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(Error::io(&self.root, error)),
        }

        log::debug!("Cleared {}.", self.root.display());
        *guard = Some(Index::empty());
        Ok(())
    }

    /// Evict least recently used tiles until the cache fits its size limit.
    pub async fn purge(&self) -> Result<(), Error> {
        let mut index = self.index().await?;
        self.evict(&mut index, None).await
    }

    /// Total size of the files in the cache, in bytes.
    pub async fn total_size(&self) -> Result<u64, Error> {
        Ok(self.index().await?.total_size)
    }

    /// Number of cached tiles.
    pub async fn len(&self) -> Result<usize, Error> {
        Ok(self.index().await?.entries.len())
    }

    pub async fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.len().await? == 0)
    }

    async fn evict(&self, index: &mut Index, current: Option<&TileCoordinate>) -> Result<(), Error> {
        let size_limit = self.size_limit();

        if let Some(current) = current {
            // Make sure it goes last.
            index.entries.promote(current);
        }

        while index.total_size > size_limit {
            let Some((&coordinate, _)) = index.entries.peek_lru() else {
                break;
            };

            if Some(&coordinate) == current {
                log::warn!("{coordinate} alone exceeds the size limit of {size_limit} bytes.");
            }

            let path = self.path(&coordinate);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => return Err(Error::io(path, error)),
            }

            log::trace!("Evicted {coordinate}.");
            index.remove(&coordinate);
        }

        Ok(())
    }

    async fn write_temp(&self, path: &Path, raw: &[u8]) -> Result<PathBuf, Error> {
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| Error::io(parent, error))?;
        }

        let temp_path = path.with_extension(format!(
            "{TILE_EXTENSION}.{}.{}.{TEMP_EXTENSION}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        tokio::fs::write(&temp_path, raw)
            .await
            .map_err(|error| Error::io(&temp_path, error))?;

        Ok(temp_path)
    }
}

/// Record the access in the file's modification time, so recency survives restarts.
async fn touch(path: PathBuf) {
    let result = tokio::task::spawn_blocking(move || {
        filetime::set_file_mtime(&path, filetime::FileTime::now())
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(error)) => log::debug!("Could not update access time: {error}"),
        Err(error) => log::debug!("Could not update access time: {error}"),
    }
}
