use std::num::NonZeroUsize;

use bytes::Bytes;
use lru::LruCache;

use crate::TileCoordinate;

/// Default number of tiles kept by [`MemoryCache`].
#[allow(clippy::unwrap_used)] // Checked at compile time.
pub const DEFAULT_MEMORY_CAPACITY: NonZeroUsize = NonZeroUsize::new(100).unwrap();

/// Count-bounded cache of tile bytes, keyed by source and coordinate, so several sources can
/// share one.
pub struct MemoryCache {
    tiles: LruCache<(String, TileCoordinate), Bytes>,
}

impl MemoryCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            tiles: LruCache::new(capacity),
        }
    }

    pub fn get(&mut self, source_id: &str, coordinate: &TileCoordinate) -> Option<Bytes> {
        self.tiles
            .get(&(source_id.to_owned(), *coordinate))
            .cloned()
    }

    pub fn put(&mut self, source_id: &str, coordinate: TileCoordinate, data: Bytes) {
        self.tiles.put((source_id.to_owned(), coordinate), data);
    }

    pub fn remove(&mut self, source_id: &str, coordinate: &TileCoordinate) -> Option<Bytes> {
        self.tiles.pop(&(source_id.to_owned(), *coordinate))
    }

    pub fn clear(&mut self) {
        self.tiles.clear();
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn capacity(&self) -> NonZeroUsize {
        self.tiles.cap()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(x: u32) -> TileCoordinate {
        TileCoordinate::new(x, 0, 4, 256)
    }

    #[test]
    fn oldest_tiles_are_dropped() {
        let mut cache = MemoryCache::new(NonZeroUsize::new(2).unwrap());
        cache.put("osm", tile(0), Bytes::from_static(b"0"));
        cache.put("osm", tile(1), Bytes::from_static(b"1"));

        // Touch the first one, so the second one is the oldest.
        assert!(cache.get("osm", &tile(0)).is_some());
        cache.put("osm", tile(2), Bytes::from_static(b"2"));

        assert_eq!(2, cache.len());
        assert!(cache.get("osm", &tile(1)).is_none());
        assert_eq!(Some(Bytes::from_static(b"0")), cache.get("osm", &tile(0)));
        assert_eq!(Some(Bytes::from_static(b"2")), cache.get("osm", &tile(2)));
    }

    #[test]
    fn sources_do_not_share_tiles() {
        let mut cache = MemoryCache::default();
        assert_eq!(100, cache.capacity().get());

        cache.put("osm", tile(0), Bytes::from_static(b"osm"));
        assert!(cache.get("other", &tile(0)).is_none());
        assert_eq!(Some(Bytes::from_static(b"osm")), cache.remove("osm", &tile(0)));
        assert!(cache.is_empty());
    }
}
