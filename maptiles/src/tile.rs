use std::fmt;

use crate::{
    position::Pixels,
    projection::total_tiles,
    zoom::MAX_SUPPORTED_ZOOM,
};

/// Coordinates of an OSM-like tile, together with its size in pixels.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TileCoordinate {
    /// X number of the tile.
    pub x: u32,

    /// Y number of the tile, counted from the north.
    pub y: u32,

    /// Zoom level, where 0 means that the whole world is one tile.
    /// See: <https://wiki.openstreetmap.org/wiki/Zoom_levels>
    pub zoom: u8,

    /// Width and height of the tile in pixels.
    pub size: u32,
}

impl TileCoordinate {
    pub fn new(x: u32, y: u32, zoom: u8, size: u32) -> Self {
        Self { x, y, zoom, size }
    }

    /// Whether the tile exists in the tile grid at its zoom level.
    pub fn valid(&self) -> bool {
        let total_tiles = total_tiles(self.zoom);
        self.zoom <= MAX_SUPPORTED_ZOOM && self.x < total_tiles && self.y < total_tiles && self.size > 0
    }

    /// Y counted from the south, as used by TMS servers.
    pub fn tms_y(&self) -> u32 {
        (total_tiles(self.zoom) - 1).saturating_sub(self.y)
    }

    /// Tile position (in pixels) on the "World bitmap".
    pub fn project(&self) -> Pixels {
        let size = self.size as f64;
        Pixels::new(self.x as f64 * size, self.y as f64 * size)
    }

    fn with_xy(&self, x: u32, y: u32) -> Self {
        Self { x, y, ..*self }
    }

    pub fn east(&self) -> Option<TileCoordinate> {
        (self.x < total_tiles(self.zoom) - 1).then(|| self.with_xy(self.x + 1, self.y))
    }

    pub fn west(&self) -> Option<TileCoordinate> {
        Some(self.with_xy(self.x.checked_sub(1)?, self.y))
    }

    pub fn north(&self) -> Option<TileCoordinate> {
        Some(self.with_xy(self.x, self.y.checked_sub(1)?))
    }

    pub fn south(&self) -> Option<TileCoordinate> {
        (self.y < total_tiles(self.zoom) - 1).then(|| self.with_xy(self.x, self.y + 1))
    }
}

impl fmt::Display for TileCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}@{}", self.zoom, self.x, self.y, self.size)
    }
}
