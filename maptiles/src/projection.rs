//! Project the lat/lon coordinates into a 2D x/y using the Web Mercator.
//! <https://en.wikipedia.org/wiki/Web_Mercator_projection>
//! <https://wiki.openstreetmap.org/wiki/Slippy_map_tilenames>

use std::f64::consts::PI;

use crate::{
    TileCoordinate,
    position::{Pixels, Position, clamp_latitude, lat_lon, wrap_longitude},
};

// zoom level   tile coverage  number of tiles  tile size(*) in degrees
// 0            1 tile         1 tile           360° x 170.1022°
// 1            2 × 2 tiles    4 tiles          180° x 85.0511°
// 2            4 × 4 tiles    16 tiles         90° x [variable]

/// Equatorial radius of the WGS84 ellipsoid, in meters.
const EARTH_RADIUS: f64 = 6_378_137.0;

/// Zoom specifies how many pixels are in the whole map. For example, zoom 0 means that the whole
/// map is just one tile, zoom 1 means that it is 2x2 tiles, and so on. Works for fractional zoom
/// levels too.
pub fn total_pixels(zoom: f64, tile_size: u32) -> f64 {
    2f64.powf(zoom) * (tile_size as f64)
}

/// Number of tiles in a single row (or column) of the map.
pub fn total_tiles(zoom: u8) -> u32 {
    2u32.saturating_pow(zoom as u32)
}

/// Ground distance covered by a single pixel at given latitude.
pub fn meters_per_pixel(zoom: f64, tile_size: u32, latitude: f64) -> f64 {
    let latitude = clamp_latitude(latitude).to_radians();
    latitude.cos() * 2. * PI * EARTH_RADIUS / total_pixels(zoom, tile_size)
}

/// Map projection used by a tile source.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Projection {
    #[default]
    Mercator,
}

impl Projection {
    /// Longitude mapped into 0-1 range.
    fn normalized_x(&self, longitude: f64) -> f64 {
        match self {
            Projection::Mercator => (wrap_longitude(longitude) + 180.) / 360.,
        }
    }

    fn longitude(&self, normalized_x: f64) -> f64 {
        match self {
            Projection::Mercator => normalized_x * 360. - 180.,
        }
    }

    /// Latitude mapped into 0-1 range, north pole being 0.
    fn normalized_y(&self, latitude: f64) -> f64 {
        match self {
            Projection::Mercator => {
                let phi = clamp_latitude(latitude).to_radians();
                (1. - (PI / 4. + phi / 2.).tan().ln() / PI) / 2.
            }
        }
    }

    fn latitude(&self, normalized_y: f64) -> f64 {
        match self {
            Projection::Mercator => (PI * (1. - 2. * normalized_y)).sinh().atan().to_degrees(),
        }
    }

    /// Project geographical position into the bitmap of the whole map.
    pub fn project(&self, position: Position, zoom: f64, tile_size: u32) -> Pixels {
        let total_pixels = total_pixels(zoom, tile_size);
        Pixels::new(
            self.normalized_x(position.x()) * total_pixels,
            self.normalized_y(position.y()) * total_pixels,
        )
    }

    /// Transforms pixels of the whole map's bitmap into a geographical position.
    pub fn unproject(&self, pixels: Pixels, zoom: f64, tile_size: u32) -> Position {
        let total_pixels = total_pixels(zoom, tile_size);
        lat_lon(
            self.latitude(pixels.y() / total_pixels),
            self.longitude(pixels.x() / total_pixels),
        )
    }

    /// Tile containing given position.
    pub fn tile_at(&self, position: Position, zoom: u8, tile_size: u32) -> TileCoordinate {
        let number_of_tiles = total_tiles(zoom);
        let last = (number_of_tiles - 1) as f64;
        let index = |normalized: f64| (normalized * number_of_tiles as f64).floor().clamp(0., last);

        TileCoordinate {
            x: index(self.normalized_x(position.x())) as u32,
            y: index(self.normalized_y(position.y())) as u32,
            zoom,
            size: tile_size,
        }
    }
}

/// [`Projection`] bound to a tile size, converting single axes at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Projector {
    pub projection: Projection,
    pub tile_size: u32,
}

impl Projector {
    pub fn new(projection: Projection, tile_size: u32) -> Self {
        Self {
            projection,
            tile_size,
        }
    }

    pub fn longitude_to_x(&self, zoom: f64, longitude: f64) -> f64 {
        self.projection.normalized_x(longitude) * total_pixels(zoom, self.tile_size)
    }

    pub fn x_to_longitude(&self, zoom: f64, x: f64) -> f64 {
        self.projection
            .longitude(x / total_pixels(zoom, self.tile_size))
    }

    pub fn latitude_to_y(&self, zoom: f64, latitude: f64) -> f64 {
        self.projection.normalized_y(latitude) * total_pixels(zoom, self.tile_size)
    }

    pub fn y_to_latitude(&self, zoom: f64, y: f64) -> f64 {
        self.projection
            .latitude(y / total_pixels(zoom, self.tile_size))
    }

    pub fn meters_per_pixel(&self, zoom: f64, latitude: f64) -> f64 {
        meters_per_pixel(zoom, self.tile_size, latitude)
    }
}

impl Default for Projector {
    fn default() -> Self {
        Self::new(Projection::Mercator, 256)
    }
}
