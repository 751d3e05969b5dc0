//! Types and functions for working with positions.

/// Geographical position with latitude and longitude.
pub type Position = geo_types::Point;

/// Location projected on an abstract bitmap of the whole map.
pub type Pixels = geo_types::Point;

/// Southernmost latitude representable in Web Mercator.
pub const MIN_LATITUDE: f64 = -85.0511287798;

/// Northernmost latitude representable in Web Mercator.
pub const MAX_LATITUDE: f64 = 85.0511287798;

pub const MIN_LONGITUDE: f64 = -180.0;
pub const MAX_LONGITUDE: f64 = 180.0;

/// Construct `Position` from latitude and longitude.
pub fn lat_lon(lat: f64, lon: f64) -> Position {
    Position::new(lon, lat)
}

/// Construct `Position` from longitude and latitude. Note that it is common standard to write
/// coordinates starting with the latitude instead (e.g. `45.466, -73.75` is Montreal).
pub fn lon_lat(lon: f64, lat: f64) -> Position {
    Position::new(lon, lat)
}

/// Wrap longitude into `[-180, 180)`.
pub fn wrap_longitude(longitude: f64) -> f64 {
    if (MIN_LONGITUDE..MAX_LONGITUDE).contains(&longitude) {
        // Keeps exact values intact, `rem_euclid` would round some of them.
        longitude
    } else {
        (longitude - MIN_LONGITUDE).rem_euclid(360.0) + MIN_LONGITUDE
    }
}

/// Clamp latitude into the range which Mercator can project without going to infinity.
pub fn clamp_latitude(latitude: f64) -> f64 {
    latitude.clamp(MIN_LATITUDE, MAX_LATITUDE)
}

/// Position with latitude clamped and longitude wrapped.
pub fn normalized(position: Position) -> Position {
    lat_lon(clamp_latitude(position.y()), wrap_longitude(position.x()))
}
