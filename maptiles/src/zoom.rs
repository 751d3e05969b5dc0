#[derive(thiserror::Error, Debug, PartialEq, Eq, Clone, Copy)]
#[error("invalid zoom level")]
pub struct InvalidZoom;

/// Highest zoom level which still fits tile indices into `u32`.
pub const MAX_SUPPORTED_ZOOM: u8 = 30;

/// Zoom levels served by a tile source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ZoomRange {
    min: u8,
    max: u8,
}

impl ZoomRange {
    pub fn new(min: u8, max: u8) -> Result<Self, InvalidZoom> {
        if min > max || max > MAX_SUPPORTED_ZOOM {
            Err(InvalidZoom)
        } else {
            Ok(Self { min, max })
        }
    }

    /// Range known at compile time. Use it in a `const`, so invalid bounds fail the build.
    pub(crate) const fn known(min: u8, max: u8) -> Self {
        assert!(min <= max && max <= MAX_SUPPORTED_ZOOM, "invalid zoom range");
        Self { min, max }
    }

    pub fn min(&self) -> u8 {
        self.min
    }

    pub fn max(&self) -> u8 {
        self.max
    }

    pub fn contains(&self, zoom: u8) -> bool {
        (self.min..=self.max).contains(&zoom)
    }

    /// Fractional zoom limited to this range.
    pub fn clamp(&self, zoom: f64) -> f64 {
        zoom.clamp(self.min as f64, self.max as f64)
    }

    /// Iterate from `min` to `max` (both inclusive) using fractional steps.
    pub fn steps(&self, step: f64) -> impl Iterator<Item = f64> + use<> {
        let (min, max) = (self.min as f64, self.max as f64);
        let count = if step > 0.0 {
            ((max - min) / step).floor() as usize + 1
        } else {
            1
        };
        (0..count).map(move |i| min + i as f64 * step)
    }
}

impl Default for ZoomRange {
    /// Zoom levels of OpenStreetMap's Mapnik.
    /// <https://wiki.openstreetmap.org/wiki/Slippy_map_tilenames#Zoom_levels>
    fn default() -> Self {
        Self { min: 0, max: 19 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructing_zoom_range() {
        let range = ZoomRange::default();
        assert_eq!(0, range.min());
        assert_eq!(19, range.max());

        assert!(ZoomRange::new(3, 3).is_ok());
        assert_eq!(Err(InvalidZoom), ZoomRange::new(5, 4));
        assert_eq!(Err(InvalidZoom), ZoomRange::new(0, 31));

        const KNOWN: ZoomRange = ZoomRange::known(0, 18);
        assert_eq!(ZoomRange::new(0, 18), Ok(KNOWN));
    }

    #[test]
    #[should_panic(expected = "invalid zoom range")]
    fn invalid_known_zoom_range() {
        let _ = ZoomRange::known(5, 4);
    }

    #[test]
    fn zoom_range_limits() {
        let range = ZoomRange::new(2, 10).unwrap();
        assert!(!range.contains(1));
        assert!(range.contains(2));
        assert!(range.contains(10));
        assert!(!range.contains(11));

        assert_eq!(2.0, range.clamp(0.5));
        assert_eq!(7.5, range.clamp(7.5));
        assert_eq!(10.0, range.clamp(12.0));
    }

    #[test]
    fn stepping_through_zoom_levels() {
        let steps: Vec<f64> = ZoomRange::new(0, 2).unwrap().steps(0.5).collect();
        assert_eq!(steps, vec![0.0, 0.5, 1.0, 1.5, 2.0]);

        assert_eq!(39, ZoomRange::default().steps(0.5).count());
    }
}
