use std::{
    future::Future,
    io::Cursor,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use image::{ImageFormat, Rgba, RgbaImage};

use crate::{
    Error, TileCoordinate,
    io::{Fetched, RemoteSource, Validator},
};

#[derive(Default)]
struct Counters {
    fetches: AtomicUsize,
    failing: AtomicBool,
}

/// Source rendering a checkerboard locally, without any network. Useful for testing and
/// for checking tile alignment. Clones share the fetch counter.
#[derive(Clone)]
pub struct TestPattern {
    tile_size: u32,
    delay: Option<Duration>,
    counters: Arc<Counters>,
}

impl Default for TestPattern {
    fn default() -> Self {
        Self::new()
    }
}

impl TestPattern {
    pub fn new() -> Self {
        Self {
            tile_size: 256,
            delay: None,
            counters: Arc::default(),
        }
    }

    /// Wait this long before answering each fetch.
    pub fn with_delay(self, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..self
        }
    }

    pub fn with_tile_size(self, tile_size: u32) -> Self {
        Self { tile_size, ..self }
    }

    /// How many times a tile was fetched, successfully or not.
    pub fn fetches(&self) -> usize {
        self.counters.fetches.load(Ordering::SeqCst)
    }

    /// Make fetches fail, as if the origin was unreachable.
    pub fn set_failing(&self, failing: bool) {
        self.counters.failing.store(failing, Ordering::SeqCst);
    }

    /// Entity tag of the tile. It does not change, as the pattern does not.
    pub fn etag(coordinate: &TileCoordinate) -> String {
        format!(
            "\"{}-{}-{}-{}\"",
            coordinate.zoom, coordinate.x, coordinate.y, coordinate.size
        )
    }

    /// Render the tile as PNG.
    pub fn render(&self, coordinate: &TileCoordinate) -> Result<Bytes, Error> {
        let size = self.tile_size;
        let cell = (size / 8).max(1);
        let dark = if (coordinate.x + coordinate.y) % 2 == 0 {
            Rgba([0x30, 0x30, 0x30, 0xff])
        } else {
            Rgba([0x30, 0x30, 0x80, 0xff])
        };
        let light = Rgba([0xe0, 0xe0, 0xe0, 0xff]);

        let image = RgbaImage::from_fn(size, size, |x, y| {
            if x == 0 || y == 0 {
                Rgba([0xff, 0x00, 0x00, 0xff])
            } else if (x / cell + y / cell) % 2 == 0 {
                dark
            } else {
                light
            }
        });

        let mut png = Cursor::new(Vec::new());
        image.write_to(&mut png, ImageFormat::Png)?;
        Ok(Bytes::from(png.into_inner()))
    }

    async fn fetch_impl(
        &self,
        coordinate: TileCoordinate,
        validator: Validator,
    ) -> Result<Fetched, Error> {
        self.counters.fetches.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.counters.failing.load(Ordering::SeqCst) {
            return Err(Error::BadResponse(reqwest::StatusCode::SERVICE_UNAVAILABLE));
        }

        let etag = Self::etag(&coordinate);
        if validator.etag.as_deref() == Some(etag.as_str()) {
            return Ok(Fetched::NotModified);
        }

        Ok(Fetched::Modified {
            data: self.render(&coordinate)?,
            etag: Some(etag),
        })
    }
}

impl RemoteSource for TestPattern {
    fn id(&self) -> &str {
        "test-pattern"
    }

    fn tile_size(&self) -> u32 {
        self.tile_size
    }

    fn fetch(
        &self,
        coordinate: TileCoordinate,
        validator: Validator,
    ) -> impl Future<Output = Result<Fetched, Error>> + Send {
        self.fetch_impl(coordinate, validator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn renders_decodable_tiles() {
        let source = TestPattern::new().with_tile_size(512);
        let coordinate = TileCoordinate::new(0, 0, 0, 512);

        let Fetched::Modified { data, etag } = source
            .fetch(coordinate, Validator::default())
            .await
            .unwrap()
        else {
            panic!("expected data");
        };

        let image = image::load_from_memory(&data).unwrap();
        assert_eq!((512, 512), (image.width(), image.height()));
        assert_eq!(Some("\"0-0-0-512\"".to_owned()), etag);
        assert_eq!(1, source.fetches());
    }

    #[tokio::test]
    async fn revalidation_with_matching_etag() {
        let source = TestPattern::new();
        let coordinate = TileCoordinate::new(1, 0, 1, 256);

        let validator = Validator {
            etag: Some(TestPattern::etag(&coordinate)),
            modified: None,
        };
        assert_eq!(
            Fetched::NotModified,
            source.fetch(coordinate, validator).await.unwrap()
        );

        let validator = Validator {
            etag: Some("\"something else\"".to_owned()),
            modified: None,
        };
        assert!(matches!(
            source.fetch(coordinate, validator).await.unwrap(),
            Fetched::Modified { .. }
        ));
        assert_eq!(2, source.fetches());
    }

    #[tokio::test]
    async fn failing_source() {
        let source = TestPattern::new();
        let clone = source.clone();
        clone.set_failing(true);

        let result = source
            .fetch(TileCoordinate::new(0, 0, 0, 256), Validator::default())
            .await;

        assert!(matches!(result, Err(Error::BadResponse(_))));
        assert_eq!(1, clone.fetches());
    }
}
