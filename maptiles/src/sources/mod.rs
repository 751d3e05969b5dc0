//! Tile providers, and descriptions of some common tile servers. Make sure you follow terms of
//! usage of the particular server.

pub mod maps_for_free;
pub mod openstreetmap;
pub mod openweathermap;
mod registry;
mod test_pattern;

use std::future::Future;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

pub use registry::{MapSourceRegistry, presets};
pub use test_pattern::TestPattern;

use crate::{
    DataSourceRequest, Error, Projection, TileCoordinate, ZoomRange,
    cache::namespace_from_url_template,
    io::{Fetched, RemoteSource, Validator},
};

/// Static description of a tile source.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MapSourceDesc {
    /// Unique identifier, e.g. `osm-mapnik`.
    pub id: String,

    /// Human readable name.
    pub name: String,

    /// Attribution text which should be displayed along with the map.
    pub license: String,

    pub license_url: String,

    pub zoom_range: ZoomRange,

    /// Size of each tile in pixels.
    pub tile_size: u32,

    pub projection: Projection,

    /// URL of the tiles, see [`crate::io::http::expand_url_template`] for the placeholders.
    pub url_template: String,
}

impl MapSourceDesc {
    /// Description with default zoom range, 256px tiles and no license.
    pub fn new(id: impl Into<String>, url_template: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            license: String::new(),
            license_url: String::new(),
            zoom_range: ZoomRange::default(),
            tile_size: 256,
            projection: Projection::Mercator,
            url_template: url_template.into(),
        }
    }

    /// Namespace of the [`crate::FileCache`] for this source. Derived from the URL, so sources
    /// pointing at the same server share cached tiles.
    pub fn cache_namespace(&self) -> String {
        namespace_from_url_template(&self.url_template)
    }
}

/// Something able to fill a [`DataSourceRequest`] with tile data.
pub trait TileProvider: Send + Sync + 'static {
    /// Unique identifier, used e.g. to key caches.
    fn id(&self) -> &str;

    /// Size of each tile in pixels.
    fn tile_size(&self) -> u32;

    fn zoom_range(&self) -> ZoomRange;

    fn projection(&self) -> Projection {
        Projection::Mercator
    }

    /// Whether this provider has tiles for the coordinate at all.
    fn accepts(&self, coordinate: &TileCoordinate) -> bool {
        coordinate.valid()
            && coordinate.size == self.tile_size()
            && self.zoom_range().contains(coordinate.zoom)
    }

    /// Resolve the request. Provider is expected to complete it, either with data or an error,
    /// and should stop as soon as `cancellation` is triggered.
    fn fill(
        &self,
        request: &DataSourceRequest,
        cancellation: &CancellationToken,
    ) -> impl Future<Output = ()> + Send;
}

/// Complete the request with the outcome. Request being completed already is not fatal, but
/// should not happen.
pub(crate) fn finish(request: &DataSourceRequest, outcome: Result<Bytes, Error>) {
    let result = match outcome {
        Ok(data) => request.emit_data(data, true),
        Err(error) => request.emit_error(error),
    };

    match result {
        Ok(()) => {}
        // Pipeline cancels requests on its own when it goes away.
        Err(Error::AlreadyCompleted) => {
            log::debug!("{} was completed already.", request.coordinate())
        }
        Err(error) => log::warn!("Could not finish {}: {error}", request.coordinate()),
    }
}

/// Fetch from the remote source unless cancelled first.
pub(crate) async fn fetch_cancellable<R: RemoteSource>(
    source: &R,
    coordinate: TileCoordinate,
    validator: Validator,
    cancellation: &CancellationToken,
) -> Result<Fetched, Error> {
    tokio::select! {
        biased;
        () = cancellation.cancelled() => Err(Error::Cancelled),
        fetched = source.fetch(coordinate, validator) => fetched,
    }
}

/// Provider going straight to the [`RemoteSource`], without any caching.
pub struct Remote<R> {
    source: R,
}

impl<R: RemoteSource> Remote<R> {
    pub fn new(source: R) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &R {
        &self.source
    }

    async fn fill_impl(&self, request: &DataSourceRequest, cancellation: &CancellationToken) {
        let fetched = fetch_cancellable(
            &self.source,
            request.coordinate(),
            Validator::default(),
            cancellation,
        )
        .await;

        let outcome = match fetched {
            Ok(Fetched::Modified { data, .. }) => {
                self.source.format().validate(&data).map(|()| data)
            }
            // Nothing was asked to be validated, so this is the server misbehaving.
            Ok(Fetched::NotModified) => Err(Error::BadResponse(reqwest::StatusCode::NOT_MODIFIED)),
            Err(error) => Err(error),
        };

        finish(request, outcome);
    }
}

impl<R: RemoteSource> TileProvider for Remote<R> {
    fn id(&self) -> &str {
        self.source.id()
    }

    fn tile_size(&self) -> u32 {
        self.source.tile_size()
    }

    fn zoom_range(&self) -> ZoomRange {
        self.source.zoom_range()
    }

    fn projection(&self) -> Projection {
        self.source.projection()
    }

    fn fill(
        &self,
        request: &DataSourceRequest,
        cancellation: &CancellationToken,
    ) -> impl Future<Output = ()> + Send {
        self.fill_impl(request, cancellation)
    }
}
