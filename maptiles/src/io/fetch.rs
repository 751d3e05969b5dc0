use std::future::Future;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::{Error, Projection, TileCoordinate, ZoomRange};

/// What a cached copy of a tile can be validated with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validator {
    pub etag: Option<String>,
    pub modified: Option<DateTime<Utc>>,
}

impl Validator {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.modified.is_none()
    }
}

/// Outcome of a successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    /// Fresh tile data.
    Modified { data: Bytes, etag: Option<String> },

    /// Copy described by the [`Validator`] is still valid.
    NotModified,
}

/// Kind of tile data a source serves. Determines how responses are validated before they are
/// cached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TileFormat {
    /// Images, which must be decodable.
    #[default]
    Raster,

    /// Opaque bytes, e.g. vector tiles, accepted as they are.
    Opaque,
}

impl TileFormat {
    pub fn validate(&self, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Err(Error::EmptyResponse);
        }

        match self {
            TileFormat::Raster => {
                image::load_from_memory(data)?;
                Ok(())
            }
            TileFormat::Opaque => Ok(()),
        }
    }
}

/// Origin of the tiles, typically a tile server. Sources do no caching on their own.
pub trait RemoteSource: Send + Sync + 'static {
    /// Unique identifier, used e.g. to key caches.
    fn id(&self) -> &str;

    /// Size of each tile in pixels.
    fn tile_size(&self) -> u32 {
        256
    }

    fn zoom_range(&self) -> ZoomRange {
        ZoomRange::default()
    }

    fn projection(&self) -> Projection {
        Projection::Mercator
    }

    fn format(&self) -> TileFormat {
        TileFormat::Raster
    }

    /// Fetch the tile. If `validator` is not empty, the source may respond with
    /// [`Fetched::NotModified`] instead of sending the data again.
    fn fetch(
        &self,
        coordinate: TileCoordinate,
        validator: Validator,
    ) -> impl Future<Output = Result<Fetched, Error>> + Send;
}
