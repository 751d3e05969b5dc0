#![doc = include_str!("../README.md")]
#![deny(clippy::unwrap_used, rustdoc::broken_intra_doc_links)]

pub mod cache;
mod cached;
mod error;
pub mod io;
mod memory;
mod pipeline;
mod position;
pub mod projection;
mod request;
pub mod sources;
mod tile;
mod zoom;

pub use cache::{CachedTile, FileCache, FileCacheOptions};
pub use cached::{CachePolicy, CachedSource, Fallback};
pub use error::Error;
pub use io::{HeaderValue, HttpOptions, HttpSource, MaxParallelDownloads};
pub use memory::{DEFAULT_MEMORY_CAPACITY, MemoryCache};
pub use pipeline::{FetchState, Pipeline, PipelineOptions, RequestOptions, Stats, TileSubscription};
pub use position::{
    MAX_LATITUDE, MAX_LONGITUDE, MIN_LATITUDE, MIN_LONGITUDE, Pixels, Position, clamp_latitude,
    lat_lon, lon_lat, normalized, wrap_longitude,
};
pub use projection::{Projection, Projector};
pub use request::{DataSourceRequest, RequestEvent, Subscription};
pub use sources::{MapSourceDesc, MapSourceRegistry, Remote, TestPattern, TileProvider};
pub use tile::TileCoordinate;
pub use zoom::{InvalidZoom, MAX_SUPPORTED_ZOOM, ZoomRange};
