mod fetch;
pub mod http;
pub(crate) mod runtime;

pub use fetch::{Fetched, RemoteSource, TileFormat, Validator};
pub use http::{HeaderValue, HttpOptions, HttpSource, MaxParallelDownloads};
