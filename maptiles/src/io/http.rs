use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use reqwest::{
    StatusCode,
    header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH},
};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use tokio::sync::Semaphore;

pub use reqwest::header::HeaderValue;

use super::fetch::{Fetched, RemoteSource, TileFormat, Validator};
use crate::{Error, MapSourceDesc, Projection, TileCoordinate, ZoomRange};

/// Controls how [`HttpSource`] uses the HTTP protocol.
pub struct HttpOptions {
    /// User agent to be sent to the tile servers.
    ///
    /// Some providers (such as OpenStreetMap) block clients which do not identify themselves.
    /// <https://operations.osmfoundation.org/policies/tiles/>
    pub user_agent: Option<HeaderValue>,

    /// Maximum number of parallel downloads.
    ///
    /// Many services have rate limits, and exceeding them may result in throttling, bans, or
    /// degraded service. Use the default value when in doubt.
    pub max_parallel_downloads: MaxParallelDownloads,

    /// Timeout of a single request, from connecting until the body is received.
    pub timeout: Option<Duration>,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            user_agent: Some(HeaderValue::from_static(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION"),
            ))),
            max_parallel_downloads: MaxParallelDownloads::default(),
            timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Maximum number of parallel downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxParallelDownloads(pub usize);

impl Default for MaxParallelDownloads {
    /// Two connections per server, as HTTP/1.1 recommends.
    /// <https://www.rfc-editor.org/rfc/rfc2616#section-8.1.4>
    fn default() -> Self {
        Self(2)
    }
}

impl MaxParallelDownloads {
    /// Use custom value.
    ///
    /// Many services have rate limits, and exceeding them may result in throttling, bans, or
    /// degraded service. You are **strongly encouraged** to check the Terms of Use of the
    /// particular provider you are using.
    pub fn value_manually_confirmed_with_provider_limits(value: usize) -> Self {
        Self(value)
    }
}

/// Substitute tile coordinates into the URL template. Supports `{x}`, `{y}`, `{z}` and `{tmsy}`
/// (Y counted from the south), as well as the older `#X#`, `#Y#`, `#Z#` and `#TMSY#` forms.
pub fn expand_url_template(template: &str, coordinate: TileCoordinate) -> String {
    let x = coordinate.x.to_string();
    let y = coordinate.y.to_string();
    let z = coordinate.zoom.to_string();
    let tms_y = coordinate.tms_y().to_string();

    template
        .replace("{x}", &x)
        .replace("{y}", &y)
        .replace("{z}", &z)
        .replace("{tmsy}", &tms_y)
        .replace("#X#", &x)
        .replace("#Y#", &y)
        .replace("#Z#", &z)
        .replace("#TMSY#", &tms_y)
}

/// Date in the format HTTP headers use, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
fn http_date(date: DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Tile server speaking HTTP, described by a [`MapSourceDesc`].
pub struct HttpSource {
    desc: MapSourceDesc,
    client: ClientWithMiddleware,
    downloads: Arc<Semaphore>,
    format: TileFormat,
}

impl HttpSource {
    pub fn new(desc: MapSourceDesc, options: HttpOptions) -> Result<Self, Error> {
        let mut builder = reqwest::Client::builder();

        if let Some(user_agent) = options.user_agent {
            builder = builder.user_agent(user_agent);
        }

        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }

        let client = ClientBuilder::new(builder.build()?).build();

        Ok(Self {
            desc,
            client,
            downloads: Arc::new(Semaphore::new(options.max_parallel_downloads.0.max(1))),
            format: TileFormat::Raster,
        })
    }

    /// Serve tiles which are not images, e.g. vector tiles. They are not decoded before caching.
    pub fn with_format(self, format: TileFormat) -> Self {
        Self { format, ..self }
    }

    pub fn desc(&self) -> &MapSourceDesc {
        &self.desc
    }

    pub fn tile_url(&self, coordinate: TileCoordinate) -> String {
        expand_url_template(&self.desc.url_template, coordinate)
    }

    async fn fetch_impl(
        &self,
        coordinate: TileCoordinate,
        validator: Validator,
    ) -> Result<Fetched, Error> {
        let url = self.tile_url(coordinate);
        let url = reqwest::Url::parse(&url)
            .map_err(|error| Error::MalformedUrl(format!("{url}: {error}")))?;

        // Closed only when the source is dropped, which can not happen while we borrow it.
        let _permit = self
            .downloads
            .acquire()
            .await
            .map_err(|_| Error::Cancelled)?;

        let mut request = self.client.get(url.clone());
        if let Some(etag) = validator.etag {
            request = request.header(IF_NONE_MATCH, etag);
        } else if let Some(modified) = validator.modified {
            request = request.header(IF_MODIFIED_SINCE, http_date(modified));
        }

        log::trace!("Downloading {url}.");
        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            log::trace!("{url} was not modified.");
            return Ok(Fetched::NotModified);
        }

        if !status.is_success() {
            return Err(Error::BadResponse(status));
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|etag| etag.to_str().ok())
            .map(str::to_owned);

        let data = response.bytes().await?;
        if data.is_empty() {
            return Err(Error::EmptyResponse);
        }

        Ok(Fetched::Modified { data, etag })
    }
}

impl RemoteSource for HttpSource {
    fn id(&self) -> &str {
        &self.desc.id
    }

    fn tile_size(&self) -> u32 {
        self.desc.tile_size
    }

    fn zoom_range(&self) -> ZoomRange {
        self.desc.zoom_range
    }

    fn projection(&self) -> Projection {
        self.desc.projection
    }

    fn format(&self) -> TileFormat {
        self.format
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
    use hypermocker::{
        Bytes,
        hyper::{Response, header},
    };

    static TILE: TileCoordinate = TileCoordinate {
        x: 1,
        y: 2,
        zoom: 3,
        size: 256,
    };

    async fn hypermocker_mock(options: HttpOptions) -> (hypermocker::Server, HttpSource) {
        let server = hypermocker::Server::bind().await;
        let desc = MapSourceDesc::new(
            "test",
            format!("http://127.0.0.1:{}/{{z}}/{{x}}/{{y}}.png", server.port()),
        );
        (server, HttpSource::new(desc, options).unwrap())
    }

    #[test]
    fn expanding_url_templates() {
        assert_eq!(
            "https://tile.openstreetmap.org/3/1/2.png",
            expand_url_template("https://tile.openstreetmap.org/{z}/{x}/{y}.png", TILE)
        );
        assert_eq!(
            "http://tms/3/1/5.png",
            expand_url_template("http://tms/{z}/{x}/{tmsy}.png", TILE)
        );
        assert_eq!(
            "http://legacy/3/1/2/5",
            expand_url_template("http://legacy/#Z#/#X#/#Y#/#TMSY#", TILE)
        );
    }

    #[test]
    fn formatting_http_dates() {
        let date = DateTime::from_timestamp(784_111_777, 0).unwrap();
        assert_eq!("Sun, 06 Nov 1994 08:49:37 GMT", http_date(date));
    }

    #[tokio::test]
    async fn download_single_tile() {
        let _ = env_logger::try_init();

        let (server, source) = hypermocker_mock(HttpOptions::default()).await;
        let mut anticipated = server.anticipate("/3/1/2.png").await;

        let (fetched, ()) = futures::future::join(source.fetch(TILE, Validator::default()), async {
            let request = anticipated.expect().await;
            assert_eq!(
                request.headers().get(header::USER_AGENT),
                Some(&HeaderValue::from_static(concat!(
                    "maptiles",
                    "/",
                    env!("CARGO_PKG_VERSION"),
                )))
            );
            assert!(request.headers().get(header::IF_NONE_MATCH).is_none());
            assert!(request.headers().get(header::IF_MODIFIED_SINCE).is_none());

            let response = Response::builder()
                .header(header::ETAG, "\"v1\"")
                .body(Bytes::from_static(b"tile"))
                .unwrap();
            anticipated.respond_with(response).await;
        })
        .await;

        assert_eq!(
            Fetched::Modified {
                data: Bytes::from_static(b"tile"),
                etag: Some("\"v1\"".to_owned())
            },
            fetched.unwrap()
        );
    }

    #[tokio::test]
    async fn custom_user_agent_header() {
        let _ = env_logger::try_init();

        let (server, source) = hypermocker_mock(HttpOptions {
            user_agent: Some(HeaderValue::from_static("MyApp")),
            ..Default::default()
        })
        .await;
        let mut anticipated = server.anticipate("/3/1/2.png").await;

        let (_, ()) = futures::future::join(source.fetch(TILE, Validator::default()), async {
            let request = anticipated.expect().await;
            assert_eq!(
                request.headers().get(header::USER_AGENT),
                Some(&HeaderValue::from_static("MyApp"))
            );
            anticipated.respond("tile").await;
        })
        .await;
    }

    #[tokio::test]
    async fn etag_is_preferred_over_modification_time() {
        let _ = env_logger::try_init();

        let (server, source) = hypermocker_mock(HttpOptions::default()).await;
        let mut anticipated = server.anticipate("/3/1/2.png").await;

        let validator = Validator {
            etag: Some("\"v1\"".to_owned()),
            modified: Some(Utc::now()),
        };

        let (fetched, ()) = futures::future::join(source.fetch(TILE, validator), async {
            let request = anticipated.expect().await;
            assert_eq!(request.headers()[header::IF_NONE_MATCH], "\"v1\"");
            assert!(request.headers().get(header::IF_MODIFIED_SINCE).is_none());
            anticipated
                .respond_with_status(hypermocker::StatusCode::NOT_MODIFIED)
                .await;
        })
        .await;

        assert_eq!(Fetched::NotModified, fetched.unwrap());
    }

    #[tokio::test]
    async fn modification_time_is_sent_without_etag() {
        let _ = env_logger::try_init();

        let (server, source) = hypermocker_mock(HttpOptions::default()).await;
        let mut anticipated = server.anticipate("/3/1/2.png").await;

        let modified = DateTime::from_timestamp(784_111_777, 0).unwrap();
        let validator = Validator {
            etag: None,
            modified: Some(modified),
        };

        let (fetched, ()) = futures::future::join(source.fetch(TILE, validator), async {
            let request = anticipated.expect().await;
            assert_eq!(
                request.headers()[header::IF_MODIFIED_SINCE],
                "Sun, 06 Nov 1994 08:49:37 GMT"
            );
            anticipated
                .respond_with_status(hypermocker::StatusCode::NOT_MODIFIED)
                .await;
        })
        .await;

        assert_eq!(Fetched::NotModified, fetched.unwrap());
    }

    #[tokio::test]
    async fn error_status() {
        let _ = env_logger::try_init();

        let (server, source) = hypermocker_mock(HttpOptions::default()).await;
        let anticipated = server.anticipate("/3/1/2.png").await;

        let (fetched, ()) = futures::future::join(
            source.fetch(TILE, Validator::default()),
            anticipated.respond_with_status(hypermocker::StatusCode::NOT_FOUND),
        )
        .await;

        assert!(matches!(
            fetched,
            Err(Error::BadResponse(StatusCode::NOT_FOUND))
        ));
    }

    #[tokio::test]
    async fn no_body() {
        let _ = env_logger::try_init();

        let (server, source) = hypermocker_mock(HttpOptions::default()).await;
        let anticipated = server.anticipate("/3/1/2.png").await;

        let (fetched, ()) = futures::future::join(
            source.fetch(TILE, Validator::default()),
            anticipated.respond_with_status(hypermocker::StatusCode::OK),
        )
        .await;

        assert!(matches!(fetched, Err(Error::EmptyResponse)));
    }

    #[tokio::test]
    async fn invalid_url() {
        let _ = env_logger::try_init();

        let source = HttpSource::new(
            MapSourceDesc::new("garbage", "totally invalid url"),
            HttpOptions::default(),
        )
        .unwrap();

        assert!(matches!(
            source.fetch(TILE, Validator::default()).await,
            Err(Error::MalformedUrl(_))
        ));
    }

    #[tokio::test]
    async fn can_not_connect() {
        let _ = env_logger::try_init();

        // Bind and immediately drop, so nothing listens on the port.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let source = HttpSource::new(
            MapSourceDesc::new("closed", format!("http://127.0.0.1:{port}/{{z}}/{{x}}/{{y}}.png")),
            HttpOptions::default(),
        )
        .unwrap();

        assert!(matches!(
            source.fetch(TILE, Validator::default()).await,
            Err(Error::Http(_))
        ));
    }

    #[tokio::test]
    async fn by_default_there_can_be_2_parallel_downloads_at_most() {
        let _ = env_logger::try_init();
        there_can_be_x_parallel_downloads_at_most(2, HttpOptions::default()).await;
    }

    #[tokio::test]
    async fn there_can_be_5_parallel_downloads_at_most() {
        let _ = env_logger::try_init();
        there_can_be_x_parallel_downloads_at_most(
            5,
            HttpOptions {
                max_parallel_downloads:
                    MaxParallelDownloads::value_manually_confirmed_with_provider_limits(5),
                ..Default::default()
            },
        )
        .await;
    }

    async fn there_can_be_x_parallel_downloads_at_most(x: u32, http_options: HttpOptions) {
        let (server, source) = hypermocker_mock(http_options).await;
        let source = Arc::new(source);

        let mut active = Vec::new();
        for i in 0..x {
            let tile = TileCoordinate::new(i, 1, 10, 256);
            let mut anticipated = server.anticipate(format!("/10/{i}/1.png")).await;

            let source = Arc::clone(&source);
            tokio::spawn(async move { source.fetch(tile, Validator::default()).await });

            anticipated.expect().await;
            active.push(anticipated);
        }

        // Over the limit, so it is not sent yet.
        let mut awaiting = server.anticipate("/10/99/99.png").await;
        let over_limit = {
            let source = Arc::clone(&source);
            tokio::spawn(async move {
                source
                    .fetch(TileCoordinate::new(99, 99, 10, 256), Validator::default())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(x as usize, server.received());

        // It goes as soon as one of the previous ones is responded to.
        active.remove(0).respond("tile").await;
        awaiting.expect().await;
        awaiting.respond("tile").await;
        assert!(over_limit.await.unwrap().is_ok());

        for anticipated in active {
            anticipated.respond("tile").await;
        }
    }
}
