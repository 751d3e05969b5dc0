//! Persistent cache in front of a remote source.

use std::{
    future::Future,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::{
    DataSourceRequest, Error, FileCache, Projection, ZoomRange,
    cache::CachedTile,
    io::{Fetched, RemoteSource, Validator},
    sources::{TileProvider, fetch_cancellable, finish},
};

/// What to do when the remote source fails, but there is an outdated copy in the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Fallback {
    /// Complete the request with the outdated copy.
    #[default]
    ServeStale,

    /// Fail the request, even though it already received the outdated copy as intermediate data.
    PropagateError,
}

/// When cached tiles are trusted without asking the remote source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CachePolicy {
    /// Tiles older than this are validated with the remote source before use. `None` means
    /// cached tiles never expire.
    pub max_age: Option<Duration>,

    pub fallback: Fallback,
}

impl CachePolicy {
    /// Validate tiles older than a week.
    pub fn validating() -> Self {
        Self {
            max_age: Some(Duration::from_secs(7 * 24 * 60 * 60)),
            fallback: Fallback::ServeStale,
        }
    }

    fn is_fresh(&self, tile: &CachedTile) -> bool {
        self.max_age.is_none_or(|max_age| !tile.is_expired(max_age))
    }
}

/// [`TileProvider`] keeping downloaded tiles in a [`FileCache`].
///
/// Cached copy, if there is one, is delivered to the request right away. If it is too old, or
/// the request asks for revalidation, the remote source is asked afterwards, sending the cached
/// entity tag along, so it does not need to send the tile again if it did not change.
///
/// While [offline](Self::set_offline), the remote source is never asked. Whatever is in the
/// cache is used as is, no matter how old, and tiles which are not there fail with
/// [`Error::Offline`].
pub struct CachedSource<R> {
    remote: R,
    cache: FileCache,
    policy: CachePolicy,
    offline: AtomicBool,
}

impl<R: RemoteSource> CachedSource<R> {
    pub fn new(remote: R, cache: FileCache) -> Self {
        Self {
            remote,
            cache,
            policy: CachePolicy::default(),
            offline: AtomicBool::new(false),
        }
    }

    pub fn with_policy(self, policy: CachePolicy) -> Self {
        Self { policy, ..self }
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    /// Stop or resume asking the remote source. Takes effect for requests filled from now on.
    pub fn set_offline(&self, offline: bool) {
        if self.offline.swap(offline, Ordering::Relaxed) != offline {
            log::debug!(
                "{} is now {}.",
                self.remote.id(),
                if offline { "offline" } else { "online" }
            );
        }
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Relaxed)
    }

    async fn cached(&self, request: &DataSourceRequest) -> Option<CachedTile> {
        match self.cache.get(&request.coordinate()).await {
            Ok(cached) => cached,
            Err(error) => {
                log::warn!("Cache lookup failed: {error}");
                None
            }
        }
    }

    async fn fill_impl(&self, request: &DataSourceRequest, cancellation: &CancellationToken) {
        let coordinate = request.coordinate();
        let cached = self.cached(request).await;
        let offline = self.is_offline();

        if let Some(tile) = &cached {
            if let Err(error) = request.emit_data(tile.data.clone(), false) {
                log::warn!("Could not deliver cached {coordinate}: {error}");
                return;
            }

            if offline || (self.policy.is_fresh(tile) && !request.revalidate()) {
                log::trace!("{coordinate} served from the cache.");
                if let Err(error) = request.complete() {
                    log::warn!("Could not complete {coordinate}: {error}");
                }
                return;
            }
        }

        if cancellation.is_cancelled() {
            finish(request, Err(Error::Cancelled));
            return;
        }

        if offline {
            log::trace!("{coordinate} is not cached.");
            finish(request, Err(Error::Offline));
            return;
        }

        let validator = cached
            .as_ref()
            .map(|tile| Validator {
                etag: tile.etag.clone(),
                modified: Some(tile.modified),
            })
            .unwrap_or_default();

        let outcome = match fetch_cancellable(&self.remote, coordinate, validator, cancellation)
            .await
        {
            Ok(fetched) => self.accept(request, fetched, cached.as_ref()).await,
            Err(error) => Err(error),
        };

        let outcome = match (outcome, cached) {
            (Err(Error::Cancelled), _) => Err(Error::Cancelled),
            (Err(error), Some(tile)) if self.policy.fallback == Fallback::ServeStale => {
                log::warn!("{coordinate}: {error}, serving the cached copy.");
                Ok(tile.data)
            }
            (outcome, _) => outcome,
        };

        finish(request, outcome);
    }

    /// Turn what the remote source sent into the final tile data, updating the cache.
    async fn accept(
        &self,
        request: &DataSourceRequest,
        fetched: Fetched,
        cached: Option<&CachedTile>,
    ) -> Result<Bytes, Error> {
        let coordinate = request.coordinate();

        match (fetched, cached) {
            (Fetched::NotModified, Some(tile)) => {
                log::trace!("{coordinate} is still valid.");
                if let Err(error) = self.cache.mark_up_to_date(&coordinate).await {
                    log::warn!("Could not refresh cached {coordinate}: {error}");
                }
                Ok(tile.data.clone())
            }
            (Fetched::NotModified, None) => {
                Err(Error::BadResponse(reqwest::StatusCode::NOT_MODIFIED))
            }
            (Fetched::Modified { data, etag }, _) => {
                self.remote.format().validate(&data)?;
                if let Err(error) = self.cache.store(&coordinate, &data, etag.as_deref()).await {
                    log::warn!("Could not cache {coordinate}: {error}");
                }
                Ok(data)
            }
        }
    }
}

impl<R: RemoteSource> TileProvider for CachedSource<R> {
    fn id(&self) -> &str {
        self.remote.id()
    }

    fn tile_size(&self) -> u32 {
        self.remote.tile_size()
    }

    fn zoom_range(&self) -> ZoomRange {
        self.remote.zoom_range()
    }

    fn projection(&self) -> Projection {
        self.remote.projection()
    }

    fn fill(
        &self,
        request: &DataSourceRequest,
        cancellation: &CancellationToken,
    ) -> impl Future<Output = ()> + Send {
        self.fill_impl(request, cancellation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        FileCacheOptions, HttpOptions, HttpSource, MapSourceDesc, RequestEvent, TestPattern,
        TileCoordinate,
    };
    use futures::StreamExt;
    use hypermocker::hyper::{Response, header};

    static TILE: TileCoordinate = TileCoordinate {
        x: 1,
        y: 2,
        zoom: 3,
        size: 256,
    };

    fn file_cache(directory: &tempfile::TempDir) -> FileCache {
        FileCache::new(FileCacheOptions {
            directory: directory.path().to_owned(),
            namespace: "test".to_owned(),
            ..Default::default()
        })
    }

    fn always_stale() -> CachePolicy {
        CachePolicy {
            max_age: Some(Duration::ZERO),
            ..Default::default()
        }
    }

    async fn fill<P: TileProvider>(provider: &P, request: &DataSourceRequest) {
        provider.fill(request, &CancellationToken::new()).await;
    }

    #[tokio::test]
    async fn downloaded_tiles_are_cached() {
        let _ = env_logger::try_init();
        let directory = tempfile::tempdir().unwrap();
        let remote = TestPattern::new();
        let provider = CachedSource::new(remote.clone(), file_cache(&directory));

        let request = DataSourceRequest::new(TILE);
        fill(&provider, &request).await;
        let downloaded = request.data().unwrap();
        assert_eq!(1, remote.fetches());

        let cached = provider.cache().get(&TILE).await.unwrap().unwrap();
        assert_eq!(downloaded, cached.data);
        assert_eq!(Some(TestPattern::etag(&TILE)), cached.etag);

        // Fresh enough, remote is not asked again.
        let request = DataSourceRequest::new(TILE);
        fill(&provider, &request).await;
        assert!(request.is_completed());
        assert_eq!(Some(downloaded), request.data());
        assert_eq!(1, remote.fetches());
    }

    #[tokio::test]
    async fn outdated_tiles_are_revalidated() {
        let _ = env_logger::try_init();
        let directory = tempfile::tempdir().unwrap();
        let remote = TestPattern::new();
        let provider =
            CachedSource::new(remote.clone(), file_cache(&directory)).with_policy(always_stale());

        let request = DataSourceRequest::new(TILE);
        fill(&provider, &request).await;
        let before = provider.cache().get(&TILE).await.unwrap().unwrap();

        let request = DataSourceRequest::new(TILE);
        let mut subscription = request.subscribe();
        fill(&provider, &request).await;

        // Cached copy first, then the same bytes confirmed by the remote.
        let Some(RequestEvent::Data { data, complete }) = subscription.next().await else {
            panic!("expected cached data");
        };
        assert!(!complete);
        assert_eq!(before.data, data);

        let Some(RequestEvent::Data { data, complete }) = subscription.next().await else {
            panic!("expected final data");
        };
        assert!(complete);
        assert_eq!(before.data, data);

        assert_eq!(2, remote.fetches());
        let after = provider.cache().get(&TILE).await.unwrap().unwrap();
        assert!(after.modified >= before.modified);
    }

    #[tokio::test]
    async fn revalidation_can_be_requested() {
        let directory = tempfile::tempdir().unwrap();
        let remote = TestPattern::new();
        let provider = CachedSource::new(remote.clone(), file_cache(&directory));

        fill(&provider, &DataSourceRequest::new(TILE)).await;
        fill(&provider, &DataSourceRequest::with_revalidation(TILE)).await;

        assert_eq!(2, remote.fetches());
    }

    #[tokio::test]
    async fn stale_copy_is_served_when_remote_fails() {
        let _ = env_logger::try_init();
        let directory = tempfile::tempdir().unwrap();
        let remote = TestPattern::new();
        let provider =
            CachedSource::new(remote.clone(), file_cache(&directory)).with_policy(always_stale());

        let request = DataSourceRequest::new(TILE);
        fill(&provider, &request).await;
        let cached = request.data().unwrap();

        remote.set_failing(true);
        let request = DataSourceRequest::new(TILE);
        fill(&provider, &request).await;

        assert!(request.is_completed());
        assert!(request.error().is_none());
        assert_eq!(Some(cached), request.data());
    }

    #[tokio::test]
    async fn remote_failure_can_be_propagated() {
        let directory = tempfile::tempdir().unwrap();
        let remote = TestPattern::new();
        let provider = CachedSource::new(remote.clone(), file_cache(&directory)).with_policy(
            CachePolicy {
                fallback: Fallback::PropagateError,
                ..always_stale()
            },
        );

        fill(&provider, &DataSourceRequest::new(TILE)).await;

        remote.set_failing(true);
        let request = DataSourceRequest::new(TILE);
        fill(&provider, &request).await;

        assert!(request.data().is_none());
        assert!(matches!(
            *request.error().unwrap(),
            Error::BadResponse(reqwest::StatusCode::SERVICE_UNAVAILABLE)
        ));
    }

    #[tokio::test]
    async fn remote_failure_without_cached_copy() {
        let directory = tempfile::tempdir().unwrap();
        let remote = TestPattern::new();
        remote.set_failing(true);
        let provider = CachedSource::new(remote, file_cache(&directory));

        let request = DataSourceRequest::new(TILE);
        fill(&provider, &request).await;

        assert!(request.error().is_some());
        assert!(provider.cache().is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn garbage_is_not_cached() {
        let _ = env_logger::try_init();
        let directory = tempfile::tempdir().unwrap();
        let server = hypermocker::Server::bind().await;
        let desc = MapSourceDesc::new(
            "test",
            format!("http://127.0.0.1:{}/{{z}}/{{x}}/{{y}}.png", server.port()),
        );
        let provider = CachedSource::new(
            HttpSource::new(desc, HttpOptions::default()).unwrap(),
            file_cache(&directory),
        );

        let request = DataSourceRequest::new(TILE);
        let anticipated = server.anticipate("/3/1/2.png").await;
        futures::future::join(fill(&provider, &request), anticipated.respond("garbage")).await;

        assert!(matches!(*request.error().unwrap(), Error::Decode(_)));
        assert!(provider.cache().is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn cached_etag_is_sent_to_the_server() {
        let _ = env_logger::try_init();
        let directory = tempfile::tempdir().unwrap();
        let server = hypermocker::Server::bind().await;
        let desc = MapSourceDesc::new(
            "test",
            format!("http://127.0.0.1:{}/{{z}}/{{x}}/{{y}}.png", server.port()),
        );
        let provider = CachedSource::new(
            HttpSource::new(desc, HttpOptions::default()).unwrap(),
            file_cache(&directory),
        )
        .with_policy(always_stale());

        let tile = TestPattern::new().render(&TILE).unwrap();
        provider
            .cache()
            .store(&TILE, &tile, Some("\"v1\""))
            .await
            .unwrap();

        let request = DataSourceRequest::new(TILE);
        let mut anticipated = server.anticipate("/3/1/2.png").await;
        futures::future::join(fill(&provider, &request), async {
            let http_request = anticipated.expect().await;
            assert_eq!("\"v1\"", http_request.headers()[header::IF_NONE_MATCH]);
            anticipated
                .respond_with(
                    Response::builder()
                        .status(hypermocker::StatusCode::NOT_MODIFIED)
                        .body(hypermocker::Bytes::new())
                        .unwrap(),
                )
                .await;
        })
        .await;

        assert!(request.is_completed());
        assert_eq!(Some(tile), request.data());
    }

    #[tokio::test]
    async fn cancelled_before_fetching() {
        let directory = tempfile::tempdir().unwrap();
        let remote = TestPattern::new();
        let provider = CachedSource::new(remote.clone(), file_cache(&directory));
        let request = DataSourceRequest::new(TILE);
        let cancellation = CancellationToken::new();
        cancellation.cancel();

        provider.fill(&request, &cancellation).await;

        assert!(matches!(*request.error().unwrap(), Error::Cancelled));
        assert_eq!(0, remote.fetches());
    }

    #[tokio::test]
    async fn offline_source_uses_outdated_copies() {
        let _ = env_logger::try_init();
        let directory = tempfile::tempdir().unwrap();
        let remote = TestPattern::new();
        let provider =
            CachedSource::new(remote.clone(), file_cache(&directory)).with_policy(always_stale());

        fill(&provider, &DataSourceRequest::new(TILE)).await;
        let cached = provider.cache().get(&TILE).await.unwrap().unwrap();

        provider.set_offline(true);
        assert!(provider.is_offline());

        let request = DataSourceRequest::with_revalidation(TILE);
        fill(&provider, &request).await;

        assert!(request.is_completed());
        assert_eq!(Some(cached.data), request.data());
        assert_eq!(1, remote.fetches());
    }

    #[tokio::test]
    async fn offline_source_without_cached_copy() {
        let directory = tempfile::tempdir().unwrap();
        let remote = TestPattern::new();
        let provider = CachedSource::new(remote.clone(), file_cache(&directory));
        provider.set_offline(true);

        let request = DataSourceRequest::new(TILE);
        fill(&provider, &request).await;

        assert!(request.data().is_none());
        assert!(matches!(*request.error().unwrap(), Error::Offline));
        assert_eq!(0, remote.fetches());

        // Back online, the remote is asked again.
        provider.set_offline(false);
        let request = DataSourceRequest::new(TILE);
        fill(&provider, &request).await;

        assert!(request.error().is_none());
        assert_eq!(1, remote.fetches());
        assert_eq!(1, provider.cache().len().await.unwrap());
    }
}
