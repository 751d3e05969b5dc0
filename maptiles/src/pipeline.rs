//! Entry point for getting tiles. Deduplicates simultaneous requests for the same tile, keeps
//! recently used tiles in memory and runs the provider on a dedicated IO thread.

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    pin::Pin,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::{
    DataSourceRequest, Error, RequestEvent, Subscription, TileCoordinate,
    io::runtime::Runtime,
    memory::{DEFAULT_MEMORY_CAPACITY, MemoryCache},
    sources::TileProvider,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    /// How many tiles are kept in memory.
    pub memory_capacity: NonZeroUsize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Skip the memory cache and ask the provider to check its cached copy with the origin.
    pub revalidate: bool,
}

/// Where the fetch of a particular tile is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    /// Nobody asked for this tile, or it is not kept in memory anymore.
    Idle,

    /// Fetch is running and no data was delivered yet.
    Fetching,

    /// Cached copy was delivered, but the fetch still runs to check it with the origin.
    CacheHitDelivered,

    /// Final data was delivered.
    Delivered,

    Failed,
}

impl FetchState {
    fn of(request: &DataSourceRequest) -> Self {
        match (request.is_completed(), request.data().is_some()) {
            (false, false) => FetchState::Fetching,
            (false, true) => FetchState::CacheHitDelivered,
            (true, true) => FetchState::Delivered,
            (true, false) => FetchState::Failed,
        }
    }
}

/// Counters describing what the [`Pipeline`] did so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Fetches running right now.
    pub in_flight: usize,

    /// Fetches handed to the provider.
    pub fetches_started: u64,

    /// Requests attached to a fetch which was already running.
    pub attached: u64,

    /// Requests answered from memory.
    pub memory_hits: u64,
}

struct InFlight {
    id: u64,
    request: DataSourceRequest,
    cancellation: CancellationToken,
    observers: usize,
}

/// Fetches in progress, keyed by coordinate.
#[derive(Default)]
struct Registry {
    entries: Mutex<HashMap<TileCoordinate, InFlight>>,
    next_id: AtomicU64,
    fetches_started: AtomicU64,
    attached: AtomicU64,
    memory_hits: AtomicU64,
}

impl Registry {
    fn entries(&self) -> MutexGuard<'_, HashMap<TileCoordinate, InFlight>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget the fetch, but only if it is still the one identified by `id`. Coordinate might be
    /// already fetched again by then.
    fn remove(&self, coordinate: &TileCoordinate, id: u64) -> Option<InFlight> {
        let mut entries = self.entries();
        if entries.get(coordinate).is_some_and(|in_flight| in_flight.id == id) {
            entries.remove(coordinate)
        } else {
            None
        }
    }

    fn detach(&self, coordinate: &TileCoordinate, id: u64) {
        let mut entries = self.entries();
        let Some(in_flight) = entries.get_mut(coordinate) else {
            return;
        };

        if in_flight.id != id {
            return;
        }

        in_flight.observers = in_flight.observers.saturating_sub(1);
        if in_flight.observers == 0 {
            log::debug!("Nobody waits for {coordinate} anymore, cancelling.");
            in_flight.cancellation.cancel();
            entries.remove(coordinate);
        }
    }
}

struct Shared<P> {
    provider: P,
    registry: Arc<Registry>,
    memory: Mutex<MemoryCache>,
}

impl<P: TileProvider> Shared<P> {
    fn memory(&self) -> MutexGuard<'_, MemoryCache> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn fetch(&self, request: DataSourceRequest, cancellation: CancellationToken, id: u64) {
        let coordinate = request.coordinate();
        log::trace!("Fetching {coordinate}.");

        self.provider.fill(&request, &cancellation).await;

        if !request.is_completed() {
            log::warn!("Provider left {coordinate} incomplete.");
            let _ = request.emit_error(Error::Incomplete);
        }

        // Memory first, requests look there while holding the registry.
        if let (Some(data), None) = (request.data(), request.error()) {
            self.memory().put(self.provider.id(), coordinate, data);
        }

        self.registry.remove(&coordinate, id);
    }
}

/// Gets tiles from a [`TileProvider`].
///
/// ```no_run
/// use maptiles::{Pipeline, Remote, TestPattern, TileCoordinate};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let pipeline = Pipeline::new(Remote::new(TestPattern::new()))?;
/// let tile = pipeline.request(TileCoordinate::new(0, 0, 0, 256)).finished().await?;
/// # Ok(())
/// # }
/// ```
pub struct Pipeline<P: TileProvider> {
    shared: Arc<Shared<P>>,
    runtime: Runtime,
}

impl<P: TileProvider> Pipeline<P> {
    pub fn new(provider: P) -> Result<Self, Error> {
        Self::with_options(provider, PipelineOptions::default())
    }

    pub fn with_options(provider: P, options: PipelineOptions) -> Result<Self, Error> {
        Ok(Self {
            shared: Arc::new(Shared {
                provider,
                registry: Arc::default(),
                memory: Mutex::new(MemoryCache::new(options.memory_capacity)),
            }),
            runtime: Runtime::new()?,
        })
    }

    pub fn provider(&self) -> &P {
        &self.shared.provider
    }

    /// Get the tile. Whoever asks for the same tile while it is being fetched, shares the fetch.
    pub fn request(&self, coordinate: TileCoordinate) -> TileSubscription {
        self.request_with(coordinate, RequestOptions::default())
    }

    pub fn request_with(
        &self,
        coordinate: TileCoordinate,
        options: RequestOptions,
    ) -> TileSubscription {
        let shared = &self.shared;
        let registry = &shared.registry;

        if !shared.provider.accepts(&coordinate) {
            log::debug!("{coordinate} is not served by '{}'.", shared.provider.id());
            return TileSubscription::settled(coordinate, Err(Error::InvalidTile));
        }

        // Fetches put the tile in memory before leaving the registry, so with the registry
        // locked the tile is always in at least one of them.
        let mut entries = registry.entries();

        if !options.revalidate {
            if let Some(data) = shared.memory().get(shared.provider.id(), &coordinate) {
                log::trace!("{coordinate} found in memory.");
                registry.memory_hits.fetch_add(1, Ordering::Relaxed);
                return TileSubscription::settled(coordinate, Ok(data));
            }
        }

        if let Some(in_flight) = entries.get_mut(&coordinate) {
            log::trace!("{coordinate} is already being fetched.");
            in_flight.observers += 1;
            registry.attached.fetch_add(1, Ordering::Relaxed);
            return TileSubscription {
                coordinate,
                subscription: in_flight.request.subscribe(),
                link: Some((Arc::clone(registry), in_flight.id)),
            };
        }

        let request = if options.revalidate {
            DataSourceRequest::with_revalidation(coordinate)
        } else {
            DataSourceRequest::new(coordinate)
        };
        let cancellation = CancellationToken::new();
        let id = registry.next_id.fetch_add(1, Ordering::Relaxed);
        let subscription = request.subscribe();

        entries.insert(
            coordinate,
            InFlight {
                id,
                request: request.clone(),
                cancellation: cancellation.clone(),
                observers: 1,
            },
        );
        drop(entries);

        registry.fetches_started.fetch_add(1, Ordering::Relaxed);
        let task_shared = Arc::clone(shared);
        self.runtime
            .spawn(async move { task_shared.fetch(request, cancellation, id).await });

        TileSubscription {
            coordinate,
            subscription,
            link: Some((Arc::clone(registry), id)),
        }
    }

    pub fn fetch_state(&self, coordinate: &TileCoordinate) -> FetchState {
        if let Some(in_flight) = self.shared.registry.entries().get(coordinate) {
            return FetchState::of(&in_flight.request);
        }

        if self
            .shared
            .memory()
            .get(self.shared.provider.id(), coordinate)
            .is_some()
        {
            FetchState::Delivered
        } else {
            FetchState::Idle
        }
    }

    pub fn stats(&self) -> Stats {
        let registry = &self.shared.registry;
        Stats {
            in_flight: registry.entries().len(),
            fetches_started: registry.fetches_started.load(Ordering::Relaxed),
            attached: registry.attached.load(Ordering::Relaxed),
            memory_hits: registry.memory_hits.load(Ordering::Relaxed),
        }
    }

    /// Forget tiles kept in memory.
    pub fn clear_memory(&self) {
        self.shared.memory().clear();
    }
}

impl<P: TileProvider> Drop for Pipeline<P> {
    fn drop(&mut self) {
        let in_flight: Vec<_> = self.shared.registry.entries().drain().collect();

        for (coordinate, in_flight) in in_flight {
            log::debug!("Pipeline is going away, cancelling {coordinate}.");
            in_flight.cancellation.cancel();
            let _ = in_flight.request.emit_error(Error::Cancelled);
        }
    }
}

/// Observer of a single tile fetch, returned by [`Pipeline::request`]. Yields [`RequestEvent`]s,
/// the last one being either final data or an error. Dropping it stops observing, and cancels
/// the fetch if nobody else is interested.
pub struct TileSubscription {
    coordinate: TileCoordinate,
    subscription: Subscription,
    link: Option<(Arc<Registry>, u64)>,
}

impl TileSubscription {
    /// Subscription to something known upfront.
    fn settled(coordinate: TileCoordinate, outcome: Result<Bytes, Error>) -> Self {
        let request = DataSourceRequest::new(coordinate);
        let _ = match outcome {
            Ok(data) => request.emit_data(data, true),
            Err(error) => request.emit_error(error),
        };

        Self {
            coordinate,
            subscription: request.subscribe(),
            link: None,
        }
    }

    pub fn coordinate(&self) -> TileCoordinate {
        self.coordinate
    }

    /// Wait for the final outcome, skipping intermediate data.
    pub async fn finished(mut self) -> Result<Bytes, Arc<Error>> {
        while let Some(event) = self.next().await {
            match event {
                RequestEvent::Data {
                    data,
                    complete: true,
                } => return Ok(data),
                RequestEvent::Data { .. } => {}
                RequestEvent::Error(error) => return Err(error),
            }
        }

        Err(Arc::new(Error::Cancelled))
    }
}

impl Stream for TileSubscription {
    type Item = RequestEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.subscription.poll_next_unpin(cx)
    }
}

impl Drop for TileSubscription {
    fn drop(&mut self) {
        self.subscription.detach();

        if let Some((registry, id)) = self.link.take() {
            registry.detach(&self.coordinate, id);
        }
    }
}
