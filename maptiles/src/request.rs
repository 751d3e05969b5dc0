//! A single logical tile fetch, shared between any number of observers.

use std::{
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::{
    Stream, StreamExt,
    channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
};

use crate::{Error, TileCoordinate};

/// Transition of a [`DataSourceRequest`], as seen by its observers.
#[derive(Debug, Clone)]
pub enum RequestEvent {
    /// New data replacing the previous one. `complete` means that no more events will follow.
    Data { data: Bytes, complete: bool },

    /// Request failed. No more events will follow.
    Error(Arc<Error>),
}

impl RequestEvent {
    pub fn is_terminal(&self) -> bool {
        match self {
            RequestEvent::Data { complete, .. } => *complete,
            RequestEvent::Error(_) => true,
        }
    }
}

struct Observer {
    id: u64,
    tx: UnboundedSender<RequestEvent>,
}

#[derive(Default)]
struct State {
    data: Option<Bytes>,
    error: Option<Arc<Error>>,
    completed: bool,
    observers: Vec<Observer>,
    next_observer_id: u64,
}

impl State {
    /// Deliver the event to everyone attached. Channels are closed after a terminal event.
    fn broadcast(&mut self, event: RequestEvent) {
        let terminal = event.is_terminal();

        // Receivers might be gone already, which is fine, they just stop listening.
        self.observers
            .retain(|observer| observer.tx.unbounded_send(event.clone()).is_ok());

        if terminal {
            self.observers.clear();
        }
    }

    /// Event describing the current state to someone who has just attached.
    fn snapshot(&self) -> Option<RequestEvent> {
        if let Some(error) = &self.error {
            Some(RequestEvent::Error(Arc::clone(error)))
        } else {
            self.data.as_ref().map(|data| RequestEvent::Data {
                data: data.clone(),
                complete: self.completed,
            })
        }
    }
}

/// Fetch of a single tile, which gets filled with data by a tile provider. Cheap to clone, all
/// clones refer to the same request.
///
/// Data is replaced, not appended, by every [`DataSourceRequest::emit_data`]. Once completed,
/// either with final data or an error, the request does not change anymore.
#[derive(Clone)]
pub struct DataSourceRequest {
    coordinate: TileCoordinate,
    revalidate: bool,
    state: Arc<Mutex<State>>,
}

impl DataSourceRequest {
    pub fn new(coordinate: TileCoordinate) -> Self {
        Self {
            coordinate,
            revalidate: false,
            state: Arc::default(),
        }
    }

    /// Request, which asks the providers not to trust their caches without checking with the
    /// origin first.
    pub fn with_revalidation(coordinate: TileCoordinate) -> Self {
        Self {
            revalidate: true,
            ..Self::new(coordinate)
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // State is never left half-updated, so it is fine to use it after a panic elsewhere.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn coordinate(&self) -> TileCoordinate {
        self.coordinate
    }

    pub fn x(&self) -> u32 {
        self.coordinate.x
    }

    pub fn y(&self) -> u32 {
        self.coordinate.y
    }

    pub fn zoom(&self) -> u8 {
        self.coordinate.zoom
    }

    pub fn revalidate(&self) -> bool {
        self.revalidate
    }

    /// Replace the data of this request. Non-final data identical to what the request already
    /// holds is not announced again.
    pub fn emit_data(&self, data: Bytes, complete: bool) -> Result<(), Error> {
        let mut state = self.state();

        if state.completed {
            return Err(Error::AlreadyCompleted);
        }

        if !complete && state.data.as_ref() == Some(&data) {
            log::trace!("{}: same data emitted again, ignoring.", self.coordinate);
            return Ok(());
        }

        state.data = Some(data.clone());
        state.completed = complete;
        state.broadcast(RequestEvent::Data { data, complete });
        Ok(())
    }

    /// Fail the request. Data emitted so far is discarded.
    pub fn emit_error(&self, error: Error) -> Result<(), Error> {
        let mut state = self.state();

        if state.completed {
            return Err(Error::AlreadyCompleted);
        }

        log::debug!("{}: {error}", self.coordinate);
        let error = Arc::new(error);
        state.data = None;
        state.error = Some(Arc::clone(&error));
        state.completed = true;
        state.broadcast(RequestEvent::Error(error));
        Ok(())
    }

    /// Declare the data emitted so far as final.
    pub fn complete(&self) -> Result<(), Error> {
        let mut state = self.state();

        if state.completed {
            return Err(Error::AlreadyCompleted);
        }

        let data = state.data.clone().ok_or(Error::NothingToComplete)?;
        state.completed = true;
        state.broadcast(RequestEvent::Data {
            data,
            complete: true,
        });
        Ok(())
    }

    pub fn is_completed(&self) -> bool {
        self.state().completed
    }

    /// Most recent data. Absent if nothing was emitted yet, or if the request failed.
    pub fn data(&self) -> Option<Bytes> {
        self.state().data.clone()
    }

    pub fn error(&self) -> Option<Arc<Error>> {
        self.state().error.clone()
    }

    /// Number of observers still waiting for events.
    pub fn observer_count(&self) -> usize {
        self.state().observers.len()
    }

    /// Start observing this request. The observer gets the current data (if any) right away, and
    /// every following event in the order they are emitted.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = unbounded();
        let mut state = self.state();

        if let Some(event) = state.snapshot() {
            // Cannot fail, receiver is right here.
            let _ = tx.unbounded_send(event);
        }

        let id = state.next_observer_id;
        state.next_observer_id += 1;

        if !state.completed {
            state.observers.push(Observer { id, tx });
        }

        Subscription {
            id,
            rx,
            state: Arc::clone(&self.state),
            detached: false,
        }
    }
}

impl std::fmt::Debug for DataSourceRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("DataSourceRequest")
            .field("coordinate", &self.coordinate)
            .field("completed", &state.completed)
            .field("data_len", &state.data.as_ref().map(Bytes::len))
            .field("error", &state.error)
            .field("observers", &state.observers.len())
            .finish()
    }
}

/// Observer of a [`DataSourceRequest`]. Dropping it detaches silently.
pub struct Subscription {
    id: u64,
    rx: UnboundedReceiver<RequestEvent>,
    state: Arc<Mutex<State>>,
    detached: bool,
}

impl Subscription {
    /// Wait for the final outcome of the request, skipping intermediate data.
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

        // Request was abandoned without reaching a terminal state.
        Err(Arc::new(Error::Cancelled))
    }

    /// Stop observing. No more events will be received.
    pub fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        self.rx.close();

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.observers.retain(|observer| observer.id != self.id);
    }
}

impl Stream for Subscription {
    type Item = RequestEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.detached {
            return Poll::Ready(None);
        }
        self.rx.poll_next_unpin(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}
