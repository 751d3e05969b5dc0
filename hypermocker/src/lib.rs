//! Tiny HTTP server for tests. Requests have to be anticipated before they arrive, then the test
//! can inspect them and decide how (and when) to respond.

use http_body_util::Full;
use hyper::{Request, Response, server::conn::http1, service::Service};
use hyper_util::rt::TokioIo;
use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Mutex},
};
use tokio::{net::TcpListener, sync::oneshot};

pub use hyper::{self, StatusCode, body::Bytes};

/// Request handed over to the test, together with a way to respond to it.
type Incoming = (Request<()>, oneshot::Sender<Response<Bytes>>);

#[derive(Default)]
struct State {
    /// Requests anticipated with [`Server::anticipate`], made before the actual HTTP request.
    anticipated: HashMap<String, VecDeque<oneshot::Sender<Incoming>>>,

    /// Paths of the requests nobody anticipated.
    unexpected: Vec<String>,

    /// Number of requests which reached the server.
    received: usize,
}

pub struct Server {
    port: u16,
    state: Arc<Mutex<State>>,
}

impl Server {
    /// Create new [`Server`], and bind it to a random port.
    pub async fn bind() -> Server {
        let state = Arc::new(Mutex::new(State::default()));

        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr)
            .await
            .expect("could not bind the mock server");
        let port = listener
            .local_addr()
            .expect("mock server has no address")
            .port();

        let state_clone = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let stream = match listener.accept().await {
                    Ok((stream, _)) => stream,
                    Err(error) => {
                        log::error!("Mock server could not accept a connection: {error}.");
                        break;
                    }
                };
                let io = TokioIo::new(stream);

                let state = Arc::clone(&state_clone);
                tokio::task::spawn(async move {
                    if let Err(error) = http1::Builder::new()
                        .serve_connection(io, MockService { state })
                        .await
                    {
                        log::debug!("Connection closed: {error}.");
                    }
                });
            }
        });

        Server { port, state }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Prepare for a request with given path. Each call handles exactly one request, so anticipate
    /// the same path multiple times if it is going to be requested more than once.
    pub async fn anticipate(&self, path: impl Into<String>) -> AnticipatedRequest {
        let path = path.into();
        log::info!("Anticipating '{path}'.");

        let (tx, rx) = oneshot::channel();
        self.state
            .lock()
            .expect("mock state poisoned")
            .anticipated
            .entry(path.clone())
            .or_default()
            .push_back(tx);

        AnticipatedRequest {
            path,
            incoming: Some(rx),
            responder: None,
        }
    }

    /// Number of requests received so far, anticipated or not.
    pub fn received(&self) -> usize {
        self.state.lock().expect("mock state poisoned").received
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let unexpected = match self.state.lock() {
            Ok(state) => state.unexpected.clone(),
            Err(_) => return,
        };

        if !unexpected.is_empty() && !std::thread::panicking() {
            panic!("there are unexpected requests: {unexpected:?}");
        }
    }
}

pub struct AnticipatedRequest {
    path: String,
    incoming: Option<oneshot::Receiver<Incoming>>,
    responder: Option<oneshot::Sender<Response<Bytes>>>,
}

impl AnticipatedRequest {
    /// Wait for the request to arrive. The request stays pending until one of the `respond`
    /// functions is called.
    pub async fn expect(&mut self) -> Request<()> {
        let incoming = self
            .incoming
            .take()
            .expect("request was already expected");

        let (request, responder) = incoming
            .await
            .expect("mock server is gone before the request came");

        log::info!("Got anticipated '{}'.", self.path);
        self.responder = Some(responder);
        request
    }

    pub async fn respond(self, body: impl Into<Bytes>) {
        self.respond_with(Response::new(body.into())).await;
    }

    pub async fn respond_with_status(self, status: StatusCode) {
        let mut response = Response::new(Bytes::new());
        *response.status_mut() = status;
        self.respond_with(response).await;
    }

    /// Respond with arbitrary response, e.g. one carrying additional headers. Waits for the
    /// request if it did not come yet.
    pub async fn respond_with(mut self, response: Response<Bytes>) {
        if self.responder.is_none() {
            self.expect().await;
        }

        log::info!("Responding to '{}' with {}.", self.path, response.status());
        if let Some(responder) = self.responder.take() {
            if responder.send(response).is_err() {
                log::warn!("Client is gone, response to '{}' was not sent.", self.path);
            }
        }
    }
}

struct MockService {
    state: Arc<Mutex<State>>,
}

impl Service<Request<hyper::body::Incoming>> for MockService {
    type Response = Response<Full<Bytes>>;
    type Error = hyper::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, request: Request<hyper::body::Incoming>) -> Self::Future {
        log::info!("Incoming request '{}'.", request.uri());
        let state = Arc::clone(&self.state);

        Box::pin(async move {
            let path = request.uri().path().to_owned();
            let (parts, _body) = request.into_parts();

            let anticipated = {
                let mut state = state.lock().expect("mock state poisoned");
                state.received += 1;
                state
                    .anticipated
                    .get_mut(&path)
                    .and_then(VecDeque::pop_front)
            };

            let Some(tx) = anticipated else {
                log::warn!("Unexpected '{path}'.");
                state
                    .lock()
                    .expect("mock state poisoned")
                    .unexpected
                    .push(path);
                return Ok(status_only(StatusCode::IM_A_TEAPOT, "unexpected"));
            };

            let (response_tx, response_rx) = oneshot::channel();
            if tx.send((Request::from_parts(parts, ()), response_tx)).is_err() {
                log::warn!("Anticipation of '{path}' was dropped.");
                return Ok(status_only(StatusCode::INTERNAL_SERVER_ERROR, "dropped"));
            }

            match response_rx.await {
                Ok(response) => Ok(response.map(Full::new)),
                Err(_) => Ok(status_only(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "no response",
                )),
            }
        })
    }
}

fn status_only(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}
