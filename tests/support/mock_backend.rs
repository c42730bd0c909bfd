use std::{
    collections::HashSet,
    convert::Infallible,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{body, Body, Method, Request, Response, Server, StatusCode};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Scripted replies for the product image endpoints.
#[derive(Default)]
pub struct BackendScript {
    /// Product ids answered with `{"status": "error"}` and HTTP 400.
    pub rejected: HashSet<String>,
    /// Product ids answered with an HTML error page.
    pub broken: HashSet<String>,
    /// Product ids whose success message mentions unmatched images.
    pub unmatched: HashSet<String>,
    pub latency: Duration,
}

#[derive(Default)]
struct BackendState {
    script: BackendScript,
    received: Mutex<Vec<(String, String)>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

#[derive(Clone)]
pub struct MockBackend {
    state: Arc<BackendState>,
}

impl MockBackend {
    pub fn new(script: BackendScript) -> Self {
        Self {
            state: Arc::new(BackendState {
                script,
                ..BackendState::default()
            }),
        }
    }

    /// `(path, product_id)` pairs in arrival order.
    pub fn received(&self) -> Vec<(String, String)> {
        self.state.received.lock().expect("backend poisoned").clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.state.peak_in_flight.load(Ordering::SeqCst)
    }
}

pub struct MockBackendServer {
    url: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockBackendServer {
    pub async fn start(backend: MockBackend) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock backend listener")?;
        let addr = listener
            .local_addr()
            .context("failed to read mock listener address")?;
        let std_listener = listener
            .into_std()
            .context("failed to convert mock listener")?;
        std_listener
            .set_nonblocking(true)
            .context("failed to set mock listener non-blocking")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let make_service = make_service_fn(move |_| {
            let backend = backend.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| serve_request(backend.clone(), req)))
            }
        });

        let server = Server::from_tcp(std_listener)
            .context("failed to build mock HTTP server")?
            .serve(make_service);
        let graceful = server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });

        let handle = tokio::spawn(async move {
            if let Err(err) = graceful.await {
                eprintln!("mock backend stopped: {err}");
            }
        });

        Ok(Self {
            url: format!("http://{}", addr),
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn serve_request(backend: MockBackend, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    if req.method() != Method::POST {
        return Ok(status_response(StatusCode::METHOD_NOT_ALLOWED, Body::from("Unsupported method")));
    }

    let path = req.uri().path().to_owned();
    if path != "/api/populate-single-product" && path != "/api/delete-populated-single-product" {
        return Ok(status_response(StatusCode::NOT_FOUND, Body::from("Not found")));
    }

    let bytes = match body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(_) => return Ok(status_response(StatusCode::BAD_REQUEST, Body::empty())),
    };
    let product_id = serde_json::from_slice::<Value>(&bytes)
        .ok()
        .and_then(|value| value.get("product_id").and_then(Value::as_str).map(str::to_owned));
    let Some(product_id) = product_id else {
        return Ok(json_response(
            StatusCode::BAD_REQUEST,
            json!({"status": "error", "message": "Missing product_id in request body"}),
        ));
    };

    let state = &backend.state;
    let running = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.peak_in_flight.fetch_max(running, Ordering::SeqCst);
    state
        .received
        .lock()
        .expect("backend poisoned")
        .push((path, product_id.clone()));

    if !state.script.latency.is_zero() {
        sleep(state.script.latency).await;
    }
    state.in_flight.fetch_sub(1, Ordering::SeqCst);

    let script = &state.script;
    let response = if script.broken.contains(&product_id) {
        status_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            Body::from("<html>Internal Server Error</html>"),
        )
    } else if script.rejected.contains(&product_id) {
        json_response(
            StatusCode::BAD_REQUEST,
            json!({"status": "error", "message": "Could not fetch product from Shopify."}),
        )
    } else if script.unmatched.contains(&product_id) {
        json_response(
            StatusCode::OK,
            json!({"status": "success", "message": "Populated, 2 unmatched images left"}),
        )
    } else {
        json_response(
            StatusCode::OK,
            json!({"status": "success", "message": "Images populated"}),
        )
    };
    Ok(response)
}

fn status_response(status: StatusCode, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

fn json_response(status: StatusCode, value: Value) -> Response<Body> {
    let mut response = Response::new(Body::from(value.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}
