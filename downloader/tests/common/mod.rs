//! In-process HTTP range server for the pipeline tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures_util::{stream, StreamExt};

/// Deterministic, non-repeating-looking test content.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

struct ServerState {
    payload: Bytes,
    /// Range requests seen, as sent in the `Range` header.
    ranges: Mutex<Vec<String>>,
    tokens: Mutex<Vec<Option<String>>>,
    /// One-shot failures: range start -> bytes to send before dropping.
    failures: Mutex<HashMap<u64, usize>>,
    slow: AtomicBool,
}

pub struct TestServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
}

impl TestServer {
    pub async fn start(payload: Vec<u8>) -> Self {
        let state = Arc::new(ServerState {
            payload: Bytes::from(payload),
            ranges: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            slow: AtomicBool::new(false),
        });

        let app = Router::new()
            .route("/file.bin", get(serve_file))
            .route("/unsized", get(serve_unsized))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn requests(&self) -> usize {
        self.state.ranges.lock().unwrap().len()
    }

    pub fn ranges(&self) -> Vec<String> {
        self.state.ranges.lock().unwrap().clone()
    }

    pub fn tokens(&self) -> Vec<Option<String>> {
        self.state.tokens.lock().unwrap().clone()
    }

    /// The next request starting at `start` sends `after` bytes, stalls, then
    /// breaks the connection.
    pub fn fail_once(&self, start: u64, after: usize) {
        self.state.failures.lock().unwrap().insert(start, after);
    }

    /// Trickle bodies out in small delayed pieces.
    pub fn set_slow(&self, slow: bool) {
        self.state.slow.store(slow, Ordering::SeqCst);
    }
}

async fn serve_file(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let token = headers
        .get("x-token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.ranges.lock().unwrap().push(range.clone());
    state.tokens.lock().unwrap().push(token);

    let total = state.payload.len() as u64;
    let Some((start, end)) = parse_range(&range, total) else {
        return Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::CONTENT_RANGE, format!("bytes */{}", total))
            .body(Body::empty())
            .unwrap();
    };

    let data = state.payload.slice(start as usize..=end as usize);
    let len = data.len();
    let fail_after = state.failures.lock().unwrap().remove(&start);
    let body = match fail_after {
        Some(after) => failing_body(data, after),
        None if state.slow.load(Ordering::SeqCst) => slow_body(data),
        None => Body::from(data),
    };

    Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header(header::CONTENT_LENGTH, len)
        .header(header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, total))
        .body(body)
        .unwrap()
}

/// Chunked response with no Content-Length.
async fn serve_unsized() -> Response {
    let pieces = vec![Ok::<Bytes, io::Error>(Bytes::from_static(b"no length here"))];
    Response::builder()
        .status(StatusCode::OK)
        .body(Body::from_stream(stream::iter(pieces)))
        .unwrap()
}

fn parse_range(raw: &str, total: u64) -> Option<(u64, u64)> {
    let spec = raw.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = if end.is_empty() {
        total.checked_sub(1)?
    } else {
        end.parse::<u64>().ok()?.min(total.checked_sub(1)?)
    };
    (start <= end).then_some((start, end))
}

fn failing_body(data: Bytes, after: usize) -> Body {
    let head = data.slice(..after.min(data.len()));
    let stream = stream::unfold(0u8, move |step| {
        let head = head.clone();
        async move {
            match step {
                0 => Some((Ok::<Bytes, io::Error>(head), 1)),
                1 => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Some((
                        Err(io::Error::new(io::ErrorKind::ConnectionReset, "injected failure")),
                        2,
                    ))
                }
                _ => None,
            }
        }
    });
    Body::from_stream(stream)
}

fn slow_body(data: Bytes) -> Body {
    let pieces: Vec<Bytes> = (0..data.len())
        .step_by(512)
        .map(|i| data.slice(i..(i + 512).min(data.len())))
        .collect();
    let stream = stream::iter(pieces).then(|piece| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok::<Bytes, io::Error>(piece)
    });
    Body::from_stream(stream)
}
