use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::IntoResponse,
    routing::{any, get},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

/// What `/echo` saw of the request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Echo {
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// Number of requests served, excluding `/hits` itself.
pub type Hits = Arc<AtomicUsize>;

pub fn app() -> Router {
    app_with_hits(Hits::default())
}

pub fn app_with_hits(hits: Hits) -> Router {
    Router::new()
        .route("/echo", any(echo))
        .route("/status/{code}", get(status))
        .route("/json", get(json))
        .route("/bytes/{n}", get(bytes))
        .route("/hits", get(read_hits))
        .with_state(hits)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

pub async fn run_with_hits(listener: TcpListener, hits: Hits) -> Result<(), std::io::Error> {
    axum::serve(listener, app_with_hits(hits)).await
}

fn hit(hits: &Hits) {
    let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
    tracing::debug!(hits = n, "request served");
}

async fn echo(State(hits): State<Hits>, method: Method, headers: HeaderMap, body: Bytes) -> Json<Echo> {
    hit(&hits);
    let headers = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    Json(Echo {
        method: method.to_string(),
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

async fn status(State(hits): State<Hits>, Path(code): Path<u16>) -> Result<impl IntoResponse, StatusCode> {
    hit(&hits);
    let code = StatusCode::from_u16(code).map_err(|_| StatusCode::BAD_REQUEST)?;
    Ok((code, [("x-mock-status", code.as_str().to_string())]))
}

async fn json(State(hits): State<Hits>) -> Json<serde_json::Value> {
    hit(&hits);
    Json(serde_json::json!({ "ok": true, "source": "mock-server" }))
}

async fn bytes(State(hits): State<Hits>, Path(n): Path<usize>) -> impl IntoResponse {
    hit(&hits);
    let data: Vec<u8> = (0..n).map(|i| (i % 256) as u8).collect();
    ([(header::CONTENT_TYPE, "application/octet-stream")], data)
}

async fn read_hits(State(hits): State<Hits>) -> Json<usize> {
    Json(hits.load(Ordering::SeqCst))
}
