//! HTTP front end: submission, result polling, liveness and metrics.
//!
//! Every JSON response has the shape `{"response": ...}`. Error bodies carry
//! a fixed message per status code.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::admission::{Admission, AdmissionError};
use crate::metrics::metrics_handler;
use crate::polling::{PollError, PollOutcome, ResultPoller};

pub const BAD_REQUEST: &str = "The request body is not of a valid format.";
pub const UNPROCESSABLE_ENTITY: &str = "The request body can not be processed.";
pub const NOT_FOUND: &str = "The result is not found.";
pub const METHOD_NOT_ALLOWED: &str = "This method is not allowed.";

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub admission: Arc<Admission>,
    pub poller: Arc<ResultPoller>,
}

impl AppState {
    pub fn new(admission: Admission, poller: ResultPoller) -> Self {
        Self {
            admission: Arc::new(admission),
            poller: Arc::new(poller),
        }
    }
}

/// Builds the front-end router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ping).fallback(method_not_allowed))
        .route(
            "/receive_locations/",
            axum::routing::post(receive_locations).fallback(method_not_allowed),
        )
        .route(
            "/get_optimal_route/",
            get(get_optimal_route).fallback(method_not_allowed),
        )
        .route("/metrics", get(metrics_handler).fallback(method_not_allowed))
        .with_state(state)
}

/// Serves `router` on `addr` until `shutdown` resolves.
pub async fn serve<F>(addr: SocketAddr, router: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP front end listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

fn reply(status: StatusCode, body: Value) -> Response {
    (status, Json(json!({ "response": body }))).into_response()
}

async fn ping() -> Response {
    reply(StatusCode::OK, json!("pong"))
}

async fn method_not_allowed() -> Response {
    reply(StatusCode::METHOD_NOT_ALLOWED, json!(METHOD_NOT_ALLOWED))
}

// Raw bytes so that malformed JSON maps to our 400 body instead of the
// extractor's rejection.
async fn receive_locations(State(state): State<AppState>, body: Bytes) -> Response {
    let document: Value = match serde_json::from_slice(&body) {
        Ok(document) => document,
        Err(_) => return reply(StatusCode::BAD_REQUEST, json!(BAD_REQUEST)),
    };

    match state.admission.submit(document) {
        Ok(id) => reply(StatusCode::CREATED, json!(id.as_str())),
        Err(AdmissionError::BadRequest) => reply(StatusCode::BAD_REQUEST, json!(BAD_REQUEST)),
        Err(AdmissionError::Unprocessable(_)) => {
            reply(StatusCode::UNPROCESSABLE_ENTITY, json!(UNPROCESSABLE_ENTITY))
        }
    }
}

#[derive(Debug, Deserialize)]
struct PollParams {
    request_id: Option<String>,
}

async fn get_optimal_route(
    State(state): State<AppState>,
    query: Result<Query<PollParams>, QueryRejection>,
) -> Response {
    let Ok(Query(params)) = query else {
        return reply(StatusCode::BAD_REQUEST, json!(BAD_REQUEST));
    };

    match state.poller.poll(params.request_id.as_deref()).await {
        Ok(PollOutcome::Ready(stored)) => {
            let route = serde_json::from_str(&stored).unwrap_or(Value::String(stored));
            reply(StatusCode::OK, route)
        }
        Ok(PollOutcome::Absent) => reply(StatusCode::NOT_FOUND, json!(NOT_FOUND)),
        Err(PollError::MissingId) => reply(StatusCode::BAD_REQUEST, json!(BAD_REQUEST)),
        Err(PollError::MalformedId(_)) => {
            reply(StatusCode::UNPROCESSABLE_ENTITY, json!(UNPROCESSABLE_ENTITY))
        }
    }
}
