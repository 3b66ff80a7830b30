use std::collections::BTreeMap;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::pages;
use super::AppState;
use crate::archiver::Collect;
use crate::publish::{Sink, SinkStats};
use crate::service::Outcome;
use crate::urls;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(home))
        .route("/wayback", post(wayback))
        .route("/status", get(status))
        .route("/healthz", get(health))
}

async fn health() -> &'static str {
    "ok"
}

async fn home(State(state): State<AppState>) -> Response {
    let slots: Vec<&str> = state.service.slots().iter().map(|s| s.name()).collect();
    Html(pages::home(&slots).into_string()).into_response()
}

#[derive(Debug, Deserialize)]
struct WaybackForm {
    text: String,
}

#[derive(Debug, Serialize)]
struct WaybackReply {
    collects: Vec<Collect>,
}

fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/json"))
}

fn reject(json: bool, status: StatusCode, title: &str, message: &str) -> Response {
    if json {
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    } else {
        (status, Html(pages::notice(title, message).into_string())).into_response()
    }
}

async fn wayback(State(state): State<AppState>, headers: HeaderMap, Form(form): Form<WaybackForm>) -> Response {
    let json = wants_json(&headers);
    let urls = urls::extract(&form.text);
    if urls.is_empty() {
        return reject(json, StatusCode::BAD_REQUEST, "Nothing to archive", "No URL found in the submitted text.");
    }

    info!(count = urls.len(), "Archive request received");

    let rx = match state.service.submit(urls).await {
        Ok(rx) => rx,
        Err(e) => {
            warn!("Archive request refused: {e}");
            return reject(json, StatusCode::SERVICE_UNAVAILABLE, "Unavailable", "The service is shutting down.");
        }
    };

    match tokio::time::timeout(state.config.web_wait, rx).await {
        Ok(Ok(Outcome::Archived(collects))) => {
            debug!(records = collects.len(), "Archive request finished");
            if json {
                Json(WaybackReply { collects }).into_response()
            } else {
                Html(pages::results(&collects).into_string()).into_response()
            }
        }
        Ok(Ok(Outcome::Failed(message))) => reject(json, StatusCode::GATEWAY_TIMEOUT, "Timeout", &message),
        Ok(Err(_)) => {
            error!("Archive job dropped without an outcome");
            reject(json, StatusCode::INTERNAL_SERVER_ERROR, "Error", "The archive job was lost.")
        }
        Err(_) => reject(
            json,
            StatusCode::ACCEPTED,
            "Still working",
            "Archiving is taking longer than expected. Results will be published when ready.",
        ),
    }
}

#[derive(Debug, Serialize)]
struct PoolStatus {
    status: String,
    capacity: usize,
    running: usize,
    waiting: usize,
    closed: bool,
}

impl PoolStatus {
    fn of(pool: &crate::pooling::Pool) -> Self {
        Self {
            status: pool.status(),
            capacity: pool.capacity(),
            running: pool.running(),
            waiting: pool.waiting(),
            closed: pool.closed(),
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusReply {
    archive: PoolStatus,
    publish: PoolStatus,
    publish_waiting: usize,
    sinks: BTreeMap<&'static str, SinkStats>,
}

async fn status(State(state): State<AppState>) -> Json<StatusReply> {
    let dispatcher = state.service.dispatcher();
    let sinks = Sink::ALL
        .into_iter()
        .filter(|sink| dispatcher.configured().contains(sink))
        .map(|sink| (sink.id(), dispatcher.stats(sink)))
        .collect();

    Json(StatusReply {
        archive: PoolStatus::of(state.service.pool()),
        publish: PoolStatus::of(dispatcher.pool()),
        publish_waiting: dispatcher.waiting(),
        sinks,
    })
}
