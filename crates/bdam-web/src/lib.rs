//! Axum inbound surface: liveness probe + webhook receiver.
//!
//! The receiver always answers `200 OK` and hands the payload to the
//! pipeline on a background task, so webhook acknowledgment never waits on
//! CRM or database work; a slow acknowledgment makes the CRM time out and
//! redeliver the event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::get;
use axum::Router;
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, info, Instrument};
use uuid::Uuid;

use bdam_core::WebhookPayload;
use bdam_sync::WebhookSink;

pub const CRATE_NAME: &str = "bdam-web";

/// Best-effort duplicate-delivery filter keyed on a hash of the raw body.
///
/// Purely in-memory and per-process; it only blunts the CRM's short-fuse
/// redeliveries, it is not a delivery guarantee.
#[derive(Debug)]
pub struct PayloadDedup {
    window: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl PayloadDedup {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// True when an identical body was already accepted inside the window.
    pub async fn is_duplicate(&self, body: &[u8]) -> bool {
        let digest = hex::encode(Sha256::digest(body));
        let now = Instant::now();
        let mut seen = self.seen.lock().await;
        seen.retain(|_, first_seen| now.duration_since(*first_seen) < self.window);
        if seen.contains_key(&digest) {
            true
        } else {
            seen.insert(digest, now);
            false
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    sink: Arc<dyn WebhookSink>,
    dedup: Option<Arc<PayloadDedup>>,
}

impl AppState {
    pub fn new(sink: Arc<dyn WebhookSink>) -> Self {
        Self { sink, dedup: None }
    }

    /// Enable the duplicate-delivery pre-filter ahead of the router.
    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup = Some(Arc::new(PayloadDedup::new(window)));
        self
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(liveness_handler).post(webhook_handler))
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "webhook receiver listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn liveness_handler() -> &'static str {
    "bdam webhook receiver is alive"
}

async fn webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let delivery_id = Uuid::new_v4();

    if let Some(dedup) = &state.dedup {
        if dedup.is_duplicate(&body).await {
            info!(%delivery_id, "duplicate webhook delivery dropped");
            return (StatusCode::OK, "OK");
        }
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    let payload = WebhookPayload::parse(content_type, &body);
    debug!(
        %delivery_id,
        event = payload.event.as_deref().unwrap_or("-"),
        entity_id = payload.entity_id.as_deref().unwrap_or("-"),
        "webhook received"
    );

    let span = tracing::info_span!(
        "webhook_delivery",
        %delivery_id,
        event = payload.event.as_deref().unwrap_or("-")
    );
    let sink = Arc::clone(&state.sink);
    tokio::spawn(async move { sink.process(payload).await }.instrument(span));

    (StatusCode::OK, "OK")
}
