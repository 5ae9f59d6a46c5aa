//! Axum HTTP surface for the relay: inbound CRM webhooks, test sends,
//! health and poller status.

pub mod webhook;

use std::future::Future;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use relay_adapters::{DeliveryOutcome, NotificationSink};
use relay_core::MessageFormatter;
use relay_sync::PollScheduler;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::webhook::{event_message, EventKind, WebhookEvent};

pub const CRATE_NAME: &str = "relay-web";

pub const TEST_MESSAGE: &str = "Test message from CRM Relay";

#[derive(Clone)]
pub struct AppState {
    pub sink: Arc<dyn NotificationSink>,
    pub formatter: MessageFormatter,
    /// `None` when the poller is disabled for this process.
    pub poller: Option<Arc<PollScheduler>>,
}

impl AppState {
    pub fn new(sink: Arc<dyn NotificationSink>, formatter: MessageFormatter) -> Self {
        Self {
            sink,
            formatter,
            poller: None,
        }
    }

    pub fn with_poller(mut self, poller: Arc<PollScheduler>) -> Self {
        self.poller = Some(poller);
        self
    }
}

#[derive(Debug, Serialize)]
struct StatusBody {
    poller: &'static str,
    notified: usize,
    roster_size: usize,
}

#[derive(Debug, Default, Deserialize)]
struct TestSendRequest {
    #[serde(default)]
    text: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/webhooks/crm", post(webhook_handler))
        .route("/test-send", post(test_send_handler))
        .with_state(Arc::new(state))
}

/// Serves until `shutdown` resolves.
pub async fn serve<F>(state: AppState, port: u16, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusBody> {
    let Some(poller) = &state.poller else {
        return Json(StatusBody {
            poller: "disabled",
            notified: 0,
            roster_size: 0,
        });
    };
    let snapshot = poller.engine().snapshot();
    let label = match poller.state().await {
        relay_sync::PollerState::Idle => "idle",
        relay_sync::PollerState::Polling => "polling",
    };
    Json(StatusBody {
        poller: label,
        notified: snapshot.notified,
        roster_size: snapshot.roster_size,
    })
}

async fn webhook_handler(State(state): State<Arc<AppState>>, Json(event): Json<WebhookEvent>) -> Response {
    let tag = event.event.as_deref().unwrap_or_default();
    let Some(kind) = EventKind::parse(tag) else {
        warn!(event = tag, "ignoring unknown webhook event");
        return (StatusCode::ACCEPTED, Json(json!({"status": "ignored"}))).into_response();
    };
    let text = event_message(kind, &event.data, &state.formatter);
    deliver(state.sink.as_ref(), &text).await
}

async fn test_send_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        TestSendRequest::default()
    } else {
        match serde_json::from_slice::<TestSendRequest>(&body) {
            Ok(request) => request,
            Err(err) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"status": "error", "error": err.to_string()})),
                )
                    .into_response()
            }
        }
    };
    let text = request
        .text
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| TEST_MESSAGE.to_string());
    deliver(state.sink.as_ref(), &text).await
}

async fn deliver(sink: &dyn NotificationSink, text: &str) -> Response {
    match sink.deliver(text).await {
        Ok(outcome) => {
            let status = match outcome {
                DeliveryOutcome::Delivered => "delivered",
                DeliveryOutcome::Skipped => "skipped",
            };
            (StatusCode::OK, Json(json!({"status": status, "text": text}))).into_response()
        }
        Err(err) => {
            error!(error = %err, "delivery failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"status": "error", "error": err.to_string()})),
            )
                .into_response()
        }
    }
}
