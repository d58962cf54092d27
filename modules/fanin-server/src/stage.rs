//! Stage function template: the business-logic step that feeds the barrier.
//!
//! A stage receives `{ id, payload }`, runs its logic, and adds its result to
//! `payload` under its own name, so downstream stages (and the aggregator in
//! payload mode) can address it as `payload["<stage-name>"]`.
//!
//! The reply keeps the inbound `id` but names the stage in its `source`, so
//! replies from sibling stages are distinct contributions at the aggregator
//! while a redelivered input still produces the same reply identity.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::{get, post},
    Router,
};
use serde_json::{Map, Value};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::cloudevent::CloudEvent;
use crate::data::PayloadData;
use crate::routes::json_error;

/// Caller-supplied business logic.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Compute this stage's contribution from the accumulated payload.
    async fn process(&self, payload: &Map<String, Value>) -> Result<Value>;
}

/// Stage that contributes a fixed message.
pub struct MessageStage {
    message: String,
}

impl MessageStage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl Stage for MessageStage {
    async fn process(&self, _payload: &Map<String, Value>) -> Result<Value> {
        Ok(serde_json::json!({ "message": self.message }))
    }
}

pub struct StageState {
    pub stage: Arc<dyn Stage>,
    pub name: String,
    pub type_override: Option<String>,
}

pub fn build_stage_router(state: StageState) -> Router {
    Router::new()
        .route("/", post(transform))
        .route("/health", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

async fn transform(
    State(state): State<Arc<StageState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (event, mode) = match CloudEvent::from_http(&headers, &body) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!(error = %e, "Rejected undecodable event");
            return json_error(StatusCode::BAD_REQUEST, e);
        }
    };

    let mut data: PayloadData = match event.data_as() {
        Ok(data) => data,
        Err(e) => {
            warn!(event_id = %event.id, error = %e, "Got error while unmarshalling data");
            return json_error(StatusCode::BAD_REQUEST, e);
        }
    };

    info!(event_id = %event.id, source = %event.source, event_type = %event.ty, stage = %state.name, "Received a new event");

    let result = match state.stage.process(&data.payload).await {
        Ok(result) => result,
        Err(e) => {
            error!(event_id = %event.id, stage = %state.name, error = %e, "Stage failed");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, e);
        }
    };
    data.payload.insert(state.name.clone(), result);

    let data = match serde_json::to_value(&data) {
        Ok(data) => data,
        Err(e) => {
            error!(event_id = %event.id, error = %e, "Got error while marshalling data");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, e);
        }
    };

    let mut out = event.respond_with(data, state.type_override.as_deref());
    out.source = stage_source(&event.source, &state.name);
    info!(event_id = %out.id, source = %out.source, event_type = %out.ty, "Transformed event");
    out.to_http(mode).unwrap_or_else(|e| {
        error!(event_id = %out.id, error = %e, "Failed to encode event");
        json_error(StatusCode::INTERNAL_SERVER_ERROR, e)
    })
}

/// `source` of a stage's reply: the inbound source with the stage name appended.
fn stage_source(inbound: &str, name: &str) -> String {
    format!("{}/{}", inbound.trim_end_matches('/'), name)
}
