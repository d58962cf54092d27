//! The aggregator's HTTP surface.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use fanin_engine::{Barrier, BarrierError, Outcome};
use fanin_store::{BarrierStore, Combine};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::cloudevent::{CloudEvent, RUN_ID_EXTENSION};
use crate::data::MergeMode;
use crate::shutdown::Shutdown;

pub type DynBarrier = Barrier<Arc<dyn BarrierStore>, Arc<dyn Combine>>;

pub struct AppState {
    pub barrier: DynBarrier,
    pub merge_mode: MergeMode,
    pub type_override: Option<String>,
    pub default_run_id: String,
    pub shutdown: Arc<Shutdown>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", post(receive))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

async fn health() -> &'static str {
    "ok"
}

pub(crate) fn json_error(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (
        status,
        Json(serde_json::json!({"error": message.to_string()})),
    )
        .into_response()
}

/// Receive one contribution. Answers with the merged event when this
/// delivery completed the barrier, and with an empty 200 otherwise.
async fn receive(
    State(state): State<Arc<AppState>>,
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

    let contribution = match state.merge_mode.decode(&event) {
        Ok(c) => c,
        Err(e) => {
            warn!(event_id = %event.id, error = %e, "Rejected event data");
            return json_error(StatusCode::BAD_REQUEST, e);
        }
    };

    let run_id = event
        .extension(RUN_ID_EXTENSION)
        .unwrap_or(&state.default_run_id)
        .to_string();

    info!(
        event_id = %event.id,
        source = %event.source,
        event_type = %event.ty,
        time = ?event.time,
        run_id = %run_id,
        "Received a new event"
    );

    match state.barrier.offer(&run_id, contribution).await {
        Ok(Outcome::Complete { merged, width } | Outcome::Replayed { merged, width }) => {
            info!(run_id = %run_id, width, "Forwarding merged event");
            let out = event.respond_with(merged, state.type_override.as_deref());
            out.to_http(mode).unwrap_or_else(|e| {
                error!(run_id = %run_id, error = %e, "Failed to encode merged event");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, e)
            })
        }
        Ok(Outcome::Waiting { .. } | Outcome::Duplicate { .. } | Outcome::Retired { .. }) => {
            StatusCode::OK.into_response()
        }
        Err(e @ (BarrierError::RunClosed { .. } | BarrierError::Overrun { .. })) => {
            json_error(StatusCode::CONFLICT, e)
        }
        Err(e) if e.is_fatal() => {
            error!(run_id = %run_id, error = %e, "Barrier state unusable");
            state.shutdown.trigger_fatal();
            json_error(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
        Err(e) => {
            // Soft failure: keep serving, report the barrier as not complete.
            error!(run_id = %run_id, error = %e, "Store failure, reporting incomplete");
            StatusCode::OK.into_response()
        }
    }
}
