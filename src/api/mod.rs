//! HTTP API for health checks, transfer submission and inspection

use crate::config::ApiConfig;
use crate::error::{TrackerError, TrackerResult};
use crate::state::{StoreStats, TransferStore};
use crate::transfer::{CompletedTransfer, NewTransfer, TransferRecord};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<TransferStore>,
}

pub fn router(store: Arc<TransferStore>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/transfers", axum::routing::post(submit_transfer))
        .route("/transfers/ongoing", get(list_ongoing))
        .route("/transfers/completed", get(list_completed))
        .route("/transfers/:id", get(get_transfer).delete(untrack_transfer))
        .route("/stats", get(get_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(AppState { store })
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, store: Arc<TransferStore>) -> TrackerResult<()> {
    let app = router(store);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| TrackerError::Internal(format!("bind {addr}: {e}")))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| TrackerError::Internal(format!("API server: {e}")))?;

    Ok(())
}

/// Error body returned to API clients
struct ApiError(TrackerError);

impl From<TrackerError> for ApiError {
    fn from(err: TrackerError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TrackerError::InvalidTransfer(_) => StatusCode::BAD_REQUEST,
            TrackerError::TransferNotFound { .. } => StatusCode::NOT_FOUND,
            TrackerError::DuplicateTransfer { .. } | TrackerError::AlreadyFinalized { .. } => {
                StatusCode::CONFLICT
            }
            TrackerError::Database(_) | TrackerError::Persistence(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!("API request failed: {}", self.0);
        }

        (
            status,
            Json(ErrorResponse {
                error: self.0.kind(),
                message: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness check - persistence must answer
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let persistence = state.store.health_check().await.is_ok();
    let status = if persistence {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready: persistence,
            persistence,
        }),
    )
}

/// Hand a submitted transfer over to the tracker
async fn submit_transfer(
    State(state): State<AppState>,
    Json(new): Json<NewTransfer>,
) -> Result<(StatusCode, Json<TransferRecord>), ApiError> {
    let record = TransferRecord::from_submission(new)?;
    state.store.track(record.clone()).await?;
    info!(transfer_id = %record.id, direction = record.direction.as_str(), "Transfer submitted");
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_ongoing(State(state): State<AppState>) -> Json<Vec<TransferRecord>> {
    Json(state.store.list_ongoing().await)
}

async fn list_completed(State(state): State<AppState>) -> Json<Vec<CompletedTransfer>> {
    Json(state.store.list_completed().await)
}

async fn get_transfer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TransferView>, ApiError> {
    if let Some(record) = state.store.get_ongoing(&id).await {
        return Ok(Json(TransferView::Ongoing(record)));
    }
    match state.store.get_completed(&id).await {
        Some(completed) => Ok(Json(TransferView::Completed(completed))),
        None => Err(TrackerError::TransferNotFound { id }.into()),
    }
}

/// Stop tracking an ongoing transfer without finalizing it
async fn untrack_transfer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    match state.store.remove_ongoing(&id).await? {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None if state.store.is_completed(&id).await => {
            Err(TrackerError::AlreadyFinalized { id }.into())
        }
        None => Err(TrackerError::TransferNotFound { id }.into()),
    }
}

async fn get_stats(State(state): State<AppState>) -> Json<StoreStats> {
    Json(state.store.stats().await)
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    persistence: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

#[derive(Serialize)]
#[serde(tag = "collection", content = "transfer", rename_all = "snake_case")]
enum TransferView {
    Ongoing(TransferRecord),
    Completed(CompletedTransfer),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryPersistence;
    use crate::transfer::fixtures::*;
    use crate::transfer::Outcome;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn store() -> Arc<TransferStore> {
        Arc::new(
            TransferStore::open(Arc::new(MemoryPersistence::new()))
                .await
                .unwrap(),
        )
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn submission(id: &str) -> Value {
        json!({
            "id": id,
            "source_chain": serde_json::to_value(ethereum()).unwrap(),
            "destination_chain": serde_json::to_value(asset_hub()).unwrap(),
            "sender": "0x8f2f8a4b3a2ab0d0b1e7dbf4a1b2c3d4e5f60718",
            "recipient": "14E5nqKAp3oAJcmzgZhUD2RcptBeUBScxKHgJKU4HPNcKVf3",
            "submitted_at": "2026-03-01T12:00:00Z"
        })
    }

    fn post(body: &Value) -> Request<Body> {
        Request::post("/transfers")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn submit_then_duplicate_is_rejected() {
        let store = store().await;

        let (status, body) = send(router(store.clone()), post(&submission("0xabc"))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["direction"], "to_polkadot");
        assert_eq!(body["status"], "Submitted");

        let (status, body) = send(router(store.clone()), post(&submission("0xabc"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "duplicate");
        assert_eq!(store.stats().await.ongoing, 1);
    }

    #[tokio::test]
    async fn submission_without_sender_is_bad_request() {
        let mut body = submission("0xabc");
        body["sender"] = json!("");
        let (status, _) = send(router(store().await), post(&body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn completed_ids_cannot_be_resubmitted() {
        let store = store().await;
        store
            .add_completed(CompletedTransfer::finalize(
                record("0xdone", ethereum(), asset_hub()),
                Outcome::Succeeded,
                submitted_at(),
                None,
            ))
            .await
            .unwrap();

        let (status, body) = send(router(store), post(&submission("0xdone"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "already_finalized");
    }

    #[tokio::test]
    async fn get_reports_collection() {
        let store = store().await;
        store
            .track(record("0x1", hydration(), asset_hub()))
            .await
            .unwrap();

        let request = Request::get("/transfers/0x1").body(Body::empty()).unwrap();
        let (status, body) = send(router(store.clone()), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["collection"], "ongoing");
        assert_eq!(body["transfer"]["id"], "0x1");

        let request = Request::get("/transfers/0x2").body(Body::empty()).unwrap();
        let (status, _) = send(router(store), request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_untracks_ongoing_transfer() {
        let store = store().await;
        store
            .track(record("0x1", hydration(), asset_hub()))
            .await
            .unwrap();

        let request = Request::delete("/transfers/0x1").body(Body::empty()).unwrap();
        let (status, _) = send(router(store.clone()), request).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let request = Request::get("/stats").body(Body::empty()).unwrap();
        let (_, body) = send(router(store), request).await;
        assert_eq!(body, json!({ "ongoing": 0, "completed": 0 }));
    }
}
