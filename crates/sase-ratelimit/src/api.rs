//! HTTP API
//!
//! `POST /limit` classifies, `DELETE /limit` lifts a limit, `GET /limit`
//! lists everything currently limited.

use crate::classifier::Classifier;
use crate::tier::parse_address;
use crate::{RateLimitError, Tier};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::{OpenApi, ToSchema};

/// API state
#[derive(Clone)]
pub struct ApiState {
    pub classifier: Arc<Classifier>,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "OpenSASE Rate Limiter API",
        description = "Tiered source throttling backed by iptables",
        license(name = "Apache-2.0")
    ),
    paths(health, list_limits, add_limit, remove_limit),
    components(schemas(
        LimitRequest, UnlimitRequest, StatusResponse, ListResponse, LimitedEntry,
        ErrorResponse, HealthResponse, Tier
    )),
    tags((name = "limits", description = "Rate-limited source management"))
)]
pub struct ApiDoc;

/// Build the API router
pub fn router(classifier: Arc<Classifier>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api-docs/openapi.json", get(openapi))
        .route(
            "/limit",
            get(list_limits).post(add_limit).delete(remove_limit),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(ApiState { classifier }))
}

/// Classification request
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LimitRequest {
    /// IPv4 or IPv6 address literal
    pub ip_class: String,
    /// `suspicious` or `malicious`
    pub queue: String,
}

/// Removal request
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UnlimitRequest {
    /// IPv4 or IPv6 address literal
    pub ip_class: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StatusResponse {
    pub status: String,
    pub message: String,
}

impl StatusResponse {
    fn ok(message: String) -> Self {
        Self {
            status: "ok".into(),
            message,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ListResponse {
    pub status: String,
    pub limited_ips: BTreeMap<String, LimitedEntry>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LimitedEntry {
    pub queue: Tier,
    /// Epoch seconds at which the address entered `queue`
    pub classified_at: f64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub status: String,
    pub detail: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
}

impl RateLimitError {
    /// HTTP status for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RateLimitError::InvalidAddress(_)
            | RateLimitError::InvalidTier(_)
            | RateLimitError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            RateLimitError::DuplicateClassification { .. } => StatusCode::BAD_REQUEST,
            RateLimitError::NotClassified(_) => StatusCode::NOT_FOUND,
            RateLimitError::Firewall { .. }
            | RateLimitError::Persistence(_)
            | RateLimitError::Config(_)
            | RateLimitError::Network(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<JsonRejection> for RateLimitError {
    fn from(rejection: JsonRejection) -> Self {
        RateLimitError::InvalidRequest(rejection.body_text())
    }
}

impl IntoResponse for RateLimitError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = ErrorResponse {
            status: "error".into(),
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Health check
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is healthy", body = HealthResponse)),
    tag = "limits"
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// List limited addresses
#[utoipa::path(
    get,
    path = "/limit",
    responses(
        (status = 200, description = "Currently limited addresses", body = ListResponse),
        (status = 500, description = "Store or firewall failure", body = ErrorResponse)
    ),
    tag = "limits"
)]
pub async fn list_limits(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<ListResponse>, RateLimitError> {
    let entries = state.classifier.list().await?;

    let limited_ips = entries
        .into_iter()
        .map(|(address, entry)| {
            (
                address.to_string(),
                LimitedEntry {
                    queue: entry.queue,
                    classified_at: entry.timestamp,
                },
            )
        })
        .collect();

    Ok(Json(ListResponse {
        status: "ok".into(),
        limited_ips,
    }))
}

/// Limit an address
#[utoipa::path(
    post,
    path = "/limit",
    request_body = LimitRequest,
    responses(
        (status = 200, description = "Address limited", body = StatusResponse),
        (status = 400, description = "Already in the requested queue", body = ErrorResponse),
        (status = 422, description = "Invalid address, queue or body", body = ErrorResponse),
        (status = 500, description = "Store or firewall failure", body = ErrorResponse)
    ),
    tag = "limits"
)]
pub async fn add_limit(
    State(state): State<Arc<ApiState>>,
    payload: Result<Json<LimitRequest>, JsonRejection>,
) -> Result<Json<StatusResponse>, RateLimitError> {
    let Json(req) = payload?;
    let address = parse_address(&req.ip_class)?;
    let tier: Tier = req.queue.parse()?;

    let ack = state.classifier.classify(address, tier).await?;
    Ok(Json(StatusResponse::ok(ack.message())))
}

/// Lift the limit on an address
#[utoipa::path(
    delete,
    path = "/limit",
    request_body = UnlimitRequest,
    responses(
        (status = 200, description = "Limit removed", body = StatusResponse),
        (status = 404, description = "Address is not limited", body = ErrorResponse),
        (status = 422, description = "Invalid address or body", body = ErrorResponse),
        (status = 500, description = "Store or firewall failure", body = ErrorResponse)
    ),
    tag = "limits"
)]
pub async fn remove_limit(
    State(state): State<Arc<ApiState>>,
    payload: Result<Json<UnlimitRequest>, JsonRejection>,
) -> Result<Json<StatusResponse>, RateLimitError> {
    let Json(req) = payload?;
    let address = parse_address(&req.ip_class)?;

    state.classifier.remove(address).await?;
    Ok(Json(StatusResponse::ok(format!("Limit removed for {}", address))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::{EngineError, EngineOp};

    #[test]
    fn test_status_mapping() {
        let addr = "10.0.0.5".parse().unwrap();
        assert_eq!(
            RateLimitError::InvalidAddress("x".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            RateLimitError::DuplicateClassification {
                address: addr,
                tier: Tier::Suspicious
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RateLimitError::NotClassified(addr).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RateLimitError::Firewall {
                address: addr,
                operation: EngineOp::Delete,
                source: EngineError::Timeout {
                    command: "iptables -D FORWARD 1".into(),
                    secs: 5
                },
            }
            .status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_openapi_lists_limit_route() {
        let doc = serde_json::to_value(ApiDoc::openapi()).unwrap();
        let limit = &doc["paths"]["/limit"];
        assert!(limit.get("get").is_some());
        assert!(limit.get("post").is_some());
        assert!(limit.get("delete").is_some());
    }
}
