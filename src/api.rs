// REST API with Axum
// Register, detect and refill endpoints plus the liveness routes

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::error::ServiceError;
use crate::service::SimilarityService;

/// Symbolic status for a successful operation.
pub const STATUS_OK: u16 = 200;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: SimilarityService,
}

// ============================================================================
// Request bodies
// Field names follow the public wire format; the aliases are accepted too
// ============================================================================

#[derive(Deserialize)]
pub struct RegisterRequest {
    #[serde(alias = "identity")]
    pub username: String,
    #[serde(alias = "secret")]
    pub password: String,
}

#[derive(Deserialize)]
pub struct DetectRequest {
    #[serde(alias = "identity")]
    pub username: String,
    #[serde(alias = "secret")]
    pub password: String,
    pub text1: String,
    pub text2: String,
}

#[derive(Deserialize)]
pub struct RefillRequest {
    #[serde(alias = "identity")]
    pub username: String,
    #[serde(alias = "admin_secret")]
    pub admin_pw: String,
    #[serde(alias = "refill_amount")]
    pub refill: i64,
}

// ============================================================================
// Response bodies
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
    pub status: u16,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DetectResponse {
    pub similarity: f64,
    pub message: String,
    pub credits: i64,
    pub status: u16,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefillResponse {
    pub message: String,
    pub credits: i64,
    pub status: u16,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

fn http_status(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
        ServiceError::IdentityConflict => StatusCode::CONFLICT,
        ServiceError::UserNotFound => StatusCode::NOT_FOUND,
        ServiceError::InvalidCredential => StatusCode::UNAUTHORIZED,
        ServiceError::InsufficientCredits => StatusCode::PAYMENT_REQUIRED,
        ServiceError::InvalidAdminCredential => StatusCode::FORBIDDEN,
        ServiceError::ExternalComputationFailure { .. } => StatusCode::BAD_GATEWAY,
        ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        if let ServiceError::Internal(detail) = &self {
            error!(detail = %detail, "request failed with internal error");
        }

        let body = MessageResponse {
            message: self.public_message(),
            status: self.status_code(),
        };
        (http_status(&self), Json(body)).into_response()
    }
}

fn malformed(rejection: JsonRejection) -> ServiceError {
    ServiceError::MalformedRequest(rejection.body_text())
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET / - Liveness probe
async fn hello() -> &'static str {
    "Hello World!"
}

/// GET /health - Health check
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: crate::VERSION.to_string(),
    })
}

/// POST /register - Create an account
async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Json<MessageResponse>, ServiceError> {
    let Json(req) = payload.map_err(malformed)?;

    state.service.register(&req.username, &req.password).await?;

    Ok(Json(MessageResponse {
        message: "User registered successfully".to_string(),
        status: STATUS_OK,
    }))
}

/// POST /detect - Metered similarity comparison
async fn detect(
    State(state): State<AppState>,
    payload: Result<Json<DetectRequest>, JsonRejection>,
) -> Result<Json<DetectResponse>, ServiceError> {
    let Json(req) = payload.map_err(malformed)?;

    let detection = state
        .service
        .detect(&req.username, &req.password, &req.text1, &req.text2)
        .await?;

    Ok(Json(DetectResponse {
        similarity: detection.similarity,
        message: "Similarity score calculated".to_string(),
        credits: detection.remaining_credits,
        status: STATUS_OK,
    }))
}

/// POST /refill - Admin credit adjustment
async fn refill(
    State(state): State<AppState>,
    payload: Result<Json<RefillRequest>, JsonRejection>,
) -> Result<Json<RefillResponse>, ServiceError> {
    let Json(req) = payload.map_err(malformed)?;

    let credits = state
        .service
        .refill(&req.username, &req.admin_pw, req.refill)
        .await?;

    Ok(Json(RefillResponse {
        message: "Tokens refilled successfully".to_string(),
        credits,
        status: STATUS_OK,
    }))
}

// ============================================================================
// Router
// ============================================================================

pub fn router(service: SimilarityService) -> Router {
    Router::new()
        .route("/", get(hello))
        .route("/health", get(health_check))
        .route("/register", post(register))
        .route("/detect", post(detect))
        .route("/refill", post(refill))
        .with_state(AppState { service })
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}
