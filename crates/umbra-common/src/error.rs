//! Centralized error taxonomy for the routing core.
//!
//! Auth failures are connection-fatal, integrity failures drop the frame and
//! terminate the connection, validation/rate-limit failures produce an
//! in-band `error` frame but keep the connection alive. `status_code` /
//! `IntoResponse` only matter for the thin HTTP admission surface
//! (`/health`, the WS upgrade) — most of this type is consumed inside the
//! gateway, never serialized to HTTP.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Core application error type used across the routing core.
#[derive(Debug, thiserror::Error)]
pub enum UmbraError {
    // === AuthFailure — fatal at the connection level (close 1008) ===
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("token expired")]
    TokenExpired,

    #[error("token revoked")]
    TokenRevoked,

    #[error("unknown device")]
    UnknownDevice,

    // === IntegrityFailure — frame dropped, connection terminated, audited ===
    #[error("missing signature or nonce")]
    MissingAuthFields,

    #[error("signature verification failed")]
    BadSignature,

    #[error("nonce already seen (replay)")]
    ReplayedNonce,

    #[error("frame timestamp outside the allowed skew window")]
    StaleTimestamp,

    // === ValidationFailure — in-band `error` frame, connection survives ===
    #[error("unknown frame type: {0}")]
    UnknownFrameType(String),

    #[error("frame missing required target (receiver_id or group_id)")]
    MissingTarget,

    #[error("frame exceeds the maximum size of {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("validation failed: {message}")]
    Validation { message: String },

    // === RateLimited — in-band `error` frame, connection survives ===
    #[error("rate limited")]
    RateLimited,

    // === Backpressure — outbound frame silently dropped, connection reaped ===
    #[error("send queue saturated")]
    Backpressure,

    // === PersistenceFailure ===
    #[error("failed to save message")]
    PersistenceFailure,

    // === RoutingFailure (recipient unknown / blocked / inactive) ===
    #[error("recipient unavailable: {reason}")]
    RoutingFailure { reason: String },

    // === ShutdownInProgress ===
    #[error("server is shutting down")]
    ShutdownInProgress,

    // === Infrastructure ===
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("cache error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// JSON error response body sent over HTTP (health/admission surface only).
#[derive(Serialize)]
struct ErrorResponse {
    code: u16,
    error: String,
    message: String,
}

impl UmbraError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthenticated
            | Self::TokenExpired
            | Self::TokenRevoked
            | Self::UnknownDevice => StatusCode::UNAUTHORIZED,
            Self::MissingAuthFields
            | Self::BadSignature
            | Self::ReplayedNonce
            | Self::StaleTimestamp => StatusCode::BAD_REQUEST,
            Self::UnknownFrameType(_) | Self::MissingTarget | Self::Validation { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::FrameTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Backpressure => StatusCode::SERVICE_UNAVAILABLE,
            Self::PersistenceFailure => StatusCode::INTERNAL_SERVER_ERROR,
            Self::RoutingFailure { .. } => StatusCode::BAD_REQUEST,
            Self::ShutdownInProgress => StatusCode::SERVICE_UNAVAILABLE,
            Self::Database(_) | Self::Redis(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn error_code(&self) -> &str {
        match self {
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::TokenRevoked => "TOKEN_REVOKED",
            Self::UnknownDevice => "UNKNOWN_DEVICE",
            Self::MissingAuthFields => "MISSING_AUTH_FIELDS",
            Self::BadSignature => "BAD_SIGNATURE",
            Self::ReplayedNonce => "REPLAYED_NONCE",
            Self::StaleTimestamp => "STALE_TIMESTAMP",
            Self::UnknownFrameType(_) => "UNKNOWN_FRAME_TYPE",
            Self::MissingTarget => "MISSING_TARGET",
            Self::FrameTooLarge { .. } => "FRAME_TOO_LARGE",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::RateLimited => "RATE_LIMITED",
            Self::Backpressure => "BACKPRESSURE",
            Self::PersistenceFailure => "PERSISTENCE_FAILURE",
            Self::RoutingFailure { .. } => "ROUTING_FAILURE",
            Self::ShutdownInProgress => "SHUTDOWN_IN_PROGRESS",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Redis(_) => "CACHE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Is this error one that should be surfaced to the client as an
    /// in-band `error` frame without closing the connection?
    pub fn is_client_visible(&self) -> bool {
        matches!(
            self,
            Self::UnknownFrameType(_)
                | Self::MissingTarget
                | Self::Validation { .. }
                | Self::RateLimited
                | Self::PersistenceFailure
                | Self::RoutingFailure { .. }
        )
    }

    /// Short human-readable message safe to send to a client in an `error` frame.
    pub fn client_message(&self) -> String {
        match self {
            Self::PersistenceFailure => "Failed to save message".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for UmbraError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let message = match &self {
            UmbraError::Database(e) => {
                tracing::error!(error = %e, "database error");
                "An internal error occurred".to_string()
            }
            UmbraError::Redis(e) => {
                tracing::error!(error = %e, "cache error");
                "An internal error occurred".to_string()
            }
            UmbraError::Internal(e) => {
                tracing::error!(error = %e, "internal error");
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorResponse {
            code: status.as_u16(),
            error: self.error_code().to_string(),
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Convenience type alias for Results using [`UmbraError`].
pub type UmbraResult<T> = Result<T, UmbraError>;
