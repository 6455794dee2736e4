//! API error type
//!
//! End users never see billing internals. Detail goes to the operator log;
//! the response body carries a generic message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use examly_billing::BillingError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("daily limit reached")]
    LimitReached,

    #[error("internal error")]
    Internal(anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::LimitReached => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn user_message(&self) -> String {
        match self {
            ApiError::Unauthorized => "Authentication required".to_string(),
            ApiError::BadRequest(msg) => msg.clone(),
            ApiError::NotFound(msg) => msg.clone(),
            ApiError::LimitReached => {
                "Daily limit reached. Upgrade to Premium for unlimited access.".to_string()
            }
            ApiError::Internal(_) => {
                "Subscription error. Please try again or contact support.".to_string()
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(e) = &self {
            tracing::error!(error = ?e, "Internal API error");
        }

        let body = Json(serde_json::json!({
            "error": self.user_message(),
        }));

        (self.status(), body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::WebhookSignatureInvalid => {
                ApiError::BadRequest("Invalid signature".to_string())
            }
            BillingError::InvalidPayload(_) => {
                ApiError::BadRequest("Malformed payload".to_string())
            }
            BillingError::UnknownPrice(_) => {
                ApiError::BadRequest("Unknown plan".to_string())
            }
            BillingError::SubscriptionNotFound(_) => {
                ApiError::NotFound("No subscription found".to_string())
            }
            other => ApiError::Internal(anyhow::anyhow!(other)),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Internal(anyhow::anyhow!(e))
    }
}
