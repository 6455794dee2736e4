//! Billing error type

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Malformed webhook payload: {0}")]
    InvalidPayload(String),

    #[error("No local customer for Stripe customer {0}")]
    CustomerNotFound(String),

    #[error("No subscription found for user {0}")]
    SubscriptionNotFound(uuid::Uuid),

    #[error("Unknown price id: {0}")]
    UnknownPrice(String),

    #[error("Email delivery failed: {0}")]
    EmailDelivery(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether queue processing should retry after this error.
    ///
    /// Security and validation failures are final (spec: reject, no retry).
    /// Missing local records are retryable: the record may appear moments
    /// later via another event.
    pub fn is_retryable(&self) -> bool {
        match self {
            BillingError::Database(_)
            | BillingError::StripeApi(_)
            | BillingError::CustomerNotFound(_)
            | BillingError::SubscriptionNotFound(_)
            | BillingError::Internal(_) => true,
            BillingError::Config(_)
            | BillingError::WebhookSignatureInvalid
            | BillingError::InvalidPayload(_)
            | BillingError::UnknownPrice(_)
            | BillingError::EmailDelivery(_) => false,
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::StripeApi(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_failures_are_not_retryable() {
        assert!(!BillingError::WebhookSignatureInvalid.is_retryable());
        assert!(!BillingError::InvalidPayload("bad json".into()).is_retryable());
    }

    #[test]
    fn missing_customer_is_retryable() {
        assert!(BillingError::CustomerNotFound("cus_123".into()).is_retryable());
        assert!(BillingError::Database("connection reset".into()).is_retryable());
    }
}
