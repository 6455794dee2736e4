//! Stripe webhook endpoint
//!
//! Verify, record, enqueue, ack. Domain mutation happens in the worker so
//! the response stays inside the provider's delivery timeout. 400 on
//! signature or shape failures (the provider should not retry those), 500
//! on storage errors (the provider retries).

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use examly_billing::{BillingError, WebhookEvent};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<serde_json::Value>, ApiError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Webhook request missing Stripe-Signature header");
            ApiError::BadRequest("Missing signature".to_string())
        })?;

    // Security boundary: a bad signature is abandoned immediately, never
    // queued or retried
    state
        .billing
        .webhooks
        .verify_signature(&body, signature)
        .map_err(|e| {
            tracing::warn!("Webhook signature verification failed");
            ApiError::from(e)
        })?;

    let event = WebhookEvent::parse(&body).map_err(|e| {
        if let BillingError::InvalidPayload(detail) = &e {
            tracing::warn!(detail = %detail, "Malformed webhook payload");
        }
        ApiError::from(e)
    })?;

    // Idempotency ledger: duplicates are acked without re-enqueueing
    let newly_recorded = state.billing.webhooks.record_event(&event).await?;
    if newly_recorded {
        state
            .billing
            .webhook_queue
            .enqueue(&event.id, event.kind.as_str(), &body)
            .await?;

        tracing::info!(
            event_id = %event.id,
            event_type = %event.kind.as_str(),
            "Webhook event enqueued"
        );
    }

    Ok(Json(serde_json::json!({ "received": true })))
}
