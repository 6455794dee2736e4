//! Route tree

pub mod billing;
pub mod usage;
pub mod webhook;

use axum::routing::{get, post};
use axum::{Json, Router};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Webhook: no session auth, verified by signature
        .route("/stripe/webhook", post(webhook::stripe_webhook))
        // Billing
        .route("/billing/subscription", get(billing::get_subscription))
        .route("/billing/checkout", post(billing::create_checkout))
        .route("/billing/portal", post(billing::create_portal))
        .route("/billing/cancel", post(billing::cancel_subscription))
        .route("/billing/resume", post(billing::resume_subscription))
        .route("/billing/plan-change", post(billing::schedule_plan_change))
        .route("/billing/invoices", get(billing::list_invoices))
        .route("/billing/usage", get(usage::usage_summary))
        // Request-time feature gate for the app servers
        .route("/features/{feature}/use", post(usage::consume_feature))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
