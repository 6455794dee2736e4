//! Billing endpoints

use axum::extract::State;
use axum::Json;
use examly_billing::{PlanDescriptor, Subscription};
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// What the frontend needs to render billing state.
#[derive(Debug, serde::Serialize)]
pub struct SubscriptionView {
    pub status: Option<examly_billing::SubscriptionStatus>,
    pub is_active: bool,
    pub on_grace_period: bool,
    pub has_expired: bool,
    pub cancel_at_period_end: bool,
    pub current_period_end: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub plan: Option<PlanDescriptor>,
}

impl SubscriptionView {
    fn from_subscription(state: &AppState, sub: Option<Subscription>) -> Self {
        match sub {
            Some(sub) => Self {
                is_active: sub.is_active(),
                on_grace_period: sub.on_grace_period(),
                has_expired: sub.has_expired(),
                cancel_at_period_end: sub.cancel_at_period_end,
                current_period_end: sub.current_period_end,
                trial_end: sub.trial_end,
                plan: sub
                    .stripe_price_id
                    .as_deref()
                    .and_then(|p| state.billing.catalog.resolve_plan(p)),
                status: Some(sub.status),
            },
            None => Self {
                status: None,
                is_active: false,
                on_grace_period: false,
                has_expired: false,
                cancel_at_period_end: false,
                current_period_end: None,
                trial_end: None,
                plan: None,
            },
        }
    }
}

pub async fn get_subscription(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<SubscriptionView>, ApiError> {
    let sub = state
        .billing
        .subscriptions
        .store()
        .current_for(user.id)
        .await?;

    Ok(Json(SubscriptionView::from_subscription(&state, sub)))
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    /// "monthly" or "annual"
    pub interval: String,
}

pub async fn create_checkout(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<CheckoutRequest>,
) -> Result<Json<examly_billing::CheckoutResponse>, ApiError> {
    let response = state
        .billing
        .checkout
        .create_premium_checkout(user.id, &req.interval)
        .await?;

    Ok(Json(response))
}

pub async fn create_portal(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<examly_billing::PortalResponse>, ApiError> {
    let response = state.billing.portal.create_portal_session(user.id).await?;
    Ok(Json(response))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<SubscriptionView>, ApiError> {
    let sub = state
        .billing
        .subscriptions
        .cancel_at_period_end(user.id)
        .await?;

    Ok(Json(SubscriptionView::from_subscription(&state, Some(sub))))
}

pub async fn resume_subscription(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<SubscriptionView>, ApiError> {
    let sub = state.billing.subscriptions.resume(user.id).await?;
    Ok(Json(SubscriptionView::from_subscription(&state, Some(sub))))
}

#[derive(Debug, Deserialize)]
pub struct PlanChangeRequest {
    pub tier: String,
    pub interval: String,
}

pub async fn schedule_plan_change(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<PlanChangeRequest>,
) -> Result<Json<examly_billing::ScheduledPlanChange>, ApiError> {
    let change = state
        .billing
        .subscriptions
        .schedule_plan_change(user.id, &req.tier, &req.interval)
        .await?;

    Ok(Json(change))
}

#[derive(Debug, serde::Serialize, sqlx::FromRow)]
pub struct InvoiceView {
    pub id: Uuid,
    pub stripe_invoice_id: String,
    pub amount_paid_cents: i64,
    pub amount_due_cents: i64,
    pub currency: String,
    pub status: String,
    pub hosted_invoice_url: Option<String>,
    pub invoice_pdf_url: Option<String>,
    pub created_at: OffsetDateTime,
}

pub async fn list_invoices(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<InvoiceView>>, ApiError> {
    let invoices: Vec<InvoiceView> = sqlx::query_as(
        r#"
        SELECT id, stripe_invoice_id, amount_paid_cents, amount_due_cents,
               currency, status, hosted_invoice_url, invoice_pdf_url, created_at
        FROM invoices
        WHERE user_id = $1
        ORDER BY created_at DESC
        LIMIT 100
        "#,
    )
    .bind(user.id)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(invoices))
}
