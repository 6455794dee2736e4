//! Append-only billing audit log
//!
//! Every reconciler mutation leaves a row here. Logging failures are
//! reported to the caller but call sites treat them as non-fatal.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingEventType {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionCanceled,
    SubscriptionExpired,
    TrialEnding,
    InvoicePaid,
    InvoiceFailed,
    PlanChangeApplied,
    WebhookDeadLettered,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::SubscriptionCreated => "subscription_created",
            BillingEventType::SubscriptionUpdated => "subscription_updated",
            BillingEventType::SubscriptionCanceled => "subscription_canceled",
            BillingEventType::SubscriptionExpired => "subscription_expired",
            BillingEventType::TrialEnding => "trial_ending",
            BillingEventType::InvoicePaid => "invoice_paid",
            BillingEventType::InvoiceFailed => "invoice_failed",
            BillingEventType::PlanChangeApplied => "plan_change_applied",
            BillingEventType::WebhookDeadLettered => "webhook_dead_lettered",
        }
    }
}

/// Who caused the mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    Stripe,
    System,
    User,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::Stripe => "stripe",
            ActorType::System => "system",
            ActorType::User => "user",
        }
    }
}

/// Builder for a single audit row.
pub struct BillingEventBuilder {
    user_id: Option<Uuid>,
    event_type: BillingEventType,
    data: serde_json::Value,
    stripe_event_id: Option<String>,
    stripe_subscription_id: Option<String>,
    stripe_invoice_id: Option<String>,
    actor_type: ActorType,
}

impl BillingEventBuilder {
    pub fn new(user_id: Uuid, event_type: BillingEventType) -> Self {
        Self {
            user_id: Some(user_id),
            event_type,
            data: serde_json::json!({}),
            stripe_event_id: None,
            stripe_subscription_id: None,
            stripe_invoice_id: None,
            actor_type: ActorType::System,
        }
    }

    /// For events with no local user (e.g. dead-lettered payloads we could
    /// not attribute).
    pub fn unattributed(event_type: BillingEventType) -> Self {
        Self {
            user_id: None,
            event_type,
            data: serde_json::json!({}),
            stripe_event_id: None,
            stripe_subscription_id: None,
            stripe_invoice_id: None,
            actor_type: ActorType::System,
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn stripe_event(mut self, id: &str) -> Self {
        self.stripe_event_id = Some(id.to_string());
        self
    }

    pub fn stripe_subscription(mut self, id: impl Into<String>) -> Self {
        self.stripe_subscription_id = Some(id.into());
        self
    }

    pub fn stripe_invoice(mut self, id: &str) -> Self {
        self.stripe_invoice_id = Some(id.to_string());
        self
    }

    pub fn actor_type(mut self, actor: ActorType) -> Self {
        self.actor_type = actor;
        self
    }
}

#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn log_event(&self, event: BillingEventBuilder) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_events (
                id, user_id, event_type, data, stripe_event_id,
                stripe_subscription_id, stripe_invoice_id, actor_type, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.user_id)
        .bind(event.event_type.as_str())
        .bind(&event.data)
        .bind(&event.stripe_event_id)
        .bind(&event.stripe_subscription_id)
        .bind(&event.stripe_invoice_id)
        .bind(event.actor_type.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_references() {
        let event = BillingEventBuilder::new(Uuid::new_v4(), BillingEventType::InvoicePaid)
            .data(serde_json::json!({"amount_cents": 1499}))
            .stripe_event("evt_1")
            .stripe_invoice("in_1")
            .actor_type(ActorType::Stripe);

        assert_eq!(event.stripe_event_id.as_deref(), Some("evt_1"));
        assert_eq!(event.stripe_invoice_id.as_deref(), Some("in_1"));
        assert_eq!(event.actor_type, ActorType::Stripe);
        assert_eq!(event.event_type.as_str(), "invoice_paid");
    }
}
