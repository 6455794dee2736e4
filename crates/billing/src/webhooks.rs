//! Stripe webhook reconciliation
//!
//! Signature verification happens at the HTTP boundary (fail closed, no
//! retry); verified events are recorded in an idempotency ledger and
//! enqueued. Domain processing runs in the worker and is tolerant of
//! duplicate and out-of-order delivery: the ledger absorbs duplicates, the
//! per-subscription ordering guard absorbs reordering.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::email::BillingEmailService;
use crate::error::{BillingError, BillingResult};
use crate::events::{EventKind, InvoicePayload, WebhookEvent};
use crate::events_log::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::notifications::{NotificationContext, NotificationKind, NotificationService};
use crate::subscriptions::{SubscriptionStatus, SubscriptionStore, NOTIFICATION_DEDUP_HOURS};

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted skew between the signature timestamp and our clock.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Verify a `t=timestamp,v1=signature` header against the raw body.
///
/// `now_unix` is injected so the check is deterministic under test; the
/// handler passes the wall clock.
pub fn verify_signature_with_clock(
    webhook_secret: &str,
    payload: &str,
    signature: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in signature.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::error!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    let v1_signature = v1_signature.ok_or_else(|| {
        tracing::error!("Missing v1 signature in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::error!(
            timestamp = timestamp,
            now = now_unix,
            diff = (now_unix - timestamp).abs(),
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    // The secret starts with "whsec_"; the remainder is the signing key
    let secret_key = webhook_secret
        .strip_prefix("whsec_")
        .unwrap_or(webhook_secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).map_err(|_| {
        tracing::error!("Invalid webhook secret key");
        BillingError::WebhookSignatureInvalid
    })?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::error!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Webhook reconciler for Stripe events.
#[derive(Clone)]
pub struct WebhookHandler {
    pool: PgPool,
    webhook_secret: String,
    store: SubscriptionStore,
    notifications: NotificationService,
    event_logger: BillingEventLogger,
}

impl WebhookHandler {
    pub fn new(stripe: &StripeClient, pool: PgPool, email: BillingEmailService) -> Self {
        let store = SubscriptionStore::new(pool.clone());
        let notifications = NotificationService::new(pool.clone(), email);
        let event_logger = BillingEventLogger::new(pool.clone());
        Self {
            pool,
            webhook_secret: stripe.config().webhook_secret.clone(),
            store,
            notifications,
            event_logger,
        }
    }

    /// Verify the signature header for a raw payload. Security boundary:
    /// failures are final and must never be queued or retried.
    pub fn verify_signature(&self, payload: &str, signature: &str) -> BillingResult<()> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        verify_signature_with_clock(&self.webhook_secret, payload, signature, now)
    }

    /// Record the event in the idempotency ledger. Returns false when the
    /// event id was seen before — the caller acks without re-enqueueing.
    pub async fn record_event(&self, event: &WebhookEvent) -> BillingResult<bool> {
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (id, stripe_event_id, event_type, event_timestamp, processing_result)
            VALUES ($1, $2, $3, $4, 'received')
            ON CONFLICT (stripe_event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&event.id)
        .bind(event.kind.as_str())
        .bind(event.created)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_none() {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.kind.as_str(),
                "Duplicate webhook event, ignoring"
            );
        }

        Ok(inserted.is_some())
    }

    /// Update the ledger with the outcome of processing.
    pub async fn mark_event_result(
        &self,
        stripe_event_id: &str,
        result: &str,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET processing_result = $2, error_message = $3
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(stripe_event_id)
        .bind(result)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Apply a verified event to the domain. Called from the worker with
    /// retry/backoff around it.
    pub async fn process_event(&self, event: &WebhookEvent) -> BillingResult<()> {
        match &event.kind {
            EventKind::SubscriptionCreated => self.handle_subscription_created(event).await,
            EventKind::SubscriptionUpdated => self.handle_subscription_updated(event).await,
            EventKind::SubscriptionDeleted => self.handle_subscription_deleted(event).await,
            EventKind::TrialWillEnd => self.handle_trial_will_end(event).await,
            EventKind::InvoicePaymentSucceeded => self.handle_invoice_paid(event).await,
            EventKind::InvoicePaymentFailed => self.handle_invoice_payment_failed(event).await,
            EventKind::Unknown(event_type) => {
                // Acknowledged, not an error: tracking these tells us which
                // handlers we may want next
                tracing::info!(
                    event_type = %event_type,
                    event_id = %event.id,
                    "Received unhandled Stripe event type - no handler configured"
                );
                Ok(())
            }
        }
    }

    async fn handle_subscription_created(&self, event: &WebhookEvent) -> BillingResult<()> {
        let payload = event.subscription()?;
        let user_id = self.resolve_user(&payload.customer_id).await?;

        let subscription = self
            .store
            .upsert_from_event(user_id, payload, event.created)
            .await?;

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(user_id, BillingEventType::SubscriptionCreated)
                    .data(serde_json::json!({
                        "status": subscription.status,
                        "price_id": subscription.stripe_price_id,
                    }))
                    .stripe_event(&event.id)
                    .stripe_subscription(payload.subscription_id.clone())
                    .actor_type(ActorType::Stripe),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log subscription created event");
        }

        if subscription.is_active() {
            let already = self
                .notifications
                .was_sent_within(
                    subscription.id,
                    NotificationKind::SubscriptionStarted,
                    Duration::hours(NOTIFICATION_DEDUP_HOURS),
                )
                .await?;
            if !already {
                self.notifications
                    .notify(
                        user_id,
                        NotificationKind::SubscriptionStarted,
                        NotificationContext {
                            subscription_id: Some(subscription.id),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
        }

        tracing::info!(
            user_id = %user_id,
            subscription_id = %payload.subscription_id,
            status = %subscription.status,
            "Subscription created"
        );

        Ok(())
    }

    async fn handle_subscription_updated(&self, event: &WebhookEvent) -> BillingResult<()> {
        let payload = event.subscription()?;
        let user_id = self.resolve_user(&payload.customer_id).await?;

        let subscription = self
            .store
            .upsert_from_event(user_id, payload, event.created)
            .await?;

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(user_id, BillingEventType::SubscriptionUpdated)
                    .data(serde_json::json!({
                        "status": subscription.status,
                        "cancel_at_period_end": subscription.cancel_at_period_end,
                    }))
                    .stripe_event(&event.id)
                    .stripe_subscription(payload.subscription_id.clone())
                    .actor_type(ActorType::Stripe),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log subscription updated event");
        }

        if subscription.status == SubscriptionStatus::PastDue {
            tracing::warn!(
                user_id = %user_id,
                subscription_id = %payload.subscription_id,
                "Subscription is past due"
            );
            self.notify_payment_failed(user_id, subscription.id).await?;
        }

        tracing::info!(
            user_id = %user_id,
            subscription_id = %payload.subscription_id,
            status = %subscription.status,
            "Subscription updated"
        );

        Ok(())
    }

    async fn handle_subscription_deleted(&self, event: &WebhookEvent) -> BillingResult<()> {
        let payload = event.subscription()?;
        let user_id = self.resolve_user(&payload.customer_id).await?;

        let subscription = self
            .store
            .upsert_from_event(user_id, payload, event.created)
            .await?;

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(user_id, BillingEventType::SubscriptionCanceled)
                    .data(serde_json::json!({
                        "period_end": subscription.current_period_end,
                    }))
                    .stripe_event(&event.id)
                    .stripe_subscription(payload.subscription_id.clone())
                    .actor_type(ActorType::Stripe),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log subscription deleted event");
        }

        let already = self
            .notifications
            .was_sent_within(
                subscription.id,
                NotificationKind::SubscriptionCanceled,
                Duration::hours(NOTIFICATION_DEDUP_HOURS),
            )
            .await?;
        if !already {
            let end_date = subscription
                .current_period_end
                .map(|dt| dt.date().to_string())
                .unwrap_or_else(|| "soon".to_string());
            self.notifications
                .notify(
                    user_id,
                    NotificationKind::SubscriptionCanceled,
                    NotificationContext {
                        subscription_id: Some(subscription.id),
                        end_date: Some(end_date),
                        ..Default::default()
                    },
                )
                .await?;
        }

        tracing::info!(
            user_id = %user_id,
            subscription_id = %payload.subscription_id,
            "Subscription cancelled"
        );

        Ok(())
    }

    async fn handle_trial_will_end(&self, event: &WebhookEvent) -> BillingResult<()> {
        let payload = event.subscription()?;
        let user_id = self.resolve_user(&payload.customer_id).await?;

        let subscription = self
            .store
            .upsert_from_event(user_id, payload, event.created)
            .await?;

        // Stripe fires this 3 days before trial end
        let days_remaining = payload
            .trial_end
            .map(|end| {
                let now = OffsetDateTime::now_utc();
                ((end - now).whole_days()).max(1)
            })
            .unwrap_or(3);

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(user_id, BillingEventType::TrialEnding)
                    .data(serde_json::json!({
                        "trial_end": payload.trial_end,
                        "days_remaining": days_remaining,
                    }))
                    .stripe_event(&event.id)
                    .stripe_subscription(payload.subscription_id.clone())
                    .actor_type(ActorType::Stripe),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log trial ending event");
        }

        let already = self
            .notifications
            .was_sent_within(
                subscription.id,
                NotificationKind::TrialEnding,
                Duration::hours(NOTIFICATION_DEDUP_HOURS),
            )
            .await?;
        if !already {
            self.notifications
                .notify(
                    user_id,
                    NotificationKind::TrialEnding,
                    NotificationContext {
                        subscription_id: Some(subscription.id),
                        days_remaining: Some(days_remaining),
                        ..Default::default()
                    },
                )
                .await?;
        }

        Ok(())
    }

    async fn handle_invoice_paid(&self, event: &WebhookEvent) -> BillingResult<()> {
        let invoice = event.invoice()?;
        let user_id = self.resolve_user(&invoice.customer_id).await?;

        self.store_invoice(user_id, invoice).await?;

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(user_id, BillingEventType::InvoicePaid)
                    .data(serde_json::json!({
                        "amount_paid_cents": invoice.amount_paid_cents,
                        "currency": invoice.currency,
                    }))
                    .stripe_event(&event.id)
                    .stripe_invoice(&invoice.invoice_id)
                    .actor_type(ActorType::Stripe),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log invoice paid event");
        }

        tracing::info!(
            user_id = %user_id,
            invoice_id = %invoice.invoice_id,
            amount = invoice.amount_paid_cents,
            "Invoice paid"
        );

        Ok(())
    }

    async fn handle_invoice_payment_failed(&self, event: &WebhookEvent) -> BillingResult<()> {
        let invoice = event.invoice()?;
        let user_id = self.resolve_user(&invoice.customer_id).await?;

        self.store_invoice(user_id, invoice).await?;

        // Drive the payment-failure transition locally; the matching
        // subscription.updated event may be delayed or lost.
        let marked = match &invoice.subscription_id {
            Some(sub_id) => self.store.mark_past_due(sub_id, event.created).await?,
            None => None,
        };

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(user_id, BillingEventType::InvoiceFailed)
                    .data(serde_json::json!({
                        "amount_due_cents": invoice.amount_due_cents,
                        "transitioned_past_due": marked.is_some(),
                    }))
                    .stripe_event(&event.id)
                    .stripe_invoice(&invoice.invoice_id)
                    .actor_type(ActorType::Stripe),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log invoice failed event");
        }

        let subscription = match marked {
            Some(sub) => Some(sub),
            None => match &invoice.subscription_id {
                Some(sub_id) => self.store.find_by_stripe_id(sub_id).await?,
                None => None,
            },
        };

        if let Some(sub) = subscription {
            self.notify_payment_failed(user_id, sub.id).await?;
        }

        tracing::warn!(
            user_id = %user_id,
            invoice_id = %invoice.invoice_id,
            amount_due = invoice.amount_due_cents,
            "Invoice payment failed"
        );

        Ok(())
    }

    async fn notify_payment_failed(
        &self,
        user_id: Uuid,
        subscription_id: Uuid,
    ) -> BillingResult<()> {
        let already = self
            .notifications
            .was_sent_within(
                subscription_id,
                NotificationKind::PaymentFailed,
                Duration::hours(NOTIFICATION_DEDUP_HOURS),
            )
            .await?;
        if already {
            return Ok(());
        }

        self.notifications
            .notify(
                user_id,
                NotificationKind::PaymentFailed,
                NotificationContext {
                    subscription_id: Some(subscription_id),
                    ..Default::default()
                },
            )
            .await
    }

    /// Map a provider customer id to a local user. Missing users are a
    /// retryable inconsistency: the user row may land via another path
    /// moments later.
    async fn resolve_user(&self, stripe_customer_id: &str) -> BillingResult<Uuid> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM users WHERE stripe_customer_id = $1")
                .bind(stripe_customer_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(id,)| id)
            .ok_or_else(|| BillingError::CustomerNotFound(stripe_customer_id.to_string()))
    }

    /// Upsert an invoice row keyed on the external invoice id. Replays only
    /// correct the status; nothing else mutates after creation.
    async fn store_invoice(&self, user_id: Uuid, invoice: &InvoicePayload) -> BillingResult<Uuid> {
        let status = match invoice.status.as_str() {
            s @ ("draft" | "open" | "paid" | "void" | "uncollectible") => s,
            other => {
                tracing::warn!(
                    invoice_id = %invoice.invoice_id,
                    status = %other,
                    "Unknown invoice status, storing as open"
                );
                "open"
            }
        };

        let subscription_id: Option<Uuid> = match &invoice.subscription_id {
            Some(sub_id) => {
                sqlx::query_as::<_, (Uuid,)>(
                    "SELECT id FROM subscriptions WHERE stripe_subscription_id = $1",
                )
                .bind(sub_id)
                .fetch_optional(&self.pool)
                .await?
                .map(|(id,)| id)
            }
            None => None,
        };

        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO invoices (
                id, user_id, subscription_id, stripe_invoice_id,
                amount_paid_cents, amount_due_cents, currency, status,
                hosted_invoice_url, invoice_pdf_url, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
            ON CONFLICT (stripe_invoice_id) DO UPDATE SET
                status = EXCLUDED.status,
                amount_paid_cents = EXCLUDED.amount_paid_cents
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(subscription_id)
        .bind(&invoice.invoice_id)
        .bind(invoice.amount_paid_cents)
        .bind(invoice.amount_due_cents)
        .bind(&invoice.currency)
        .bind(status)
        .bind(&invoice.hosted_invoice_url)
        .bind(&invoice.invoice_pdf_url)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test123secret456";
    const NOW: i64 = 1_717_000_000;

    fn sign(payload: &str, secret: &str, timestamp: i64) -> String {
        let key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let signed_payload = format!("{}.{}", timestamp, payload);
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
        mac.update(signed_payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn valid_signature_is_accepted() {
        let payload = r#"{"type":"customer.subscription.created"}"#;
        let sig = sign(payload, SECRET, NOW);
        let header = format!("t={},v1={}", NOW, sig);
        assert!(verify_signature_with_clock(SECRET, payload, &header, NOW).is_ok());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let payload = r#"{"type":"customer.subscription.created"}"#;
        let sig = sign(payload, "whsec_other", NOW);
        let header = format!("t={},v1={}", NOW, sig);
        assert!(matches!(
            verify_signature_with_clock(SECRET, payload, &header, NOW),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn modified_payload_is_rejected() {
        let payload = r#"{"type":"customer.subscription.created"}"#;
        let sig = sign(payload, SECRET, NOW);
        let header = format!("t={},v1={}", NOW, sig);
        let tampered = r#"{"type":"customer.subscription.deleted"}"#;
        assert!(verify_signature_with_clock(SECRET, tampered, &header, NOW).is_err());
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let payload = "{}";
        let stale = NOW - SIGNATURE_TOLERANCE_SECS - 1;
        let sig = sign(payload, SECRET, stale);
        let header = format!("t={},v1={}", stale, sig);
        assert!(verify_signature_with_clock(SECRET, payload, &header, NOW).is_err());

        // Right at the tolerance boundary still passes
        let edge = NOW - SIGNATURE_TOLERANCE_SECS;
        let sig = sign(payload, SECRET, edge);
        let header = format!("t={},v1={}", edge, sig);
        assert!(verify_signature_with_clock(SECRET, payload, &header, NOW).is_ok());
    }

    #[test]
    fn future_timestamp_is_rejected() {
        let payload = "{}";
        let future = NOW + SIGNATURE_TOLERANCE_SECS + 10;
        let sig = sign(payload, SECRET, future);
        let header = format!("t={},v1={}", future, sig);
        assert!(verify_signature_with_clock(SECRET, payload, &header, NOW).is_err());
    }

    #[test]
    fn malformed_header_is_rejected() {
        assert!(verify_signature_with_clock(SECRET, "{}", "", NOW).is_err());
        assert!(verify_signature_with_clock(SECRET, "{}", "t=abc,v1=", NOW).is_err());
        assert!(verify_signature_with_clock(SECRET, "{}", "v1=deadbeef", NOW).is_err());
        let header = format!("t={}", NOW);
        assert!(verify_signature_with_clock(SECRET, "{}", &header, NOW).is_err());
    }

    #[test]
    fn extra_header_fields_are_tolerated() {
        let payload = r#"{"id":"evt_1"}"#;
        let sig = sign(payload, SECRET, NOW);
        // Stripe sends v0 alongside v1; it must be ignored
        let header = format!("t={},v1={},v0=legacy", NOW, sig);
        assert!(verify_signature_with_clock(SECRET, payload, &header, NOW).is_ok());
    }
}
