//! Daily reconciliation against the billing provider
//!
//! Webhooks can be lost; a direct read of the provider's subscription
//! object is authoritative. Every non-terminal local record is re-fetched
//! (with bounded retries) and re-applied through the store, which keeps all
//! the ordering and invariant enforcement in one place.

use sqlx::PgPool;
use stripe::SubscriptionId;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::events::{SubscriptionItemPayload, SubscriptionPayload};
use crate::subscriptions::SubscriptionStore;

/// Outcome counts for one sync run.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncSummary {
    pub checked: usize,
    pub updated: usize,
    pub errors: usize,
}

/// Convert a provider subscription object into the store's payload shape.
pub fn payload_from_provider(sub: &stripe::Subscription) -> BillingResult<SubscriptionPayload> {
    let status = match sub.status {
        stripe::SubscriptionStatus::Active => "active",
        stripe::SubscriptionStatus::PastDue => "past_due",
        stripe::SubscriptionStatus::Canceled => "canceled",
        stripe::SubscriptionStatus::Unpaid => "unpaid",
        stripe::SubscriptionStatus::Trialing => "trialing",
        stripe::SubscriptionStatus::Incomplete => "incomplete",
        stripe::SubscriptionStatus::IncompleteExpired => "incomplete_expired",
        stripe::SubscriptionStatus::Paused => {
            return Err(BillingError::InvalidPayload(
                "paused subscriptions are not supported".to_string(),
            ))
        }
    };

    let customer_id = match &sub.customer {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(c) => c.id.to_string(),
    };

    let to_ts = |unix: i64| -> BillingResult<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp(unix)
            .map_err(|_| BillingError::InvalidPayload(format!("timestamp {} out of range", unix)))
    };

    let items: Vec<SubscriptionItemPayload> = sub
        .items
        .data
        .iter()
        .filter_map(|item| {
            item.price.as_ref().map(|price| SubscriptionItemPayload {
                item_id: item.id.to_string(),
                price_id: price.id.to_string(),
                quantity: item.quantity.unwrap_or(1) as i64,
            })
        })
        .collect();

    Ok(SubscriptionPayload {
        subscription_id: sub.id.to_string(),
        customer_id,
        status: status.to_string(),
        price_id: items.first().map(|i| i.price_id.clone()),
        items,
        current_period_start: Some(to_ts(sub.current_period_start)?),
        current_period_end: Some(to_ts(sub.current_period_end)?),
        trial_start: sub.trial_start.map(to_ts).transpose()?,
        trial_end: sub.trial_end.map(to_ts).transpose()?,
        cancel_at_period_end: sub.cancel_at_period_end,
        canceled_at: sub.canceled_at.map(to_ts).transpose()?,
    })
}

#[derive(Clone)]
pub struct SubscriptionSyncService {
    stripe: StripeClient,
    pool: PgPool,
    store: SubscriptionStore,
}

impl SubscriptionSyncService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let store = SubscriptionStore::new(pool.clone());
        Self { stripe, pool, store }
    }

    /// Reconcile every non-terminal subscription with the provider. Called
    /// daily by the worker; per-record failures are counted, logged, and
    /// skipped.
    pub async fn run(&self) -> BillingResult<SyncSummary> {
        let subscriptions: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT user_id, stripe_subscription_id
            FROM subscriptions
            WHERE status NOT IN ('canceled', 'expired')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut summary = SyncSummary {
            checked: subscriptions.len(),
            ..Default::default()
        };

        for (user_id, stripe_subscription_id) in subscriptions {
            match self.sync_one(user_id, &stripe_subscription_id).await {
                Ok(()) => summary.updated += 1,
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!(
                        subscription_id = %stripe_subscription_id,
                        error = %e,
                        "Subscription sync failed"
                    );
                }
            }
        }

        tracing::info!(
            checked = summary.checked,
            updated = summary.updated,
            errors = summary.errors,
            "Provider sync complete"
        );

        Ok(summary)
    }

    async fn sync_one(&self, user_id: Uuid, stripe_subscription_id: &str) -> BillingResult<()> {
        let sub_id: SubscriptionId = stripe_subscription_id
            .parse()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))?;

        // Transient provider errors get a short retry budget before this
        // record is counted as failed for the run
        let strategy = ExponentialBackoff::from_millis(500).map(jitter).take(3);
        let client = self.stripe.inner();
        let provider_sub = Retry::spawn(strategy, || async {
            stripe::Subscription::retrieve(client, &sub_id, &[]).await
        })
        .await?;

        let payload = payload_from_provider(&provider_sub)?;

        // A direct API read is authoritative at read time, so it outranks
        // any queued stale event
        self.store
            .upsert_from_event(user_id, &payload, OffsetDateTime::now_utc())
            .await?;

        Ok(())
    }
}
