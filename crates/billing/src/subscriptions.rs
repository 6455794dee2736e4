//! Subscription record store and lifecycle management
//!
//! One row per provider subscription object ever created. Rows are never
//! deleted, only status-transitioned; a user's history stays queryable for
//! audit and invoice linkage. All time-based eligibility predicates live
//! here so the window constants are defined exactly once.

use sqlx::PgPool;
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use stripe::{SubscriptionId, UpdateSubscription, UpdateSubscriptionItems};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::events::SubscriptionPayload;

/// Days before `current_period_end` at which a scheduled cancellation
/// counts as "expiring soon".
pub const EXPIRING_WINDOW_DAYS: i64 = 3;

/// Trailing window within which a repeat notification of the same kind for
/// the same subscription is suppressed.
pub const NOTIFICATION_DEDUP_HOURS: i64 = 24;

/// Subscription lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    Trialing,
    Active,
    PastDue,
    Canceled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "incomplete" => Some(Self::Incomplete),
            "trialing" => Some(Self::Trialing),
            "active" => Some(Self::Active),
            "past_due" => Some(Self::PastDue),
            "canceled" => Some(Self::Canceled),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Map a provider status string onto our state set.
    ///
    /// Stripe's `unpaid` is a dunning dead-end we treat as past_due;
    /// `incomplete_expired` is a checkout that never completed, closed as
    /// canceled. Anything else is a payload we don't understand.
    pub fn from_provider(s: &str) -> BillingResult<Self> {
        match s {
            "unpaid" => Ok(Self::PastDue),
            "incomplete_expired" => Ok(Self::Canceled),
            other => Self::parse(other)
                .ok_or_else(|| BillingError::InvalidPayload(format!("status '{}'", other))),
        }
    }

    /// Terminal states admit no further transitions; a new provider
    /// subscription gets a brand-new record instead.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled | Self::Expired)
    }

    /// States that count toward the one-engaged-subscription-per-user
    /// invariant.
    pub fn is_engaged(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing | Self::PastDue)
    }

    /// Valid transitions. Identity transitions are always fine (field
    /// refresh from a newer event).
    pub fn can_transition_to(&self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        if *self == next {
            return true;
        }
        match (*self, next) {
            (Incomplete, Trialing | Active | Canceled) => true,
            (Trialing, Active | PastDue | Canceled | Expired) => true,
            (Active, PastDue | Canceled | Expired) => true,
            (PastDue, Active | Canceled | Expired) => true,
            _ => false,
        }
    }
}

impl TryFrom<String> for SubscriptionStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s).ok_or_else(|| format!("unknown subscription status '{}'", s))
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ordering guard: apply an event iff it is not older than the last one
/// applied to the record. Equal timestamps apply — replaying the newest
/// event is a field-level no-op.
pub fn should_apply(last_applied: Option<OffsetDateTime>, incoming: OffsetDateTime) -> bool {
    match last_applied {
        None => true,
        Some(last) => incoming >= last,
    }
}

/// A subscription record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub stripe_subscription_id: String,
    pub stripe_customer_id: String,
    pub stripe_price_id: Option<String>,
    pub pending_price_id: Option<String>,
    pub pending_effective_at: Option<OffsetDateTime>,
    #[sqlx(try_from = "String")]
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    pub last_event_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// Access-granting: active or inside a trial.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        )
    }

    /// Cancellation requested but the paid period has not ended yet.
    pub fn on_grace_period_at(&self, now: OffsetDateTime) -> bool {
        self.is_active()
            && self.cancel_at_period_end
            && self.current_period_end.map(|end| now < end).unwrap_or(false)
    }

    pub fn on_grace_period(&self) -> bool {
        self.on_grace_period_at(OffsetDateTime::now_utc())
    }

    pub fn has_expired_at(&self, now: OffsetDateTime) -> bool {
        if matches!(
            self.status,
            SubscriptionStatus::Canceled | SubscriptionStatus::Expired
        ) {
            return true;
        }
        self.current_period_end.map(|end| now >= end).unwrap_or(false)
    }

    pub fn has_expired(&self) -> bool {
        self.has_expired_at(OffsetDateTime::now_utc())
    }

    /// Scheduled to end within the expiring-soon window.
    pub fn expiring_soon_at(&self, now: OffsetDateTime) -> bool {
        if !self.is_active() || !self.cancel_at_period_end {
            return false;
        }
        match self.current_period_end {
            Some(end) => now < end && end <= now + Duration::days(EXPIRING_WINDOW_DAYS),
            None => false,
        }
    }
}

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, user_id, stripe_subscription_id, stripe_customer_id, stripe_price_id,
    pending_price_id, pending_effective_at, status,
    current_period_start, current_period_end, trial_start, trial_end,
    cancel_at_period_end, canceled_at, last_event_at, created_at, updated_at
"#;

/// Durable store for subscription records. All writes hold a per-row lock
/// so webhook processing and the sweeper cannot race into an inconsistent
/// final state.
#[derive(Clone)]
pub struct SubscriptionStore {
    pool: PgPool,
}

impl SubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply a provider subscription object to the local record, keyed on
    /// the external subscription id.
    ///
    /// Idempotent: replaying the same event (or an older one, by provider
    /// timestamp) never regresses fields set by a newer event. Terminal
    /// records are immutable. Creating or refreshing an engaged record
    /// closes any other engaged record the user still has.
    pub async fn upsert_from_event(
        &self,
        user_id: Uuid,
        payload: &SubscriptionPayload,
        event_at: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let status = SubscriptionStatus::from_provider(&payload.status)?;

        let mut tx = self.pool.begin().await?;

        let existing: Option<Subscription> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE stripe_subscription_id = $1 FOR UPDATE",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(&payload.subscription_id)
        .fetch_optional(&mut *tx)
        .await?;

        let subscription: Subscription = match existing {
            Some(current) => {
                if !should_apply(current.last_event_at, event_at) {
                    tracing::info!(
                        subscription_id = %payload.subscription_id,
                        last_event_at = ?current.last_event_at,
                        event_at = %event_at,
                        "Ignoring stale subscription event"
                    );
                    tx.commit().await?;
                    return Ok(current);
                }

                if current.status.is_terminal() && status != current.status {
                    tracing::info!(
                        subscription_id = %payload.subscription_id,
                        current_status = %current.status,
                        incoming_status = %status,
                        "Ignoring event against terminal subscription"
                    );
                    tx.commit().await?;
                    return Ok(current);
                }

                if !current.status.can_transition_to(status) {
                    // The provider is the system of record; intermediate
                    // events may have been lost. Apply, but leave a trace.
                    tracing::warn!(
                        subscription_id = %payload.subscription_id,
                        from = %current.status,
                        to = %status,
                        "Out-of-table status transition applied from provider event"
                    );
                }

                sqlx::query_as(&format!(
                    r#"
                    UPDATE subscriptions SET
                        stripe_customer_id = $2,
                        stripe_price_id = $3,
                        status = $4,
                        current_period_start = $5,
                        current_period_end = $6,
                        trial_start = $7,
                        trial_end = $8,
                        cancel_at_period_end = $9,
                        canceled_at = $10,
                        last_event_at = $11,
                        updated_at = NOW()
                    WHERE id = $1
                    RETURNING {}
                    "#,
                    SUBSCRIPTION_COLUMNS
                ))
                .bind(current.id)
                .bind(&payload.customer_id)
                .bind(&payload.price_id)
                .bind(status.as_str())
                .bind(payload.current_period_start)
                .bind(payload.current_period_end)
                .bind(payload.trial_start)
                .bind(payload.trial_end)
                .bind(payload.cancel_at_period_end)
                .bind(payload.canceled_at)
                .bind(event_at)
                .fetch_one(&mut *tx)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    r#"
                    INSERT INTO subscriptions (
                        id, user_id, stripe_subscription_id, stripe_customer_id,
                        stripe_price_id, status, current_period_start,
                        current_period_end, trial_start, trial_end,
                        cancel_at_period_end, canceled_at, last_event_at,
                        created_at, updated_at
                    ) VALUES (
                        $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                        NOW(), NOW()
                    )
                    RETURNING {}
                    "#,
                    SUBSCRIPTION_COLUMNS
                ))
                .bind(Uuid::new_v4())
                .bind(user_id)
                .bind(&payload.subscription_id)
                .bind(&payload.customer_id)
                .bind(&payload.price_id)
                .bind(status.as_str())
                .bind(payload.current_period_start)
                .bind(payload.current_period_end)
                .bind(payload.trial_start)
                .bind(payload.trial_end)
                .bind(payload.cancel_at_period_end)
                .bind(payload.canceled_at)
                .bind(event_at)
                .fetch_one(&mut *tx)
                .await?
            }
        };

        if subscription.status.is_engaged() {
            let superseded = sqlx::query(
                r#"
                UPDATE subscriptions
                SET status = 'canceled', canceled_at = NOW(), updated_at = NOW()
                WHERE user_id = $1
                  AND id <> $2
                  AND status IN ('active', 'trialing', 'past_due')
                "#,
            )
            .bind(user_id)
            .bind(subscription.id)
            .execute(&mut *tx)
            .await?;

            if superseded.rows_affected() > 0 {
                tracing::info!(
                    user_id = %user_id,
                    subscription_id = %subscription.stripe_subscription_id,
                    superseded = superseded.rows_affected(),
                    "Closed prior engaged subscriptions for user"
                );
            }
        }

        // Replace line items with the provider's current set
        sqlx::query("DELETE FROM subscription_items WHERE subscription_id = $1")
            .bind(subscription.id)
            .execute(&mut *tx)
            .await?;

        for item in &payload.items {
            sqlx::query(
                r#"
                INSERT INTO subscription_items
                    (id, subscription_id, stripe_item_id, stripe_price_id, quantity)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(subscription.id)
            .bind(&item.item_id)
            .bind(&item.price_id)
            .bind(item.quantity)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(subscription)
    }

    /// Guarded payment-failure transition: active/trialing -> past_due,
    /// respecting the ordering guard. Returns None when nothing matched
    /// (already past_due, terminal, or a newer event got there first).
    pub async fn mark_past_due(
        &self,
        stripe_subscription_id: &str,
        event_at: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>> {
        let updated: Option<Subscription> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions
            SET status = 'past_due', last_event_at = $2, updated_at = NOW()
            WHERE stripe_subscription_id = $1
              AND status IN ('active', 'trialing')
              AND (last_event_at IS NULL OR last_event_at <= $2)
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(stripe_subscription_id)
        .bind(event_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(updated)
    }

    pub async fn find_by_stripe_id(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let sub: Option<Subscription> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE stripe_subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(sub)
    }

    /// The user's current subscription: the engaged record if one exists,
    /// otherwise the most recent one.
    pub async fn current_for(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let sub: Option<Subscription> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE user_id = $1
            ORDER BY (status IN ('active', 'trialing')) DESC,
                     (status = 'past_due') DESC,
                     created_at DESC
            LIMIT 1
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(sub)
    }

    /// Whether the user currently has premium access.
    pub async fn has_active_subscription(&self, user_id: Uuid) -> BillingResult<bool> {
        let row: Option<(i32,)> = sqlx::query_as(
            r#"
            SELECT 1 FROM subscriptions
            WHERE user_id = $1 AND status IN ('active', 'trialing')
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }
}

/// Information about a scheduled plan change.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScheduledPlanChange {
    pub current_price_id: Option<String>,
    pub new_price_id: String,
    pub effective_at: OffsetDateTime,
}

/// User-facing subscription operations that talk to the provider.
#[derive(Clone)]
pub struct SubscriptionService {
    stripe: StripeClient,
    pool: PgPool,
    store: SubscriptionStore,
}

impl SubscriptionService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let store = SubscriptionStore::new(pool.clone());
        Self { stripe, pool, store }
    }

    pub fn store(&self) -> &SubscriptionStore {
        &self.store
    }

    async fn current_engaged(&self, user_id: Uuid) -> BillingResult<Subscription> {
        let sub = self
            .store
            .current_for(user_id)
            .await?
            .filter(|s| s.status.is_engaged())
            .ok_or(BillingError::SubscriptionNotFound(user_id))?;
        Ok(sub)
    }

    /// Request cancellation at period end. Access continues through the
    /// grace period; the webhook confirms the flag, the sweeper notifies.
    pub async fn cancel_at_period_end(&self, user_id: Uuid) -> BillingResult<Subscription> {
        let sub = self.current_engaged(user_id).await?;

        let sub_id: SubscriptionId = sub
            .stripe_subscription_id
            .parse()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))?;

        let params = UpdateSubscription {
            cancel_at_period_end: Some(true),
            ..Default::default()
        };
        stripe::Subscription::update(self.stripe.inner(), &sub_id, params).await?;

        sqlx::query(
            "UPDATE subscriptions SET cancel_at_period_end = TRUE, updated_at = NOW() WHERE id = $1",
        )
        .bind(sub.id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %sub.stripe_subscription_id,
            period_end = ?sub.current_period_end,
            "Subscription set to cancel at period end"
        );

        self.store
            .find_by_stripe_id(&sub.stripe_subscription_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(user_id))
    }

    /// Undo a scheduled cancellation while still inside the grace period.
    pub async fn resume(&self, user_id: Uuid) -> BillingResult<Subscription> {
        let sub = self.current_engaged(user_id).await?;

        if !sub.on_grace_period() {
            return Err(BillingError::Internal(
                "subscription is not on a grace period".to_string(),
            ));
        }

        let sub_id: SubscriptionId = sub
            .stripe_subscription_id
            .parse()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))?;

        let params = UpdateSubscription {
            cancel_at_period_end: Some(false),
            ..Default::default()
        };
        stripe::Subscription::update(self.stripe.inner(), &sub_id, params).await?;

        sqlx::query(
            "UPDATE subscriptions SET cancel_at_period_end = FALSE, updated_at = NOW() WHERE id = $1",
        )
        .bind(sub.id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %sub.stripe_subscription_id,
            "Subscription resumed during grace period"
        );

        self.store
            .find_by_stripe_id(&sub.stripe_subscription_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(user_id))
    }

    /// Schedule a plan change to take effect at the end of the current
    /// billing period. The hourly worker job applies due changes.
    pub async fn schedule_plan_change(
        &self,
        user_id: Uuid,
        tier: &str,
        interval: &str,
    ) -> BillingResult<ScheduledPlanChange> {
        let price_id = self
            .stripe
            .config()
            .price_id_for(tier, interval)
            .ok_or_else(|| BillingError::UnknownPrice(format!("{}/{}", tier, interval)))?
            .to_string();

        let sub = self.current_engaged(user_id).await?;

        if sub.stripe_price_id.as_deref() == Some(price_id.as_str()) {
            return Err(BillingError::Internal(
                "subscription is already on that plan".to_string(),
            ));
        }

        let effective_at = sub.current_period_end.ok_or_else(|| {
            BillingError::Internal("subscription has no current period end".to_string())
        })?;

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET pending_price_id = $2, pending_effective_at = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(sub.id)
        .bind(&price_id)
        .bind(effective_at)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %sub.stripe_subscription_id,
            new_price_id = %price_id,
            effective_at = %effective_at,
            "Plan change scheduled for period end"
        );

        Ok(ScheduledPlanChange {
            current_price_id: sub.stripe_price_id,
            new_price_id: price_id,
            effective_at,
        })
    }

    /// Apply every scheduled plan change whose effective time has passed.
    /// Called hourly by the worker. Per-record failures are logged and do
    /// not abort the batch.
    pub async fn process_due_plan_changes(&self) -> BillingResult<u64> {
        let due: Vec<(Uuid, String, String)> = sqlx::query_as(
            r#"
            SELECT id, stripe_subscription_id, pending_price_id
            FROM subscriptions
            WHERE pending_price_id IS NOT NULL
              AND pending_effective_at <= NOW()
              AND status IN ('active', 'trialing', 'past_due')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut applied = 0u64;

        for (id, stripe_subscription_id, new_price_id) in due {
            match self
                .apply_plan_change(id, &stripe_subscription_id, &new_price_id)
                .await
            {
                Ok(()) => applied += 1,
                Err(e) => {
                    tracing::error!(
                        subscription_id = %stripe_subscription_id,
                        new_price_id = %new_price_id,
                        error = %e,
                        "Failed to apply scheduled plan change"
                    );
                }
            }
        }

        Ok(applied)
    }

    async fn apply_plan_change(
        &self,
        id: Uuid,
        stripe_subscription_id: &str,
        new_price_id: &str,
    ) -> BillingResult<()> {
        let sub_id: SubscriptionId = stripe_subscription_id
            .parse()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))?;

        let current = stripe::Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;

        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| BillingError::Internal("No subscription items found".to_string()))?;

        let params = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(item_id),
                price: Some(new_price_id.to_string()),
                ..Default::default()
            }]),
            // The change was scheduled for the period boundary; nothing to
            // prorate.
            proration_behavior: Some(SubscriptionProrationBehavior::None),
            ..Default::default()
        };

        stripe::Subscription::update(self.stripe.inner(), &sub_id, params).await?;

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET stripe_price_id = $2,
                pending_price_id = NULL,
                pending_effective_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(new_price_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            subscription_id = %stripe_subscription_id,
            new_price_id = %new_price_id,
            "Scheduled plan change applied"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn subscription(status: SubscriptionStatus) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            stripe_subscription_id: "sub_test".into(),
            stripe_customer_id: "cus_test".into(),
            stripe_price_id: Some("price_pm".into()),
            pending_price_id: None,
            pending_effective_at: None,
            status,
            current_period_start: Some(datetime!(2026-01-01 00:00 UTC)),
            current_period_end: Some(datetime!(2026-02-01 00:00 UTC)),
            trial_start: None,
            trial_end: None,
            cancel_at_period_end: false,
            canceled_at: None,
            last_event_at: None,
            created_at: datetime!(2026-01-01 00:00 UTC),
            updated_at: datetime!(2026-01-01 00:00 UTC),
        }
    }

    #[test]
    fn ordering_guard_rejects_older_events() {
        let newer = datetime!(2026-01-02 00:00 UTC);
        let older = datetime!(2026-01-01 00:00 UTC);
        assert!(should_apply(None, older));
        assert!(should_apply(Some(older), newer));
        assert!(!should_apply(Some(newer), older));
        // Equal timestamps re-apply (idempotent)
        assert!(should_apply(Some(newer), newer));
    }

    #[test]
    fn terminal_states_admit_no_transitions() {
        use SubscriptionStatus::*;
        for next in [Incomplete, Trialing, Active, PastDue] {
            assert!(!Canceled.can_transition_to(next));
            assert!(!Expired.can_transition_to(next));
        }
        // Identity holds even for terminal states
        assert!(Canceled.can_transition_to(Canceled));
    }

    #[test]
    fn payment_failure_and_recovery_transitions() {
        use SubscriptionStatus::*;
        assert!(Active.can_transition_to(PastDue));
        assert!(PastDue.can_transition_to(Active));
        assert!(Trialing.can_transition_to(PastDue));
        assert!(!Incomplete.can_transition_to(PastDue));
    }

    #[test]
    fn engaged_states_can_expire() {
        use SubscriptionStatus::*;
        assert!(Active.can_transition_to(Expired));
        assert!(Trialing.can_transition_to(Expired));
        assert!(PastDue.can_transition_to(Expired));
        assert!(!Incomplete.can_transition_to(Expired));
    }

    #[test]
    fn provider_status_mapping() {
        assert_eq!(
            SubscriptionStatus::from_provider("unpaid").unwrap(),
            SubscriptionStatus::PastDue
        );
        assert_eq!(
            SubscriptionStatus::from_provider("incomplete_expired").unwrap(),
            SubscriptionStatus::Canceled
        );
        assert!(SubscriptionStatus::from_provider("paused").is_err());
    }

    #[test]
    fn grace_period_reports_active() {
        let mut sub = subscription(SubscriptionStatus::Active);
        sub.cancel_at_period_end = true;
        // 5 days before period end
        let now = datetime!(2026-01-27 00:00 UTC);
        assert!(sub.is_active());
        assert!(sub.on_grace_period_at(now));
        assert!(!sub.has_expired_at(now));
    }

    #[test]
    fn grace_period_ends_at_period_end() {
        let mut sub = subscription(SubscriptionStatus::Active);
        sub.cancel_at_period_end = true;
        let at_end = datetime!(2026-02-01 00:00 UTC);
        assert!(!sub.on_grace_period_at(at_end));
        assert!(sub.has_expired_at(at_end));
    }

    #[test]
    fn canceled_subscription_has_expired_regardless_of_period() {
        let sub = subscription(SubscriptionStatus::Canceled);
        let now = datetime!(2026-01-15 00:00 UTC);
        assert!(sub.has_expired_at(now));
        assert!(!sub.is_active());
    }

    #[test]
    fn expiring_soon_window_is_three_days() {
        let mut sub = subscription(SubscriptionStatus::Active);
        sub.cancel_at_period_end = true;

        // 2 days out: inside the window
        assert!(sub.expiring_soon_at(datetime!(2026-01-30 00:00 UTC)));
        // 5 days out: not yet
        assert!(!sub.expiring_soon_at(datetime!(2026-01-27 00:00 UTC)));
        // Past the end: no longer "expiring"
        assert!(!sub.expiring_soon_at(datetime!(2026-02-02 00:00 UTC)));

        // Without the cancel flag there is nothing to warn about
        sub.cancel_at_period_end = false;
        assert!(!sub.expiring_soon_at(datetime!(2026-01-30 00:00 UTC)));
    }

    #[test]
    fn status_round_trips_through_strings() {
        use SubscriptionStatus::*;
        for status in [Incomplete, Trialing, Active, PastDue, Canceled, Expired] {
            assert_eq!(SubscriptionStatus::parse(status.as_str()), Some(status));
        }
    }
}
