//! Expiration sweeper
//!
//! Hourly defensive reconciliation for transitions webhooks alone might
//! miss or delay. Two passes: warn on subscriptions scheduled to end within
//! the expiring window, and expire subscriptions whose paid period is over.
//! Every record is processed in isolation; one bad row never aborts the
//! batch, and re-running after a crash is safe because the selection
//! predicates stop matching once a record is handled.

use sqlx::PgPool;
use time::Duration;
use uuid::Uuid;

use crate::email::BillingEmailService;
use crate::error::BillingResult;
use crate::events_log::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::notifications::{NotificationContext, NotificationKind, NotificationService};
use crate::subscriptions::{EXPIRING_WINDOW_DAYS, NOTIFICATION_DEDUP_HOURS};

/// Outcome counts for one sweep.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepSummary {
    pub expiring_notified: usize,
    pub expired_transitioned: usize,
    pub errors: usize,
}

#[derive(Debug, sqlx::FromRow)]
struct SweepCandidate {
    id: Uuid,
    user_id: Uuid,
    stripe_subscription_id: String,
    current_period_end: Option<time::OffsetDateTime>,
}

#[derive(Clone)]
pub struct ExpirationSweeper {
    pool: PgPool,
    notifications: NotificationService,
    event_logger: BillingEventLogger,
}

impl ExpirationSweeper {
    pub fn new(pool: PgPool, email: BillingEmailService) -> Self {
        let notifications = NotificationService::new(pool.clone(), email);
        let event_logger = BillingEventLogger::new(pool.clone());
        Self {
            pool,
            notifications,
            event_logger,
        }
    }

    /// Run both passes. Called hourly by the worker.
    pub async fn run(&self) -> BillingResult<SweepSummary> {
        let mut summary = SweepSummary::default();

        self.expiring_pass(&mut summary).await?;
        self.expired_pass(&mut summary).await?;

        tracing::info!(
            expiring_notified = summary.expiring_notified,
            expired_transitioned = summary.expired_transitioned,
            errors = summary.errors,
            "Expiration sweep complete"
        );

        Ok(summary)
    }

    /// Warn users whose cancellation takes effect within the window.
    async fn expiring_pass(&self, summary: &mut SweepSummary) -> BillingResult<()> {
        let candidates: Vec<SweepCandidate> = sqlx::query_as(
            r#"
            SELECT id, user_id, stripe_subscription_id, current_period_end
            FROM subscriptions
            WHERE status IN ('active', 'trialing')
              AND cancel_at_period_end = TRUE
              AND current_period_end > NOW()
              AND current_period_end <= NOW() + make_interval(days => $1)
            "#,
        )
        .bind(EXPIRING_WINDOW_DAYS as i32)
        .fetch_all(&self.pool)
        .await?;

        for candidate in candidates {
            match self.notify_expiring(&candidate).await {
                Ok(true) => summary.expiring_notified += 1,
                Ok(false) => {} // deduped
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!(
                        subscription_id = %candidate.stripe_subscription_id,
                        error = %e,
                        "Expiring-soon notification failed"
                    );
                }
            }
        }

        Ok(())
    }

    async fn notify_expiring(&self, candidate: &SweepCandidate) -> BillingResult<bool> {
        let already = self
            .notifications
            .was_sent_within(
                candidate.id,
                NotificationKind::ExpiringSoon,
                Duration::hours(NOTIFICATION_DEDUP_HOURS),
            )
            .await?;
        if already {
            return Ok(false);
        }

        let end_date = candidate
            .current_period_end
            .map(|dt| dt.date().to_string())
            .unwrap_or_else(|| "soon".to_string());

        self.notifications
            .notify(
                candidate.user_id,
                NotificationKind::ExpiringSoon,
                NotificationContext {
                    subscription_id: Some(candidate.id),
                    end_date: Some(end_date),
                    ..Default::default()
                },
            )
            .await?;

        Ok(true)
    }

    /// Expire subscriptions whose period end has passed without a
    /// terminating event from the provider.
    async fn expired_pass(&self, summary: &mut SweepSummary) -> BillingResult<()> {
        let candidates: Vec<SweepCandidate> = sqlx::query_as(
            r#"
            SELECT id, user_id, stripe_subscription_id, current_period_end
            FROM subscriptions
            WHERE status IN ('active', 'trialing', 'past_due')
              AND current_period_end < NOW()
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        for candidate in candidates {
            match self.expire_one(&candidate).await {
                Ok(true) => summary.expired_transitioned += 1,
                Ok(false) => {} // a webhook got there first
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!(
                        subscription_id = %candidate.stripe_subscription_id,
                        error = %e,
                        "Expired transition failed"
                    );
                }
            }
        }

        Ok(())
    }

    async fn expire_one(&self, candidate: &SweepCandidate) -> BillingResult<bool> {
        // Status-conditional update: re-checks the predicate under the row
        // lock so a concurrent webhook applying a newer state wins, and a
        // re-run sweep matches nothing. The notification only goes out when
        // this statement actually changed the row.
        let updated = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'expired', updated_at = NOW()
            WHERE id = $1
              AND status IN ('active', 'trialing', 'past_due')
              AND current_period_end < NOW()
            "#,
        )
        .bind(candidate.id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Ok(false);
        }

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(candidate.user_id, BillingEventType::SubscriptionExpired)
                    .data(serde_json::json!({
                        "period_end": candidate.current_period_end,
                        "source": "sweeper",
                    }))
                    .stripe_subscription(candidate.stripe_subscription_id.clone())
                    .actor_type(ActorType::System),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log subscription expired event");
        }

        self.notifications
            .notify(
                candidate.user_id,
                NotificationKind::Expired,
                NotificationContext {
                    subscription_id: Some(candidate.id),
                    ..Default::default()
                },
            )
            .await?;

        tracing::info!(
            subscription_id = %candidate.stripe_subscription_id,
            user_id = %candidate.user_id,
            "Subscription expired by sweeper"
        );

        Ok(true)
    }

    /// Daily pass: re-notify users whose subscription is sitting in
    /// past_due, deduped per the notification window.
    pub async fn run_past_due_notifications(&self) -> BillingResult<usize> {
        let candidates: Vec<SweepCandidate> = sqlx::query_as(
            r#"
            SELECT id, user_id, stripe_subscription_id, current_period_end
            FROM subscriptions
            WHERE status = 'past_due'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut notified = 0;

        for candidate in candidates {
            let already = match self
                .notifications
                .was_sent_within(
                    candidate.id,
                    NotificationKind::PaymentFailed,
                    Duration::hours(NOTIFICATION_DEDUP_HOURS),
                )
                .await
            {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!(
                        subscription_id = %candidate.stripe_subscription_id,
                        error = %e,
                        "Past-due dedup check failed"
                    );
                    continue;
                }
            };
            if already {
                continue;
            }

            match self
                .notifications
                .notify(
                    candidate.user_id,
                    NotificationKind::PaymentFailed,
                    NotificationContext {
                        subscription_id: Some(candidate.id),
                        ..Default::default()
                    },
                )
                .await
            {
                Ok(()) => notified += 1,
                Err(e) => {
                    tracing::error!(
                        subscription_id = %candidate.stripe_subscription_id,
                        error = %e,
                        "Past-due notification failed"
                    );
                }
            }
        }

        tracing::info!(notified = notified, "Past-due notification pass complete");
        Ok(notified)
    }
}
