//! Notification dispatcher
//!
//! Persists a notification record (for in-app display and dedup queries),
//! then sends the matching email best-effort. Email failure is logged and
//! never rolls back the billing state that triggered the notification.

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::email::BillingEmailService;
use crate::error::BillingResult;

/// User-facing notification kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    ExpiringSoon,
    Expired,
    PaymentFailed,
    TrialEnding,
    SubscriptionCanceled,
    SubscriptionStarted,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::ExpiringSoon => "expiring_soon",
            NotificationKind::Expired => "expired",
            NotificationKind::PaymentFailed => "payment_failed",
            NotificationKind::TrialEnding => "trial_ending",
            NotificationKind::SubscriptionCanceled => "subscription_canceled",
            NotificationKind::SubscriptionStarted => "subscription_started",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Context handed to the dispatcher alongside the kind.
#[derive(Debug, Clone, Default)]
pub struct NotificationContext {
    pub subscription_id: Option<Uuid>,
    /// Human-formatted period end, where the template needs one
    pub end_date: Option<String>,
    pub days_remaining: Option<i64>,
    pub extra: serde_json::Value,
}

#[derive(Clone)]
pub struct NotificationService {
    pool: PgPool,
    email: BillingEmailService,
}

impl NotificationService {
    pub fn new(pool: PgPool, email: BillingEmailService) -> Self {
        Self { pool, email }
    }

    /// Record and send a notification.
    ///
    /// The row is written first; if the email then fails we keep the row —
    /// the dedup guard exists to stop repeat nagging, not to guarantee
    /// delivery.
    pub async fn notify(
        &self,
        user_id: Uuid,
        kind: NotificationKind,
        context: NotificationContext,
    ) -> BillingResult<()> {
        let context_json = serde_json::json!({
            "end_date": context.end_date,
            "days_remaining": context.days_remaining,
            "extra": context.extra,
        });

        sqlx::query(
            r#"
            INSERT INTO notifications (id, user_id, subscription_id, kind, context, sent_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(context.subscription_id)
        .bind(kind.as_str())
        .bind(&context_json)
        .execute(&self.pool)
        .await?;

        let recipient: Option<(String, String)> =
            sqlx::query_as("SELECT email, display_name FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        let Some((email, name)) = recipient else {
            tracing::warn!(user_id = %user_id, kind = %kind, "No user row for notification");
            return Ok(());
        };
        let name = if name.is_empty() { "there".to_string() } else { name };

        let result = match kind {
            NotificationKind::ExpiringSoon => {
                let end = context.end_date.as_deref().unwrap_or("soon");
                self.email.send_expiring_soon(&email, &name, end).await
            }
            NotificationKind::Expired => self.email.send_expired(&email, &name).await,
            NotificationKind::PaymentFailed => self.email.send_payment_failed(&email, &name).await,
            NotificationKind::TrialEnding => {
                let days = context.days_remaining.unwrap_or(3);
                self.email.send_trial_ending(&email, &name, days).await
            }
            NotificationKind::SubscriptionCanceled => {
                let end = context.end_date.as_deref().unwrap_or("the end of the period");
                self.email
                    .send_subscription_cancelled(&email, &name, end)
                    .await
            }
            NotificationKind::SubscriptionStarted => {
                self.email.send_subscription_started(&email, &name).await
            }
        };

        if let Err(e) = result {
            tracing::error!(
                user_id = %user_id,
                kind = %kind,
                error = %e,
                "Notification email delivery failed"
            );
        }

        Ok(())
    }

    /// Dedup guard: was a notification of this kind for this subscription
    /// sent within the trailing window?
    pub async fn was_sent_within(
        &self,
        subscription_id: Uuid,
        kind: NotificationKind,
        window: Duration,
    ) -> BillingResult<bool> {
        let cutoff = OffsetDateTime::now_utc() - window;

        let row: Option<(i32,)> = sqlx::query_as(
            r#"
            SELECT 1 FROM notifications
            WHERE subscription_id = $1 AND kind = $2 AND sent_at > $3
            LIMIT 1
            "#,
        )
        .bind(subscription_id)
        .bind(kind.as_str())
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(NotificationKind::ExpiringSoon.as_str(), "expiring_soon");
        assert_eq!(NotificationKind::Expired.as_str(), "expired");
        assert_eq!(NotificationKind::PaymentFailed.as_str(), "payment_failed");
        assert_eq!(NotificationKind::TrialEnding.as_str(), "trial_ending");
    }
}
