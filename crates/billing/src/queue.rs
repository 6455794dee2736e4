//! Durable webhook processing queue
//!
//! The HTTP handler verifies and enqueues; the worker drains. Claiming uses
//! `FOR UPDATE SKIP LOCKED` so multiple workers never double-process a row.
//! Failed rows retry on an exponential schedule and dead-letter after the
//! attempt budget; a dead-lettered event is never silently dropped.

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;

/// Retry budget before a row is parked for manual intervention.
pub const MAX_ATTEMPTS: i32 = 3;

/// Exponential backoff schedule: 1 minute, then 5, then 25.
///
/// `attempt` is the number of failures so far (1-based).
pub fn backoff_delay(attempt: i32) -> Duration {
    let exponent = attempt.clamp(1, MAX_ATTEMPTS) - 1;
    Duration::minutes(5_i64.pow(exponent as u32))
}

/// What to do with a row after a processing failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Requeue with the given delay
    Retry(Duration),
    /// Attempts exhausted; park and alert
    DeadLetter,
    /// Validation failure; never retried
    Discard,
}

/// Decide the disposition for a failure. `attempts` counts this failure.
pub fn disposition_for(attempts: i32, retryable: bool) -> FailureDisposition {
    if !retryable {
        return FailureDisposition::Discard;
    }
    if attempts >= MAX_ATTEMPTS {
        FailureDisposition::DeadLetter
    } else {
        FailureDisposition::Retry(backoff_delay(attempts))
    }
}

/// A claimed queue row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueuedWebhook {
    pub id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    pub payload: String,
    pub attempts: i32,
}

#[derive(Clone)]
pub struct WebhookQueue {
    pool: PgPool,
}

impl WebhookQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Enqueue a verified event for background processing. Idempotent on
    /// the event id.
    pub async fn enqueue(
        &self,
        stripe_event_id: &str,
        event_type: &str,
        payload: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_queue
                (id, stripe_event_id, event_type, payload, status, next_attempt_at)
            VALUES ($1, $2, $3, $4, 'queued', NOW())
            ON CONFLICT (stripe_event_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(stripe_event_id)
        .bind(event_type)
        .bind(payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Claim up to `limit` due rows for exclusive processing.
    pub async fn claim_due(&self, limit: i64) -> BillingResult<Vec<QueuedWebhook>> {
        let rows: Vec<QueuedWebhook> = sqlx::query_as(
            r#"
            UPDATE webhook_queue
            SET status = 'processing', updated_at = NOW()
            WHERE id IN (
                SELECT id FROM webhook_queue
                WHERE status = 'queued' AND next_attempt_at <= NOW()
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, stripe_event_id, event_type, payload, attempts
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn mark_done(&self, id: Uuid) -> BillingResult<()> {
        sqlx::query(
            "UPDATE webhook_queue SET status = 'done', updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failure and apply its disposition. Returns the disposition
    /// so the caller can alert on dead-letters.
    pub async fn mark_failed(
        &self,
        id: Uuid,
        prior_attempts: i32,
        error: &str,
        retryable: bool,
    ) -> BillingResult<FailureDisposition> {
        let attempts = prior_attempts + 1;
        let disposition = disposition_for(attempts, retryable);

        match disposition {
            FailureDisposition::Retry(delay) => {
                let next_attempt_at = OffsetDateTime::now_utc() + delay;
                sqlx::query(
                    r#"
                    UPDATE webhook_queue
                    SET status = 'queued', attempts = $2, next_attempt_at = $3,
                        last_error = $4, updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(attempts)
                .bind(next_attempt_at)
                .bind(error)
                .execute(&self.pool)
                .await?;
            }
            FailureDisposition::DeadLetter => {
                sqlx::query(
                    r#"
                    UPDATE webhook_queue
                    SET status = 'dead_letter', attempts = $2, last_error = $3,
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(attempts)
                .bind(error)
                .execute(&self.pool)
                .await?;
            }
            FailureDisposition::Discard => {
                sqlx::query(
                    r#"
                    UPDATE webhook_queue
                    SET status = 'discarded', attempts = $2, last_error = $3,
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(attempts)
                .bind(error)
                .execute(&self.pool)
                .await?;
            }
        }

        Ok(disposition)
    }

    /// Crash recovery: rows stuck in 'processing' past the timeout go back
    /// to 'queued'. Safe because domain processing is idempotent.
    pub async fn requeue_stuck(&self, older_than_minutes: i64) -> BillingResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - Duration::minutes(older_than_minutes);

        let result = sqlx::query(
            r#"
            UPDATE webhook_queue
            SET status = 'queued', next_attempt_at = NOW(), updated_at = NOW()
            WHERE status = 'processing' AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Delete finished rows older than the retention window. Dead-letters
    /// are kept until an operator resolves them.
    pub async fn cleanup_old(&self, keep_days: i64) -> BillingResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - Duration::days(keep_days);

        let result = sqlx::query(
            r#"
            DELETE FROM webhook_queue
            WHERE status IN ('done', 'discarded') AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Count of rows awaiting manual intervention.
    pub async fn dead_letter_count(&self) -> BillingResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM webhook_queue WHERE status = 'dead_letter'",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially() {
        assert_eq!(backoff_delay(1), Duration::minutes(1));
        assert_eq!(backoff_delay(2), Duration::minutes(5));
        assert_eq!(backoff_delay(3), Duration::minutes(25));
        // Clamped past the budget
        assert_eq!(backoff_delay(10), Duration::minutes(25));
    }

    #[test]
    fn retries_until_budget_then_dead_letters() {
        assert_eq!(
            disposition_for(1, true),
            FailureDisposition::Retry(Duration::minutes(1))
        );
        assert_eq!(
            disposition_for(2, true),
            FailureDisposition::Retry(Duration::minutes(5))
        );
        assert_eq!(disposition_for(3, true), FailureDisposition::DeadLetter);
        assert_eq!(disposition_for(4, true), FailureDisposition::DeadLetter);
    }

    #[test]
    fn validation_failures_are_never_retried() {
        assert_eq!(disposition_for(1, false), FailureDisposition::Discard);
        assert_eq!(disposition_for(3, false), FailureDisposition::Discard);
    }
}
