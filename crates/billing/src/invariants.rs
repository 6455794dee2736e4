//! Billing invariants
//!
//! Runnable consistency checks over the billing schema. Run after webhook
//! replays or on demand; checks only read, never write, and every
//! violation carries enough context to debug.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected, when attributable
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - users may be charged or entitled incorrectly
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleSubsRow {
    user_id: Uuid,
    sub_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct MissingPeriodEndRow {
    sub_id: Uuid,
    user_id: Uuid,
    status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct MissingCanceledAtRow {
    sub_id: Uuid,
    user_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct MissingCustomerRow {
    user_id: Uuid,
    email: String,
}

#[derive(Debug, sqlx::FromRow)]
struct DeadLetterRow {
    stripe_event_id: String,
    event_type: String,
    last_error: Option<String>,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_engaged_subscription().await?);
        violations.extend(self.check_settled_has_period_end().await?);
        violations.extend(self.check_canceled_has_canceled_at().await?);
        violations.extend(self.check_engaged_user_has_customer().await?);
        violations.extend(self.check_dead_letters_pending().await?);

        let checks_run = 5;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: At most one engaged subscription per user
    ///
    /// Two engaged records would double-bill and confuse entitlement.
    async fn check_single_engaged_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleSubsRow> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) as sub_count
            FROM subscriptions
            WHERE status IN ('active', 'trialing', 'past_due')
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_engaged_subscription".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has {} engaged subscriptions (expected at most 1)",
                    row.sub_count
                ),
                context: serde_json::json!({
                    "subscription_count": row.sub_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Non-provisional records have a period end
    ///
    /// Once a subscription leaves `incomplete` we must know when its paid
    /// period ends, or the sweeper can never expire it.
    async fn check_settled_has_period_end(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingPeriodEndRow> = sqlx::query_as(
            r#"
            SELECT id as sub_id, user_id, status
            FROM subscriptions
            WHERE status NOT IN ('incomplete')
              AND current_period_end IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "settled_has_period_end".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Subscription in status '{}' has no current_period_end",
                    row.status
                ),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                    "status": row.status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: Canceled subscriptions record when
    async fn check_canceled_has_canceled_at(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingCanceledAtRow> = sqlx::query_as(
            r#"
            SELECT id as sub_id, user_id
            FROM subscriptions
            WHERE status = 'canceled'
              AND canceled_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceled_has_canceled_at".to_string(),
                user_ids: vec![row.user_id],
                description: "Canceled subscription has no canceled_at timestamp".to_string(),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 4: Engaged users have a Stripe customer
    async fn check_engaged_user_has_customer(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingCustomerRow> = sqlx::query_as(
            r#"
            SELECT DISTINCT u.id as user_id, u.email
            FROM users u
            JOIN subscriptions s ON s.user_id = u.id
            WHERE s.status IN ('active', 'trialing', 'past_due')
              AND u.stripe_customer_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "engaged_user_has_customer".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User '{}' has an engaged subscription but no Stripe customer",
                    row.email
                ),
                context: serde_json::json!({
                    "email": row.email,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: No dead-lettered webhooks awaiting intervention
    async fn check_dead_letters_pending(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DeadLetterRow> = sqlx::query_as(
            r#"
            SELECT stripe_event_id, event_type, last_error
            FROM webhook_queue
            WHERE status = 'dead_letter'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_dead_letters_pending".to_string(),
                user_ids: vec![],
                description: format!(
                    "Webhook event '{}' ({}) is dead-lettered",
                    row.stripe_event_id, row.event_type
                ),
                context: serde_json::json!({
                    "stripe_event_id": row.stripe_event_id,
                    "event_type": row.event_type,
                    "last_error": row.last_error,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_engaged_subscription" => self.check_single_engaged_subscription().await,
            "settled_has_period_end" => self.check_settled_has_period_end().await,
            "canceled_has_canceled_at" => self.check_canceled_has_canceled_at().await,
            "engaged_user_has_customer" => self.check_engaged_user_has_customer().await,
            "no_dead_letters_pending" => self.check_dead_letters_pending().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_engaged_subscription",
            "settled_has_period_end",
            "canceled_has_canceled_at",
            "engaged_user_has_customer",
            "no_dead_letters_pending",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"single_engaged_subscription"));
        assert!(checks.contains(&"no_dead_letters_pending"));
    }
}
