//! Per-user, per-feature daily usage counters
//!
//! Gating for free-tier users. Increments are a single atomic upsert so
//! concurrent requests from the same user never lose updates.

use examly_shared::{Feature, PlanTier};
use sqlx::PgPool;
use uuid::Uuid;

use crate::catalog::{FeatureLimit, PlanCatalog};
use crate::error::BillingResult;
use crate::subscriptions::SubscriptionStore;

/// Gating decision, separated from storage so it is directly testable.
pub fn usage_allowed(premium: bool, current_count: i64, limit: FeatureLimit) -> bool {
    if premium {
        return true;
    }
    limit.allows(current_count)
}

/// Summary of one feature's usage for today.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FeatureUsage {
    pub feature: Feature,
    pub used_today: i64,
    /// None means unlimited
    pub daily_limit: Option<i64>,
}

#[derive(Clone)]
pub struct UsageMeter {
    pool: PgPool,
    catalog: PlanCatalog,
    subscriptions: SubscriptionStore,
}

impl UsageMeter {
    pub fn new(pool: PgPool, catalog: PlanCatalog) -> Self {
        let subscriptions = SubscriptionStore::new(pool.clone());
        Self {
            pool,
            catalog,
            subscriptions,
        }
    }

    async fn tier_for(&self, user_id: Uuid) -> BillingResult<PlanTier> {
        let premium = self.subscriptions.has_active_subscription(user_id).await?;
        Ok(if premium {
            PlanTier::Premium
        } else {
            PlanTier::Free
        })
    }

    /// Today's count for (user, feature).
    pub async fn current_usage(&self, user_id: Uuid, feature: Feature) -> BillingResult<i64> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT count FROM usage_records
            WHERE user_id = $1 AND feature = $2 AND day = CURRENT_DATE
            "#,
        )
        .bind(user_id)
        .bind(feature.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(c,)| c).unwrap_or(0))
    }

    /// The user's limit for a feature on their current tier.
    pub async fn limit(&self, user_id: Uuid, feature: Feature) -> BillingResult<FeatureLimit> {
        let tier = self.tier_for(user_id).await?;
        Ok(self.catalog.feature_limit(tier, feature))
    }

    /// Whether the user may use the feature right now.
    pub async fn can_use(&self, user_id: Uuid, feature: Feature) -> BillingResult<bool> {
        let tier = self.tier_for(user_id).await?;
        if tier == PlanTier::Premium {
            return Ok(true);
        }
        let limit = self.catalog.feature_limit(tier, feature);
        let used = self.current_usage(user_id, feature).await?;
        Ok(usage_allowed(false, used, limit))
    }

    /// Record one use. Atomic upsert-increment; returns the new count.
    pub async fn increment(&self, user_id: Uuid, feature: Feature) -> BillingResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO usage_records (id, user_id, feature, day, count, updated_at)
            VALUES ($1, $2, $3, CURRENT_DATE, 1, NOW())
            ON CONFLICT (user_id, feature, day) DO UPDATE SET
                count = usage_records.count + 1,
                updated_at = NOW()
            RETURNING count
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(feature.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Usage summary across all features for display.
    pub async fn summary(&self, user_id: Uuid) -> BillingResult<Vec<FeatureUsage>> {
        let tier = self.tier_for(user_id).await?;
        let mut out = Vec::with_capacity(Feature::ALL.len());

        for feature in Feature::ALL {
            let used = self.current_usage(user_id, feature).await?;
            let daily_limit = match self.catalog.feature_limit(tier, feature) {
                FeatureLimit::Unlimited => None,
                FeatureLimit::Limited(cap) => Some(cap),
            };
            out.push(FeatureUsage {
                feature,
                used_today: used,
                daily_limit,
            });
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_user_at_limit_is_blocked() {
        let limit = FeatureLimit::Limited(50);
        assert!(usage_allowed(false, 49, limit));
        assert!(!usage_allowed(false, 50, limit));
        assert!(!usage_allowed(false, 51, limit));
    }

    #[test]
    fn premium_user_bypasses_limits() {
        assert!(usage_allowed(true, 1_000, FeatureLimit::Limited(50)));
        assert!(usage_allowed(true, 0, FeatureLimit::Limited(0)));
    }

    #[test]
    fn unlimited_entitlement_never_blocks() {
        assert!(usage_allowed(false, i64::MAX - 1, FeatureLimit::Unlimited));
    }
}
