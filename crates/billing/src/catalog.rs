//! Plan catalog
//!
//! Static mapping from Stripe price ids to plan descriptors and from
//! (tier, feature) to entitlement limits. Read-only at runtime; changes
//! ship as config/deploy changes.

use examly_shared::{Feature, PlanTier};

use crate::client::StripeConfig;

/// Per-feature entitlement: a daily cap or unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureLimit {
    Limited(i64),
    Unlimited,
}

impl FeatureLimit {
    /// Whether `used` consumptions leave room for one more.
    pub fn allows(&self, used: i64) -> bool {
        match self {
            FeatureLimit::Unlimited => true,
            FeatureLimit::Limited(cap) => used < *cap,
        }
    }
}

/// Billing interval of a purchasable plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Monthly,
    Annual,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Monthly => "monthly",
            BillingInterval::Annual => "annual",
        }
    }
}

/// A resolved plan: what a Stripe price id means to us.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PlanDescriptor {
    pub tier: PlanTier,
    pub interval: BillingInterval,
    pub price_id: String,
    pub amount_cents: i64,
    pub currency: &'static str,
}

/// Free tier daily limits. Premium is unlimited on every feature.
const FREE_TUTOR_CHAT_PER_DAY: i64 = 50;
const FREE_QUIZZES_PER_DAY: i64 = 10;
const FREE_DOCUMENT_UPLOADS_PER_DAY: i64 = 5;

const PREMIUM_MONTHLY_CENTS: i64 = 1_499;
const PREMIUM_ANNUAL_CENTS: i64 = 11_988;

/// Read-only plan catalog.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    premium_monthly: String,
    premium_annual: String,
}

impl PlanCatalog {
    pub fn new(config: &StripeConfig) -> Self {
        Self {
            premium_monthly: config.price_ids.premium_monthly.clone(),
            premium_annual: config.price_ids.premium_annual.clone(),
        }
    }

    /// Resolve a Stripe price id to a plan descriptor.
    pub fn resolve_plan(&self, price_id: &str) -> Option<PlanDescriptor> {
        if price_id == self.premium_monthly {
            Some(PlanDescriptor {
                tier: PlanTier::Premium,
                interval: BillingInterval::Monthly,
                price_id: price_id.to_string(),
                amount_cents: PREMIUM_MONTHLY_CENTS,
                currency: "usd",
            })
        } else if price_id == self.premium_annual {
            Some(PlanDescriptor {
                tier: PlanTier::Premium,
                interval: BillingInterval::Annual,
                price_id: price_id.to_string(),
                amount_cents: PREMIUM_ANNUAL_CENTS,
                currency: "usd",
            })
        } else {
            None
        }
    }

    /// Daily entitlement for a feature on a tier.
    pub fn feature_limit(&self, tier: PlanTier, feature: Feature) -> FeatureLimit {
        match tier {
            PlanTier::Premium => FeatureLimit::Unlimited,
            PlanTier::Free => match feature {
                Feature::TutorChat => FeatureLimit::Limited(FREE_TUTOR_CHAT_PER_DAY),
                Feature::QuizGeneration => FeatureLimit::Limited(FREE_QUIZZES_PER_DAY),
                Feature::DocumentUpload => FeatureLimit::Limited(FREE_DOCUMENT_UPLOADS_PER_DAY),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::PriceIds;

    fn catalog() -> PlanCatalog {
        PlanCatalog {
            premium_monthly: "price_pm".into(),
            premium_annual: "price_pa".into(),
        }
    }

    #[test]
    fn resolves_known_prices() {
        let catalog = catalog();
        let plan = catalog.resolve_plan("price_pm").unwrap();
        assert_eq!(plan.tier, PlanTier::Premium);
        assert_eq!(plan.interval, BillingInterval::Monthly);

        let plan = catalog.resolve_plan("price_pa").unwrap();
        assert_eq!(plan.interval, BillingInterval::Annual);
    }

    #[test]
    fn unknown_price_is_none() {
        assert!(catalog().resolve_plan("price_mystery").is_none());
    }

    #[test]
    fn free_tier_limits_apply_premium_is_unlimited() {
        let catalog = catalog();
        assert_eq!(
            catalog.feature_limit(PlanTier::Free, Feature::TutorChat),
            FeatureLimit::Limited(50)
        );
        assert_eq!(
            catalog.feature_limit(PlanTier::Premium, Feature::TutorChat),
            FeatureLimit::Unlimited
        );
    }

    #[test]
    fn limit_allows_under_cap_only() {
        assert!(FeatureLimit::Limited(50).allows(49));
        assert!(!FeatureLimit::Limited(50).allows(50));
        assert!(!FeatureLimit::Limited(50).allows(51));
        assert!(FeatureLimit::Unlimited.allows(1_000));
    }

    #[test]
    fn catalog_builds_from_config() {
        let config = StripeConfig {
            secret_key: "sk_test".into(),
            webhook_secret: "whsec".into(),
            price_ids: PriceIds {
                premium_monthly: "price_pm".into(),
                premium_annual: "price_pa".into(),
            },
            trial_days: 14,
            checkout_success_url: String::new(),
            checkout_cancel_url: String::new(),
            portal_return_url: String::new(),
        };
        let catalog = PlanCatalog::new(&config);
        assert!(catalog.resolve_plan("price_pm").is_some());
    }
}
