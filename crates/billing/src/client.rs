//! Stripe client wrapper and billing configuration

use crate::error::{BillingError, BillingResult};

/// Stripe price ids for each purchasable plan.
#[derive(Debug, Clone)]
pub struct PriceIds {
    pub premium_monthly: String,
    pub premium_annual: String,
}

/// Billing configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub price_ids: PriceIds,
    /// Trial length applied to new premium checkouts, in days.
    pub trial_days: u32,
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,
    pub portal_return_url: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = require_env("STRIPE_SECRET_KEY")?;
        let webhook_secret = require_env("STRIPE_WEBHOOK_SECRET")?;

        Ok(Self {
            secret_key,
            webhook_secret,
            price_ids: PriceIds {
                premium_monthly: require_env("STRIPE_PRICE_PREMIUM_MONTHLY")?,
                premium_annual: require_env("STRIPE_PRICE_PREMIUM_ANNUAL")?,
            },
            trial_days: std::env::var("TRIAL_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(14),
            checkout_success_url: std::env::var("CHECKOUT_SUCCESS_URL")
                .unwrap_or_else(|_| "https://app.examly.io/billing/success".to_string()),
            checkout_cancel_url: std::env::var("CHECKOUT_CANCEL_URL")
                .unwrap_or_else(|_| "https://app.examly.io/billing/cancelled".to_string()),
            portal_return_url: std::env::var("PORTAL_RETURN_URL")
                .unwrap_or_else(|_| "https://app.examly.io/settings/billing".to_string()),
        })
    }

    /// Price id for a tier + billing interval, if one exists.
    pub fn price_id_for(&self, tier: &str, interval: &str) -> Option<&str> {
        match (tier, interval) {
            ("premium", "monthly") => Some(self.price_ids.premium_monthly.as_str()),
            ("premium", "annual") => Some(self.price_ids.premium_annual.as_str()),
            _ => None,
        }
    }
}

fn require_env(name: &str) -> BillingResult<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| BillingError::Config(format!("{} not configured", name)))
}

/// Thin wrapper owning the async-stripe client and the billing config.
#[derive(Clone)]
pub struct StripeClient {
    client: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let client = stripe::Client::new(config.secret_key.clone());
        Self { client, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.client
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test_xxx".into(),
            webhook_secret: "whsec_test".into(),
            price_ids: PriceIds {
                premium_monthly: "price_premium_monthly".into(),
                premium_annual: "price_premium_annual".into(),
            },
            trial_days: 14,
            checkout_success_url: "https://example.test/ok".into(),
            checkout_cancel_url: "https://example.test/no".into(),
            portal_return_url: "https://example.test/billing".into(),
        }
    }

    #[test]
    fn price_lookup_by_tier_and_interval() {
        let config = test_config();
        assert_eq!(
            config.price_id_for("premium", "monthly"),
            Some("price_premium_monthly")
        );
        assert_eq!(
            config.price_id_for("premium", "annual"),
            Some("price_premium_annual")
        );
        assert_eq!(config.price_id_for("premium", "weekly"), None);
        assert_eq!(config.price_id_for("free", "monthly"), None);
    }
}
