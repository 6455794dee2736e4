//! Checkout session creation

use sqlx::PgPool;
use stripe::{
    CheckoutSession, CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionSubscriptionData,
};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, serde::Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: String,
}

#[derive(Clone)]
pub struct CheckoutService {
    stripe: StripeClient,
    customers: CustomerService,
}

impl CheckoutService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let customers = CustomerService::new(stripe.clone(), pool);
        Self { stripe, customers }
    }

    /// Start a subscription checkout for the premium plan. The resulting
    /// `customer.subscription.created` webhook creates the local record.
    pub async fn create_premium_checkout(
        &self,
        user_id: Uuid,
        interval: &str,
    ) -> BillingResult<CheckoutResponse> {
        let config = self.stripe.config().clone();
        let price_id = config
            .price_id_for("premium", interval)
            .ok_or_else(|| BillingError::UnknownPrice(format!("premium/{}", interval)))?
            .to_string();

        let customer_id = self.customers.get_or_create(user_id).await?;
        let customer = customer_id
            .parse()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))?;

        let user_ref = user_id.to_string();

        let mut params = CreateCheckoutSession::new();
        params.mode = Some(CheckoutSessionMode::Subscription);
        params.customer = Some(customer);
        params.client_reference_id = Some(&user_ref);
        params.success_url = Some(&config.checkout_success_url);
        params.cancel_url = Some(&config.checkout_cancel_url);
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        if config.trial_days > 0 {
            params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
                trial_period_days: Some(config.trial_days),
                ..Default::default()
            });
        }

        let session = CheckoutSession::create(self.stripe.inner(), params).await?;

        let url = session
            .url
            .ok_or_else(|| BillingError::StripeApi("No checkout URL returned".to_string()))?;

        tracing::info!(
            user_id = %user_id,
            session_id = %session.id,
            price_id = %price_id,
            "Checkout session created"
        );

        Ok(CheckoutResponse {
            session_id: session.id.to_string(),
            url,
        })
    }
}
