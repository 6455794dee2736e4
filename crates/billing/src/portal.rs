//! Customer portal sessions

use sqlx::PgPool;
use stripe::{BillingPortalSession, CreateBillingPortalSession};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, serde::Serialize)]
pub struct PortalResponse {
    pub url: String,
}

#[derive(Clone)]
pub struct PortalService {
    stripe: StripeClient,
    customers: CustomerService,
}

impl PortalService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let customers = CustomerService::new(stripe.clone(), pool);
        Self { stripe, customers }
    }

    /// Create a Stripe customer-portal session for payment method and
    /// invoice management.
    pub async fn create_portal_session(&self, user_id: Uuid) -> BillingResult<PortalResponse> {
        let customer_id = self
            .customers
            .find(user_id)
            .await?
            .ok_or_else(|| BillingError::Internal("user has no billing profile".to_string()))?;

        let customer = customer_id
            .parse()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))?;

        let return_url = self.stripe.config().portal_return_url.clone();
        let mut params = CreateBillingPortalSession::new(customer);
        params.return_url = Some(&return_url);

        let session = BillingPortalSession::create(self.stripe.inner(), params).await?;

        tracing::info!(user_id = %user_id, "Portal session created");

        Ok(PortalResponse { url: session.url })
    }
}
