//! Stripe customer provisioning

use sqlx::PgPool;
use stripe::{CreateCustomer, Customer};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

#[derive(Clone)]
pub struct CustomerService {
    stripe: StripeClient,
    pool: PgPool,
}

impl CustomerService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// The user's Stripe customer id, if they have a billing profile.
    pub async fn find(&self, user_id: Uuid) -> BillingResult<Option<String>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT stripe_customer_id FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((customer_id,)) => Ok(customer_id),
            None => Err(BillingError::Internal(format!(
                "user {} not found",
                user_id
            ))),
        }
    }

    /// Get the user's Stripe customer, creating one on first use.
    pub async fn get_or_create(&self, user_id: Uuid) -> BillingResult<String> {
        if let Some(existing) = self.find(user_id).await? {
            return Ok(existing);
        }

        let (email, display_name): (String, String) =
            sqlx::query_as("SELECT email, display_name FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| BillingError::Internal(format!("user {} not found", user_id)))?;

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());

        let mut params = CreateCustomer::new();
        params.email = Some(&email);
        if !display_name.is_empty() {
            params.name = Some(&display_name);
        }
        params.metadata = Some(metadata);

        let customer = Customer::create(self.stripe.inner(), params).await?;
        let customer_id = customer.id.to_string();

        // Guard against a concurrent create for the same user: first writer
        // wins, and we re-read whichever id landed
        let stored: (String,) = sqlx::query_as(
            r#"
            UPDATE users
            SET stripe_customer_id = COALESCE(stripe_customer_id, $2)
            WHERE id = $1
            RETURNING stripe_customer_id
            "#,
        )
        .bind(user_id)
        .bind(&customer_id)
        .fetch_one(&self.pool)
        .await?;

        if stored.0 != customer_id {
            tracing::warn!(
                user_id = %user_id,
                created = %customer_id,
                kept = %stored.0,
                "Concurrent customer creation detected, keeping first"
            );
        }

        tracing::info!(
            user_id = %user_id,
            customer_id = %stored.0,
            "Stripe customer ready"
        );

        Ok(stored.0)
    }
}
