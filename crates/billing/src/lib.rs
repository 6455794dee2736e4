// Billing crate clippy configuration
#![allow(clippy::too_many_arguments)] // Some Stripe operations require many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Examly Billing Module
//!
//! Handles Stripe integration for the subscription lifecycle: webhook
//! reconciliation, expiration sweeping, usage limits, and notifications.
//!
//! ## Features
//!
//! - **Subscription Lifecycle**: one record per provider subscription,
//!   status-transitioned, never deleted
//! - **Webhook Reconciliation**: signed, idempotent, ordering-tolerant
//!   event processing with retry/backoff and dead-lettering
//! - **Expiration Sweeping**: hourly defensive pass for transitions the
//!   provider's events missed or delayed
//! - **Usage Limits**: atomic per-day counters gating free-tier features
//! - **Email Notifications**: expiring, expired, payment failed, trial
//!   ending - deduped per subscription
//! - **Provider Sync**: daily reconciliation against Stripe as the system
//!   of record

pub mod catalog;
pub mod checkout;
pub mod client;
pub mod customer;
pub mod email;
pub mod error;
pub mod events;
pub mod events_log;
pub mod invariants;
pub mod notifications;
pub mod portal;
pub mod queue;
pub mod subscriptions;
pub mod sweeper;
pub mod sync;
pub mod usage;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Catalog
pub use catalog::{BillingInterval, FeatureLimit, PlanCatalog, PlanDescriptor};

// Checkout
pub use checkout::{CheckoutResponse, CheckoutService};

// Client
pub use client::{PriceIds, StripeClient, StripeConfig};

// Customer
pub use customer::CustomerService;

// Email
pub use email::{BillingEmailService, EmailConfig};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{EventData, EventKind, InvoicePayload, SubscriptionPayload, WebhookEvent};

// Events log
pub use events_log::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Notifications
pub use notifications::{NotificationContext, NotificationKind, NotificationService};

// Portal
pub use portal::{PortalResponse, PortalService};

// Queue
pub use queue::{FailureDisposition, QueuedWebhook, WebhookQueue, MAX_ATTEMPTS};

// Subscriptions
pub use subscriptions::{
    ScheduledPlanChange, Subscription, SubscriptionService, SubscriptionStatus, SubscriptionStore,
};

// Sweeper
pub use sweeper::{ExpirationSweeper, SweepSummary};

// Sync
pub use sync::{SubscriptionSyncService, SyncSummary};

// Usage
pub use usage::{FeatureUsage, UsageMeter};

// Webhooks
pub use webhooks::WebhookHandler;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub catalog: PlanCatalog,
    pub checkout: CheckoutService,
    pub customer: CustomerService,
    pub email: BillingEmailService,
    pub portal: PortalService,
    pub subscriptions: SubscriptionService,
    pub sweeper: ExpirationSweeper,
    pub sync: SubscriptionSyncService,
    pub usage: UsageMeter,
    pub webhooks: WebhookHandler,
    pub webhook_queue: WebhookQueue,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let email_service = BillingEmailService::from_env();
        Ok(Self::with_clients(stripe, email_service, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        let stripe = StripeClient::new(config);
        let email_service = BillingEmailService::from_env();
        Self::with_clients(stripe, email_service, pool)
    }

    fn with_clients(stripe: StripeClient, email: BillingEmailService, pool: PgPool) -> Self {
        let catalog = PlanCatalog::new(stripe.config());

        Self {
            catalog: catalog.clone(),
            checkout: CheckoutService::new(stripe.clone(), pool.clone()),
            customer: CustomerService::new(stripe.clone(), pool.clone()),
            email: email.clone(),
            portal: PortalService::new(stripe.clone(), pool.clone()),
            subscriptions: SubscriptionService::new(stripe.clone(), pool.clone()),
            sweeper: ExpirationSweeper::new(pool.clone(), email.clone()),
            sync: SubscriptionSyncService::new(stripe.clone(), pool.clone()),
            usage: UsageMeter::new(pool.clone(), catalog),
            webhooks: WebhookHandler::new(&stripe, pool.clone(), email),
            webhook_queue: WebhookQueue::new(pool),
        }
    }
}
