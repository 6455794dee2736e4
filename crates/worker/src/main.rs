//! Examly Background Worker
//!
//! Handles scheduled billing jobs:
//! - Webhook queue processing (every minute)
//! - Expiration sweep: expiring-soon warnings + expired transitions (hourly)
//! - Scheduled plan changes (hourly)
//! - Subscription sync with the billing provider (daily at 2:30 UTC)
//! - Failed-payment notifications (daily at 9:00 UTC)
//! - Webhook queue cleanup (daily at 3:00 UTC)

mod webhook_processor;

use std::sync::Arc;
use std::time::Duration;

use examly_billing::BillingService;
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// Rows claimed per webhook queue cycle.
const WEBHOOK_BATCH_SIZE: i64 = 20;

/// Days of finished queue rows to keep.
const QUEUE_RETENTION_DAYS: i64 = 7;

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Examly Worker");

    // Create database pool
    let pool = create_db_pool().await?;

    // Create billing service
    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            anyhow::bail!("Failed to create billing service: {}", e);
        }
    };

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Process webhook queue (every minute)
    // Drains verified events with retry/backoff and dead-lettering
    let queue_billing = billing.clone();
    let queue_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let billing = queue_billing.clone();
            let pool = queue_pool.clone();
            Box::pin(async move {
                webhook_processor::process_webhook_queue(&billing, &pool, WEBHOOK_BATCH_SIZE)
                    .await;
            })
        })?)
        .await?;
    info!("Scheduled: Webhook queue processing (every minute)");

    // Job 2: Expiration sweep (hourly)
    // Expiring-soon warnings and defensive expired transitions
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                info!("Running expiration sweep");
                if let Err(e) = billing.sweeper.run().await {
                    error!(error = %e, "Expiration sweep failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Expiration sweep (hourly)");

    // Job 3: Scheduled plan changes (hourly at :15)
    let plan_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 15 * * * *", move |_uuid, _l| {
            let billing = plan_billing.clone();
            Box::pin(async move {
                info!("Processing scheduled plan changes");
                match billing.subscriptions.process_due_plan_changes().await {
                    Ok(0) => {}
                    Ok(applied) => info!(applied = applied, "Plan changes applied"),
                    Err(e) => error!(error = %e, "Plan change processing failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Plan change processing (hourly)");

    // Job 4: Sync subscriptions with the billing provider (daily at 2:30 UTC)
    // The provider is the system of record; this catches lost webhooks
    let sync_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 30 2 * * *", move |_uuid, _l| {
            let billing = sync_billing.clone();
            Box::pin(async move {
                info!("Running provider subscription sync");
                if let Err(e) = billing.sync.run().await {
                    error!(error = %e, "Provider sync failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Provider subscription sync (daily at 2:30 UTC)");

    // Job 5: Failed-payment notifications (daily at 9:00 UTC)
    let past_due_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 9 * * *", move |_uuid, _l| {
            let billing = past_due_billing.clone();
            Box::pin(async move {
                info!("Running failed-payment notification pass");
                if let Err(e) = billing.sweeper.run_past_due_notifications().await {
                    error!(error = %e, "Failed-payment notification pass failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Failed-payment notifications (daily at 9:00 UTC)");

    // Job 6: Cleanup old webhooks (daily at 3:00 AM UTC)
    let cleanup_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let billing = cleanup_billing.clone();
            Box::pin(async move {
                info!("Running webhook queue cleanup");
                webhook_processor::cleanup_old_webhooks(&billing, QUEUE_RETENTION_DAYS).await;
            })
        })?)
        .await?;
    info!("Scheduled: Webhook queue cleanup (daily at 3:00 AM)");

    // Job 7: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Examly Worker started successfully with {} scheduled jobs", 7);

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
