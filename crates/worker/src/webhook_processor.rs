//! Webhook queue processing
//!
//! Drains the queue every minute. Each claimed row gets one processing
//! attempt; failures are classified as retryable (transient/inconsistency)
//! or final (validation), and rows that exhaust the retry budget are
//! dead-lettered with an operator alert - never silently dropped.

use examly_billing::{
    ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType, BillingService,
    FailureDisposition, WebhookEvent,
};
use sqlx::PgPool;

/// One drain cycle. Called from the every-minute job.
pub async fn process_webhook_queue(billing: &BillingService, pool: &PgPool, batch_size: i64) {
    // Crash recovery first: anything stuck in 'processing' for 30+ minutes
    // goes back to the queue
    match billing.webhook_queue.requeue_stuck(30).await {
        Ok(0) => {}
        Ok(n) => tracing::warn!(requeued = n, "Recovered stuck webhook rows"),
        Err(e) => tracing::error!(error = %e, "Failed to requeue stuck webhook rows"),
    }

    let claimed = match billing.webhook_queue.claim_due(batch_size).await {
        Ok(rows) => rows,
        Err(e) => {
            tracing::error!(error = %e, "Failed to claim webhook queue rows");
            return;
        }
    };

    if claimed.is_empty() {
        return;
    }

    let total = claimed.len();
    let mut succeeded = 0;
    let mut retried = 0;
    let mut dead_lettered = 0;
    let mut discarded = 0;

    for row in claimed {
        let event = match WebhookEvent::parse(&row.payload) {
            Ok(event) => event,
            Err(e) => {
                // Shape failures are final: mark discarded in both the
                // queue and the ledger
                tracing::error!(
                    event_id = %row.stripe_event_id,
                    error = %e,
                    "Webhook payload failed validation, discarding"
                );
                let _ = billing
                    .webhook_queue
                    .mark_failed(row.id, row.attempts, &e.to_string(), false)
                    .await;
                let _ = billing
                    .webhooks
                    .mark_event_result(&row.stripe_event_id, "discarded", Some(&e.to_string()))
                    .await;
                discarded += 1;
                continue;
            }
        };

        match billing.webhooks.process_event(&event).await {
            Ok(()) => {
                if let Err(e) = billing.webhook_queue.mark_done(row.id).await {
                    tracing::error!(
                        event_id = %event.id,
                        error = %e,
                        "Processed webhook but failed to mark queue row done"
                    );
                }
                let _ = billing
                    .webhooks
                    .mark_event_result(&event.id, "success", None)
                    .await;
                succeeded += 1;
            }
            Err(e) => {
                let retryable = e.is_retryable();
                let disposition = match billing
                    .webhook_queue
                    .mark_failed(row.id, row.attempts, &e.to_string(), retryable)
                    .await
                {
                    Ok(d) => d,
                    Err(mark_err) => {
                        tracing::error!(
                            event_id = %event.id,
                            error = %mark_err,
                            "Failed to record webhook failure"
                        );
                        continue;
                    }
                };

                match disposition {
                    FailureDisposition::Retry(delay) => {
                        tracing::warn!(
                            event_id = %event.id,
                            attempts = row.attempts + 1,
                            retry_in_secs = delay.whole_seconds(),
                            error = %e,
                            "Webhook processing failed, will retry"
                        );
                        retried += 1;
                    }
                    FailureDisposition::DeadLetter => {
                        dead_lettered += 1;
                        handle_dead_letter(billing, pool, &event, &e.to_string()).await;
                    }
                    FailureDisposition::Discard => {
                        let _ = billing
                            .webhooks
                            .mark_event_result(&event.id, "discarded", Some(&e.to_string()))
                            .await;
                        discarded += 1;
                    }
                }
            }
        }
    }

    tracing::info!(
        total = total,
        succeeded = succeeded,
        retried = retried,
        dead_lettered = dead_lettered,
        discarded = discarded,
        "Webhook queue cycle complete"
    );
}

async fn handle_dead_letter(
    billing: &BillingService,
    pool: &PgPool,
    event: &WebhookEvent,
    error: &str,
) {
    tracing::error!(
        event_id = %event.id,
        event_type = %event.kind.as_str(),
        error = %error,
        "Webhook event dead-lettered after exhausting retries - manual intervention required"
    );

    let _ = billing
        .webhooks
        .mark_event_result(&event.id, "error", Some(error))
        .await;

    let logger = BillingEventLogger::new(pool.clone());
    if let Err(e) = logger
        .log_event(
            BillingEventBuilder::unattributed(BillingEventType::WebhookDeadLettered)
                .data(serde_json::json!({
                    "event_type": event.kind.as_str(),
                    "error": error,
                }))
                .stripe_event(&event.id)
                .actor_type(ActorType::System),
        )
        .await
    {
        tracing::warn!(error = %e, "Failed to log dead-letter audit event");
    }

    if let Err(e) = billing
        .email
        .send_operator_alert(
            "Webhook event dead-lettered",
            &format!(
                "Event {} ({}) failed after {} attempts: {}",
                event.id,
                event.kind.as_str(),
                examly_billing::MAX_ATTEMPTS,
                error
            ),
        )
        .await
    {
        tracing::error!(error = %e, "Failed to send dead-letter operator alert");
    }
}

/// Delete finished queue rows past the retention window.
pub async fn cleanup_old_webhooks(billing: &BillingService, keep_days: i64) {
    match billing.webhook_queue.cleanup_old(keep_days).await {
        Ok(deleted) => tracing::info!(deleted = deleted, "Webhook queue cleanup complete"),
        Err(e) => tracing::error!(error = %e, "Webhook queue cleanup failed"),
    }
}
