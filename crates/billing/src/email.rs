//! Outbound billing email
//!
//! Thin client for the Resend HTTP API. Sending is best-effort everywhere:
//! a delivery failure must never roll back a billing state transition.

use serde::Serialize;

use crate::error::{BillingError, BillingResult};

const DEFAULT_BASE_URL: &str = "https://api.resend.com";

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_key: String,
    pub from_address: String,
    pub base_url: String,
    /// Operator inbox for dead-letter and reconciliation alerts.
    pub operator_address: Option<String>,
}

#[derive(Serialize)]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

/// Billing email sender. Disabled cleanly (logs and returns Ok) when no
/// API key is configured, so local development works without Resend.
#[derive(Clone)]
pub struct BillingEmailService {
    config: Option<EmailConfig>,
    client: reqwest::Client,
}

impl BillingEmailService {
    pub fn from_env() -> Self {
        let api_key = std::env::var("RESEND_API_KEY").unwrap_or_default();
        let config = if api_key.is_empty() {
            None
        } else {
            Some(EmailConfig {
                api_key,
                from_address: std::env::var("EMAIL_FROM")
                    .unwrap_or_else(|_| "Examly <billing@examly.io>".to_string()),
                base_url: std::env::var("RESEND_BASE_URL")
                    .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
                operator_address: std::env::var("OPERATOR_EMAIL").ok().filter(|v| !v.is_empty()),
            })
        };

        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn new(config: EmailConfig) -> Self {
        Self {
            config: Some(config),
            client: reqwest::Client::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_some()
    }

    /// Send a single email. Returns Ok(()) without sending when disabled.
    pub async fn send(&self, to: &str, subject: &str, html: &str) -> BillingResult<()> {
        let Some(config) = &self.config else {
            tracing::debug!(to = %to, subject = %subject, "Email disabled, skipping send");
            return Ok(());
        };

        let body = SendEmailRequest {
            from: &config.from_address,
            to: [to],
            subject,
            html,
        };

        let response = self
            .client
            .post(format!("{}/emails", config.base_url))
            .bearer_auth(&config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BillingError::EmailDelivery(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(BillingError::EmailDelivery(format!(
                "{}: {}",
                status, detail
            )));
        }

        tracing::info!(to = %to, subject = %subject, "Email sent");
        Ok(())
    }

    pub async fn send_expiring_soon(
        &self,
        to: &str,
        name: &str,
        end_date: &str,
    ) -> BillingResult<()> {
        let subject = "Your Examly subscription ends soon";
        let html = format!(
            "<p>Hi {},</p>\
             <p>Your Examly Premium subscription is set to end on <strong>{}</strong>. \
             After that your account moves back to the free plan and daily limits apply again.</p>\
             <p>Changed your mind? You can resume your subscription any time before then from \
             your billing settings.</p>",
            name, end_date
        );
        self.send(to, subject, &html).await
    }

    pub async fn send_expired(&self, to: &str, name: &str) -> BillingResult<()> {
        let subject = "Your Examly subscription has ended";
        let html = format!(
            "<p>Hi {},</p>\
             <p>Your Examly Premium subscription has ended and your account is now on the \
             free plan. Your study materials and history are untouched.</p>\
             <p>You can re-subscribe from your billing settings whenever you're ready.</p>",
            name
        );
        self.send(to, subject, &html).await
    }

    pub async fn send_payment_failed(&self, to: &str, name: &str) -> BillingResult<()> {
        let subject = "Payment failed for your Examly subscription";
        let html = format!(
            "<p>Hi {},</p>\
             <p>We couldn't process the latest payment for your Examly Premium subscription. \
             Please update your payment method to keep uninterrupted access.</p>\
             <p>We'll retry automatically over the next few days.</p>",
            name
        );
        self.send(to, subject, &html).await
    }

    pub async fn send_trial_ending(
        &self,
        to: &str,
        name: &str,
        days_remaining: i64,
    ) -> BillingResult<()> {
        let subject = "Your Examly trial ends soon";
        let html = format!(
            "<p>Hi {},</p>\
             <p>Your Examly Premium trial ends in {} day(s). Your saved payment method will \
             be charged when the trial ends, and you can cancel any time before then.</p>",
            name, days_remaining
        );
        self.send(to, subject, &html).await
    }

    pub async fn send_subscription_cancelled(
        &self,
        to: &str,
        name: &str,
        end_date: &str,
    ) -> BillingResult<()> {
        let subject = "Your Examly subscription was cancelled";
        let html = format!(
            "<p>Hi {},</p>\
             <p>Your Examly Premium subscription has been cancelled. You keep full access \
             until <strong>{}</strong>.</p>",
            name, end_date
        );
        self.send(to, subject, &html).await
    }

    pub async fn send_subscription_started(&self, to: &str, name: &str) -> BillingResult<()> {
        let subject = "Welcome to Examly Premium";
        let html = format!(
            "<p>Hi {},</p>\
             <p>Your Examly Premium subscription is active. Unlimited tutor chat, quizzes, \
             and document uploads are now unlocked.</p>",
            name
        );
        self.send(to, subject, &html).await
    }

    /// Operator alert. No-op unless OPERATOR_EMAIL is configured.
    pub async fn send_operator_alert(&self, subject: &str, detail: &str) -> BillingResult<()> {
        let Some(operator) = self
            .config
            .as_ref()
            .and_then(|c| c.operator_address.clone())
        else {
            tracing::warn!(subject = %subject, "No operator email configured for alert");
            return Ok(());
        };

        let html = format!("<p>{}</p>", detail);
        self.send(&operator, subject, &html).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn service_for(base_url: String) -> BillingEmailService {
        BillingEmailService::new(EmailConfig {
            api_key: "re_test_key".into(),
            from_address: "Examly <billing@examly.io>".into(),
            base_url,
            operator_address: Some("ops@examly.io".into()),
        })
    }

    #[tokio::test]
    async fn sends_through_http_api() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/emails")
            .match_header("authorization", "Bearer re_test_key")
            .with_status(200)
            .with_body(r#"{"id":"email_1"}"#)
            .create_async()
            .await;

        let service = service_for(server.url());
        service
            .send("student@example.com", "Hello", "<p>Hi</p>")
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn delivery_failure_surfaces_as_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/emails")
            .with_status(422)
            .with_body(r#"{"message":"invalid to address"}"#)
            .create_async()
            .await;

        let service = service_for(server.url());
        let err = service
            .send("not-an-address", "Hello", "<p>Hi</p>")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::EmailDelivery(_)));
    }

    #[tokio::test]
    async fn disabled_service_is_a_quiet_no_op() {
        let service = BillingEmailService {
            config: None,
            client: reqwest::Client::new(),
        };
        assert!(!service.is_enabled());
        service
            .send("student@example.com", "Hello", "<p>Hi</p>")
            .await
            .unwrap();
    }
}
