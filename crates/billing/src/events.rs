//! Typed webhook event envelope
//!
//! Raw provider JSON is parsed exactly once, at the boundary, into a tagged
//! union over event type. Business logic never sees loose maps. Unknown
//! event types are preserved (and later acknowledged), unknown shapes for
//! known types are rejected here.

use serde::Deserialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Webhook event types we handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    TrialWillEnd,
    InvoicePaymentSucceeded,
    InvoicePaymentFailed,
    Unknown(String),
}

impl From<&str> for EventKind {
    fn from(s: &str) -> Self {
        match s {
            "customer.subscription.created" => Self::SubscriptionCreated,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "customer.subscription.trial_will_end" => Self::TrialWillEnd,
            "invoice.payment_succeeded" | "invoice.paid" => Self::InvoicePaymentSucceeded,
            "invoice.payment_failed" => Self::InvoicePaymentFailed,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::SubscriptionCreated => "customer.subscription.created",
            Self::SubscriptionUpdated => "customer.subscription.updated",
            Self::SubscriptionDeleted => "customer.subscription.deleted",
            Self::TrialWillEnd => "customer.subscription.trial_will_end",
            Self::InvoicePaymentSucceeded => "invoice.payment_succeeded",
            Self::InvoicePaymentFailed => "invoice.payment_failed",
            Self::Unknown(s) => s.as_str(),
        }
    }
}

/// A parsed, verified webhook event.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    /// Provider event id (idempotency key)
    pub id: String,
    pub kind: EventKind,
    /// Provider-assigned creation time; the ordering authority
    pub created: OffsetDateTime,
    pub data: EventData,
}

/// Payload variants, one per event family.
#[derive(Debug, Clone)]
pub enum EventData {
    Subscription(SubscriptionPayload),
    Invoice(InvoicePayload),
    Unknown,
}

/// Subscription object fields we reconcile.
#[derive(Debug, Clone)]
pub struct SubscriptionPayload {
    pub subscription_id: String,
    pub customer_id: String,
    pub status: String,
    pub price_id: Option<String>,
    pub items: Vec<SubscriptionItemPayload>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct SubscriptionItemPayload {
    pub item_id: String,
    pub price_id: String,
    pub quantity: i64,
}

/// Invoice object fields we persist.
#[derive(Debug, Clone)]
pub struct InvoicePayload {
    pub invoice_id: String,
    pub customer_id: String,
    pub subscription_id: Option<String>,
    pub status: String,
    pub amount_paid_cents: i64,
    pub amount_due_cents: i64,
    pub currency: String,
    pub hosted_invoice_url: Option<String>,
    pub invoice_pdf_url: Option<String>,
}

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: RawEventData,
}

#[derive(Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

#[derive(Deserialize)]
struct RawSubscription {
    id: String,
    customer: RawExpandable,
    status: String,
    #[serde(default)]
    items: RawItemList,
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
    trial_start: Option<i64>,
    trial_end: Option<i64>,
    #[serde(default)]
    cancel_at_period_end: bool,
    canceled_at: Option<i64>,
}

#[derive(Deserialize, Default)]
struct RawItemList {
    #[serde(default)]
    data: Vec<RawItem>,
}

#[derive(Deserialize)]
struct RawItem {
    id: String,
    price: RawPrice,
    #[serde(default = "default_quantity")]
    quantity: i64,
}

fn default_quantity() -> i64 {
    1
}

#[derive(Deserialize)]
struct RawPrice {
    id: String,
}

#[derive(Deserialize)]
struct RawInvoice {
    id: String,
    customer: RawExpandable,
    subscription: Option<RawExpandable>,
    status: Option<String>,
    #[serde(default)]
    amount_paid: i64,
    #[serde(default)]
    amount_due: i64,
    #[serde(default = "default_currency")]
    currency: String,
    hosted_invoice_url: Option<String>,
    invoice_pdf: Option<String>,
}

fn default_currency() -> String {
    "usd".to_string()
}

/// Stripe expands related objects inline or sends just the id.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawExpandable {
    Id(String),
    Object { id: String },
}

impl RawExpandable {
    fn into_id(self) -> String {
        match self {
            RawExpandable::Id(id) => id,
            RawExpandable::Object { id } => id,
        }
    }
}

fn unix_ts(ts: i64) -> BillingResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts)
        .map_err(|_| BillingError::InvalidPayload(format!("timestamp {} out of range", ts)))
}

fn opt_unix_ts(ts: Option<i64>) -> BillingResult<Option<OffsetDateTime>> {
    ts.map(unix_ts).transpose()
}

impl WebhookEvent {
    /// Parse a raw (already signature-verified) payload into the envelope.
    pub fn parse(payload: &str) -> BillingResult<WebhookEvent> {
        let raw: RawEvent = serde_json::from_str(payload)
            .map_err(|e| BillingError::InvalidPayload(e.to_string()))?;

        let kind = EventKind::from(raw.event_type.as_str());
        let created = unix_ts(raw.created)?;

        let data = match &kind {
            EventKind::SubscriptionCreated
            | EventKind::SubscriptionUpdated
            | EventKind::SubscriptionDeleted
            | EventKind::TrialWillEnd => {
                let sub: RawSubscription = serde_json::from_value(raw.data.object)
                    .map_err(|e| BillingError::InvalidPayload(e.to_string()))?;
                EventData::Subscription(SubscriptionPayload {
                    subscription_id: sub.id,
                    customer_id: sub.customer.into_id(),
                    status: sub.status,
                    price_id: sub.items.data.first().map(|i| i.price.id.clone()),
                    items: sub
                        .items
                        .data
                        .into_iter()
                        .map(|i| SubscriptionItemPayload {
                            item_id: i.id,
                            price_id: i.price.id,
                            quantity: i.quantity,
                        })
                        .collect(),
                    current_period_start: opt_unix_ts(sub.current_period_start)?,
                    current_period_end: opt_unix_ts(sub.current_period_end)?,
                    trial_start: opt_unix_ts(sub.trial_start)?,
                    trial_end: opt_unix_ts(sub.trial_end)?,
                    cancel_at_period_end: sub.cancel_at_period_end,
                    canceled_at: opt_unix_ts(sub.canceled_at)?,
                })
            }
            EventKind::InvoicePaymentSucceeded | EventKind::InvoicePaymentFailed => {
                let inv: RawInvoice = serde_json::from_value(raw.data.object)
                    .map_err(|e| BillingError::InvalidPayload(e.to_string()))?;
                EventData::Invoice(InvoicePayload {
                    invoice_id: inv.id,
                    customer_id: inv.customer.into_id(),
                    subscription_id: inv.subscription.map(RawExpandable::into_id),
                    status: inv.status.unwrap_or_else(|| "open".to_string()),
                    amount_paid_cents: inv.amount_paid,
                    amount_due_cents: inv.amount_due,
                    currency: inv.currency,
                    hosted_invoice_url: inv.hosted_invoice_url,
                    invoice_pdf_url: inv.invoice_pdf,
                })
            }
            EventKind::Unknown(_) => EventData::Unknown,
        };

        Ok(WebhookEvent {
            id: raw.id,
            kind,
            created,
            data,
        })
    }

    pub fn subscription(&self) -> BillingResult<&SubscriptionPayload> {
        match &self.data {
            EventData::Subscription(s) => Ok(s),
            _ => Err(BillingError::InvalidPayload(
                "expected subscription object".to_string(),
            )),
        }
    }

    pub fn invoice(&self) -> BillingResult<&InvoicePayload> {
        match &self.data {
            EventData::Invoice(i) => Ok(i),
            _ => Err(BillingError::InvalidPayload(
                "expected invoice object".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription_event_json() -> String {
        r#"{
            "id": "evt_1",
            "type": "customer.subscription.created",
            "created": 1717000000,
            "data": {
                "object": {
                    "id": "sub_1",
                    "customer": "cus_1",
                    "status": "trialing",
                    "items": {
                        "data": [
                            {"id": "si_1", "price": {"id": "price_pm"}, "quantity": 1}
                        ]
                    },
                    "current_period_start": 1717000000,
                    "current_period_end": 1719592000,
                    "trial_start": 1717000000,
                    "trial_end": 1718209600,
                    "cancel_at_period_end": false,
                    "canceled_at": null
                }
            }
        }"#
        .to_string()
    }

    #[test]
    fn parses_subscription_event() {
        let event = WebhookEvent::parse(&subscription_event_json()).unwrap();
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.kind, EventKind::SubscriptionCreated);
        let sub = event.subscription().unwrap();
        assert_eq!(sub.subscription_id, "sub_1");
        assert_eq!(sub.customer_id, "cus_1");
        assert_eq!(sub.status, "trialing");
        assert_eq!(sub.price_id.as_deref(), Some("price_pm"));
        assert_eq!(sub.items.len(), 1);
        assert!(sub.trial_end.is_some());
    }

    #[test]
    fn parses_invoice_event_with_expanded_customer() {
        let json = r#"{
            "id": "evt_2",
            "type": "invoice.payment_failed",
            "created": 1717000500,
            "data": {
                "object": {
                    "id": "in_1",
                    "customer": {"id": "cus_1", "email": "x@y.z"},
                    "subscription": "sub_1",
                    "status": "open",
                    "amount_paid": 0,
                    "amount_due": 1499,
                    "currency": "usd",
                    "hosted_invoice_url": "https://pay.stripe.com/in_1",
                    "invoice_pdf": null
                }
            }
        }"#;
        let event = WebhookEvent::parse(json).unwrap();
        assert_eq!(event.kind, EventKind::InvoicePaymentFailed);
        let inv = event.invoice().unwrap();
        assert_eq!(inv.customer_id, "cus_1");
        assert_eq!(inv.subscription_id.as_deref(), Some("sub_1"));
        assert_eq!(inv.amount_due_cents, 1499);
    }

    #[test]
    fn unknown_event_type_is_preserved_not_rejected() {
        let json = r#"{
            "id": "evt_3",
            "type": "charge.dispute.created",
            "created": 1717000000,
            "data": {"object": {"id": "dp_1"}}
        }"#;
        let event = WebhookEvent::parse(json).unwrap();
        assert_eq!(
            event.kind,
            EventKind::Unknown("charge.dispute.created".to_string())
        );
        assert!(matches!(event.data, EventData::Unknown));
    }

    #[test]
    fn malformed_payload_is_rejected() {
        assert!(matches!(
            WebhookEvent::parse("{not json"),
            Err(BillingError::InvalidPayload(_))
        ));
        // Known type with a wrong-shaped object is also a validation failure
        let json = r#"{
            "id": "evt_4",
            "type": "customer.subscription.updated",
            "created": 1717000000,
            "data": {"object": {"id": "sub_1"}}
        }"#;
        assert!(matches!(
            WebhookEvent::parse(json),
            Err(BillingError::InvalidPayload(_))
        ));
    }

    #[test]
    fn invoice_paid_alias_maps_to_payment_succeeded() {
        assert_eq!(
            EventKind::from("invoice.paid"),
            EventKind::InvoicePaymentSucceeded
        );
    }
}
