//! Pixel event model: the closed event-name set, consent state, and the
//! normalized shapes produced by the processing pipeline.

pub mod consent;
pub mod dedup;
pub mod normalize;

use serde::{Deserialize, Serialize};

use crate::models::PipelineMode;

/// The closed set of recognized pixel event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    CheckoutCompleted,
    CheckoutStarted,
    CheckoutContactInfoSubmitted,
    CheckoutShippingInfoSubmitted,
    PaymentInfoSubmitted,
    PageViewed,
    ProductViewed,
    ProductAddedToCart,
}

pub const ALLOWED_EVENT_NAMES: [EventName; 8] = [
    EventName::CheckoutCompleted,
    EventName::CheckoutStarted,
    EventName::CheckoutContactInfoSubmitted,
    EventName::CheckoutShippingInfoSubmitted,
    EventName::PaymentInfoSubmitted,
    EventName::PageViewed,
    EventName::ProductViewed,
    EventName::ProductAddedToCart,
];

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::CheckoutCompleted => "checkout_completed",
            EventName::CheckoutStarted => "checkout_started",
            EventName::CheckoutContactInfoSubmitted => "checkout_contact_info_submitted",
            EventName::CheckoutShippingInfoSubmitted => "checkout_shipping_info_submitted",
            EventName::PaymentInfoSubmitted => "payment_info_submitted",
            EventName::PageViewed => "page_viewed",
            EventName::ProductViewed => "product_viewed",
            EventName::ProductAddedToCart => "product_added_to_cart",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        ALLOWED_EVENT_NAMES
            .iter()
            .copied()
            .find(|name| name.as_str() == value)
    }

    /// checkout_completed is the primary conversion event.
    pub fn is_purchase(&self) -> bool {
        matches!(self, EventName::CheckoutCompleted)
    }

    /// The derived event type: `purchase` for checkout_completed, otherwise
    /// the event name itself.
    pub fn event_type(&self) -> &'static str {
        if self.is_purchase() {
            "purchase"
        } else {
            self.as_str()
        }
    }

    /// Whether this event survives the shop's pipeline mode.
    pub fn is_primary_event(&self, mode: PipelineMode) -> bool {
        match mode {
            PipelineMode::PurchaseOnly => self.is_purchase(),
            PipelineMode::FullFunnel => true,
        }
    }
}

/// Tri-state visitor consent as reported by the pixel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marketing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analytics: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sale_of_data: Option<bool>,
}

/// A raw line item as submitted by the pixel. The id aliases reflect the
/// variety of shapes storefront themes emit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
}

/// Sanitized event payload data: only whitelisted keys survive validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkout_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<RawItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
}

/// A validated pixel event, bound to its shop and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PixelEvent {
    pub event_name: EventName,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    pub shop_domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consent: Option<ConsentState>,
    #[serde(default)]
    pub data: EventData,
}

/// A validated event plus its position in the submitted batch. Batch order
/// is significant: duplicate suppression is first-wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedEvent {
    pub payload: PixelEvent,
    pub index: usize,
}

/// A line item after id selection and quantity coercion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedItem {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    pub quantity: u32,
}

/// A pixel event augmented with dedup keys and a deterministic identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEvent {
    pub payload: PixelEvent,
    pub index: usize,
    /// `purchase` for checkout_completed, otherwise the event name.
    pub event_type: String,
    /// Stable key used for purchase dedup; session-scoped for other events.
    pub order_key: String,
    /// Secondary dedup key (checkout-token hash) when an order id is primary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_order_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_identifier: Option<String>,
    /// Deterministic hash: identical inputs always yield the same id.
    pub event_id: String,
    pub items: Vec<NormalizedItem>,
}

impl NormalizedEvent {
    pub fn is_purchase(&self) -> bool {
        self.payload.event_name.is_purchase()
    }

    /// All keys that identify this purchase for dedup purposes.
    pub fn purchase_keys(&self) -> Vec<&str> {
        let mut keys = vec![self.order_key.as_str()];
        if let Some(alt) = self.alt_order_key.as_deref() {
            keys.push(alt);
        }
        keys
    }
}

/// An event that survived dedup and consent filtering, with its resolved
/// destination platforms.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedEvent {
    pub event: NormalizedEvent,
    pub destinations: Vec<String>,
}
