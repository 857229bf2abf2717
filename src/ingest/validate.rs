//! Event validation and payload sanitization.
//!
//! Structural and semantic checks run per event in batch index order. The
//! first event failing rejects the whole batch; later failures are skipped
//! with a warning. `data` is rebuilt from a whitelist of known keys with
//! types coerced, so nothing the pixel invents travels further than this
//! stage.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::events::{ConsentState, EventData, EventName, PixelEvent, RawItem, ValidatedEvent};

const MAX_ORDER_ID_LEN: usize = 256;
const MAX_URL_LEN: usize = 2048;

lazy_static! {
    static ref SHOP_DOMAIN_RE: Regex =
        Regex::new(r"^[a-z0-9][a-z0-9-]*\.myshopify\.com$").unwrap();
    static ref ORDER_ID_RE: Regex = Regex::new(r"^[A-Za-z0-9_.:/-]+$").unwrap();
    static ref CHECKOUT_TOKEN_RE: Regex = Regex::new(r"^[A-Za-z0-9_-]{1,128}$").unwrap();
    static ref CURRENCY_RE: Regex = Regex::new(r"^[A-Z]{3}$").unwrap();
    static ref NONCE_RE: Regex = Regex::new(r"^[A-Za-z0-9_-]{1,128}$").unwrap();
}

/// Why an entire batch was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchRejection {
    FirstEventInvalid(String),
    NoValidEvents,
    /// Events within one batch disagree on shopDomain.
    MixedShopDomains { first: String, other: String },
    /// The x-shopify-shop-domain header disagrees with the payload.
    HeaderDomainMismatch { header: String, payload: String },
}

#[derive(Debug)]
pub struct ValidationOutcome {
    pub events: Vec<ValidatedEvent>,
    pub skipped: usize,
    /// The shop domain every event in the batch resolved to.
    pub shop_domain: String,
}

fn string_field<'a>(raw: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| raw.get(*key).and_then(Value::as_str))
}

fn number_field(raw: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| raw.get(*key).and_then(Value::as_f64))
}

/// Accept either a string or a bare number for id-like fields.
fn id_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn sanitize_item(raw: &Value) -> Option<RawItem> {
    let object = raw.as_object()?;
    let pick = |keys: [&str; 2]| {
        keys.iter()
            .find_map(|key| object.get(*key))
            .and_then(id_value)
    };
    Some(RawItem {
        variant_id: pick(["variantId", "variant_id"]),
        product_id: pick(["productId", "product_id"]),
        id: object.get("id").and_then(id_value),
        name: object.get("name").and_then(Value::as_str).map(String::from),
        price: object.get("price").and_then(Value::as_f64),
        quantity: object.get("quantity").and_then(Value::as_f64),
    })
}

fn sanitize_consent(raw: &Value) -> Option<ConsentState> {
    let object = raw.as_object()?;
    let flag = |keys: &[&str]| {
        keys.iter()
            .find_map(|key| object.get(*key))
            .and_then(Value::as_bool)
    };
    Some(ConsentState {
        marketing: flag(&["marketing"]),
        analytics: flag(&["analytics"]),
        sale_of_data: flag(&["saleOfData", "sale_of_data"]),
    })
}

fn sanitize_data(raw: Option<&Value>) -> Result<EventData, String> {
    let Some(raw) = raw else {
        return Ok(EventData::default());
    };
    let Some(object) = raw.as_object() else {
        return Err("data_not_object".to_string());
    };

    let order_id = match string_field(raw, &["orderId", "order_id"]) {
        Some(order_id) => {
            let order_id = order_id.trim();
            if order_id.len() > MAX_ORDER_ID_LEN || !ORDER_ID_RE.is_match(order_id) {
                return Err("invalid_order_id".to_string());
            }
            Some(order_id.to_string())
        }
        None => None,
    };

    let checkout_token = match string_field(raw, &["checkoutToken", "checkout_token"]) {
        Some(token) => {
            let token = token.trim();
            if !CHECKOUT_TOKEN_RE.is_match(token) {
                return Err("invalid_checkout_token".to_string());
            }
            Some(token.to_string())
        }
        None => None,
    };

    let value = match number_field(raw, &["value", "total"]) {
        Some(value) => {
            if !value.is_finite() || value < 0.0 {
                return Err("invalid_value".to_string());
            }
            Some(value)
        }
        None => None,
    };

    let currency = match string_field(raw, &["currency"]) {
        Some(currency) => {
            let currency = currency.trim().to_ascii_uppercase();
            if !CURRENCY_RE.is_match(&currency) {
                return Err("invalid_currency".to_string());
            }
            Some(currency)
        }
        None => None,
    };

    let items = object
        .get("items")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(sanitize_item).collect::<Vec<_>>())
        .filter(|items: &Vec<RawItem>| !items.is_empty());

    let url_field = |keys: &[&str]| {
        string_field(raw, keys)
            .map(str::trim)
            .filter(|v| !v.is_empty() && v.len() <= MAX_URL_LEN)
            .map(String::from)
    };

    Ok(EventData {
        order_id,
        checkout_token,
        value,
        currency,
        items,
        page_url: url_field(&["pageUrl", "page_url"]),
        referrer: url_field(&["referrer"]),
    })
}

/// Validate one raw event into a `PixelEvent`.
pub fn validate_event(raw: &Value) -> Result<PixelEvent, String> {
    if !raw.is_object() {
        return Err("event_not_object".to_string());
    }

    let event_name = string_field(raw, &["eventName", "event_name"])
        .ok_or_else(|| "missing_event_name".to_string())?;
    let event_name =
        EventName::parse(event_name).ok_or_else(|| "unknown_event_name".to_string())?;

    let timestamp = raw
        .get("timestamp")
        .or_else(|| raw.get("ts"))
        .and_then(Value::as_i64)
        .ok_or_else(|| "missing_timestamp".to_string())?;
    if timestamp <= 0 {
        return Err("invalid_timestamp".to_string());
    }

    let shop_domain = string_field(raw, &["shopDomain", "shop_domain"])
        .ok_or_else(|| "missing_shop_domain".to_string())?
        .trim()
        .to_ascii_lowercase();
    if !SHOP_DOMAIN_RE.is_match(&shop_domain) {
        return Err("invalid_shop_domain".to_string());
    }

    let data = sanitize_data(raw.get("data"))?;

    if event_name.is_purchase() && data.order_id.is_none() && data.checkout_token.is_none() {
        return Err("purchase_missing_order_reference".to_string());
    }

    let nonce = string_field(raw, &["nonce"])
        .map(str::trim)
        .filter(|nonce| NONCE_RE.is_match(nonce))
        .map(String::from);

    let consent = raw.get("consent").and_then(sanitize_consent);

    Ok(PixelEvent {
        event_name,
        timestamp,
        shop_domain,
        nonce,
        consent,
        data,
    })
}

/// Validate a batch in index order, enforcing the single-shop invariant and
/// the header cross-check.
pub fn validate_batch(
    raw_events: &[Value],
    shop_domain_header: Option<&str>,
    is_production: bool,
    request_id: &str,
) -> Result<ValidationOutcome, BatchRejection> {
    let mut events: Vec<ValidatedEvent> = Vec::with_capacity(raw_events.len());
    let mut skipped = 0usize;

    for (index, raw) in raw_events.iter().enumerate() {
        match validate_event(raw) {
            Ok(payload) => events.push(ValidatedEvent { payload, index }),
            Err(reason) if index == 0 => {
                return Err(BatchRejection::FirstEventInvalid(reason));
            }
            Err(reason) => {
                warn!(request_id, index, reason, "Skipping invalid event");
                skipped += 1;
            }
        }
    }

    let Some(first) = events.first() else {
        return Err(BatchRejection::NoValidEvents);
    };
    let shop_domain = first.payload.shop_domain.clone();

    for event in &events[1..] {
        if event.payload.shop_domain != shop_domain {
            return Err(BatchRejection::MixedShopDomains {
                first: shop_domain,
                other: event.payload.shop_domain.clone(),
            });
        }
    }

    if let Some(header) = shop_domain_header {
        let header = header.trim().to_ascii_lowercase();
        if header != "unknown" && header != shop_domain {
            if is_production {
                return Err(BatchRejection::HeaderDomainMismatch {
                    header,
                    payload: shop_domain,
                });
            }
            warn!(
                request_id,
                header = %header,
                payload = %shop_domain,
                "Shop-domain header mismatch (tolerated outside production)"
            );
        }
    }

    Ok(ValidationOutcome {
        events,
        skipped,
        shop_domain,
    })
}
