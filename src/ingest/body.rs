//! Body reading and batch extraction.
//!
//! Pixels POST either a bare event object or an `{events: [...]}` envelope,
//! as `application/json` or (to stay CORS-simple) `text/plain`. The read is
//! bounded; the envelope may carry a body-sourced signature in
//! non-production setups.

use serde_json::Value;

#[derive(Debug, Clone)]
pub struct EnvelopeSignature {
    pub signature: String,
    pub timestamp: Option<i64>,
    pub shop_domain: Option<String>,
}

#[derive(Debug)]
pub struct ParsedBody {
    pub parsed: Value,
    pub raw_events: Vec<Value>,
    pub batch_timestamp: Option<i64>,
    pub envelope_signature: Option<EnvelopeSignature>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyError {
    InvalidJson,
    EmptyBatch,
    BatchTooLarge,
}

impl BodyError {
    pub fn reason(&self) -> &'static str {
        match self {
            BodyError::InvalidJson => "invalid_json",
            BodyError::EmptyBatch => "empty_batch",
            BodyError::BatchTooLarge => "batch_too_large",
        }
    }
}

/// Pixels send `application/json`, or `text/plain` to avoid a preflight.
pub fn content_type_ok(content_type: Option<&str>) -> bool {
    match content_type {
        Some(value) => {
            let value = value.to_ascii_lowercase();
            value.contains("application/json") || value.contains("text/plain")
        }
        None => false,
    }
}

/// Parse the body into a batch. A top-level `{events: [...]}` object is the
/// envelope form; anything else is treated as a single event.
pub fn parse_batch(body: &str, max_batch: usize) -> Result<ParsedBody, BodyError> {
    let parsed: Value = serde_json::from_str(body).map_err(|_| BodyError::InvalidJson)?;

    let (raw_events, batch_timestamp, envelope_signature) = match parsed.as_object() {
        Some(object) if object.contains_key("events") => {
            let events = object
                .get("events")
                .and_then(|v| v.as_array())
                .ok_or(BodyError::InvalidJson)?
                .clone();
            let timestamp = object.get("timestamp").and_then(|v| v.as_i64());
            let signature = object
                .get("signature")
                .and_then(|v| v.as_str())
                .map(|signature| EnvelopeSignature {
                    signature: signature.to_string(),
                    timestamp: object.get("signatureTimestamp").and_then(|v| v.as_i64()),
                    shop_domain: object
                        .get("signatureShopDomain")
                        .and_then(|v| v.as_str())
                        .map(String::from),
                });
            (events, timestamp, signature)
        }
        _ => (vec![parsed.clone()], None, None),
    };

    if raw_events.is_empty() {
        return Err(BodyError::EmptyBatch);
    }
    if raw_events.len() > max_batch {
        return Err(BodyError::BatchTooLarge);
    }

    Ok(ParsedBody {
        parsed,
        raw_events,
        batch_timestamp,
        envelope_signature,
    })
}
