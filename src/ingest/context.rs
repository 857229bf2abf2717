//! Per-request context.
//!
//! Built once from headers and environment, then threaded through the stage
//! chain. Stages populate fields as they run; once set, later stages read
//! but never contradict them.

use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;
use rand::Rng;
use serde_json::Value;

use crate::events::ValidatedEvent;
use crate::models::{now_ms, Config, Environment, KeyValidation, PipelineMode, SignatureSource};
use crate::shop::{PixelConfig, Shop};

pub const SIGNATURE_HEADER: &str = "x-tracking-guardian-signature";
pub const TIMESTAMP_HEADER: &str = "x-tracking-guardian-timestamp";
pub const SHOP_DOMAIN_HEADER: &str = "x-shopify-shop-domain";

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub received_at: i64,
    pub is_production: bool,
    pub strict_origin: bool,
    pub allow_unsigned: bool,
    pub client_ip: IpAddr,
    pub user_agent: Option<String>,
    /// Raw Origin header value; `None` when absent or literally "null".
    pub origin: Option<String>,
    pub origin_header_present: bool,
    pub is_null_origin: bool,
    pub referer: Option<String>,
    pub signature: Option<String>,
    pub signature_source: SignatureSource,
    pub timestamp_header: Option<String>,
    pub parsed_timestamp: Option<i64>,
    pub shop_domain_header: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<usize>,
    pub body: Option<String>,
    pub parsed_body: Option<Value>,
    /// Hex sha-256 of the signed bytes, per the signature source.
    pub body_hash: Option<String>,
    pub raw_events: Vec<Value>,
    pub batch_timestamp: Option<i64>,
    pub envelope_signature_timestamp: Option<i64>,
    pub envelope_shop_domain: Option<String>,
    pub validated_events: Vec<ValidatedEvent>,
    pub shop_domain: Option<String>,
    pub environment: Environment,
    pub shop: Option<Shop>,
    pub key_validation: Option<KeyValidation>,
    pub mode: Option<PipelineMode>,
    pub enabled_pixel_configs: Vec<PixelConfig>,
}

impl RequestContext {
    pub fn from_request(headers: &HeaderMap, remote: SocketAddr, config: &Config) -> Self {
        let received_at = now_ms();

        let origin_raw = header_string(headers, "origin");
        let origin_header_present = origin_raw.is_some();
        let is_null_origin = origin_raw.as_deref() == Some("null");
        let origin = origin_raw.filter(|o| o != "null");

        let signature = header_string(headers, SIGNATURE_HEADER);
        let signature_source = if signature.is_some() {
            SignatureSource::Header
        } else {
            SignatureSource::None
        };

        let timestamp_header = header_string(headers, TIMESTAMP_HEADER);
        let parsed_timestamp = timestamp_header
            .as_deref()
            .and_then(|v| v.trim().parse::<i64>().ok());

        let content_length = header_string(headers, "content-length")
            .and_then(|v| v.trim().parse::<usize>().ok());

        Self {
            request_id: new_request_id(received_at),
            received_at,
            is_production: config.is_production,
            strict_origin: config.strict_origin,
            allow_unsigned: config.allow_unsigned,
            client_ip: client_ip(headers, remote),
            user_agent: header_string(headers, "user-agent"),
            origin,
            origin_header_present,
            is_null_origin,
            referer: header_string(headers, "referer"),
            signature,
            signature_source,
            timestamp_header,
            parsed_timestamp,
            shop_domain_header: header_string(headers, SHOP_DOMAIN_HEADER),
            content_type: header_string(headers, "content-type"),
            content_length,
            body: None,
            parsed_body: None,
            body_hash: None,
            raw_events: Vec::new(),
            batch_timestamp: None,
            envelope_signature_timestamp: None,
            envelope_shop_domain: None,
            validated_events: Vec::new(),
            shop_domain: None,
            environment: config.default_environment(),
            shop: None,
            key_validation: None,
            mode: None,
            enabled_pixel_configs: Vec::new(),
        }
    }

    pub fn has_signature(&self) -> bool {
        self.signature.is_some()
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

/// Prefer the first X-Forwarded-For hop when the edge proxy sets one.
fn client_ip(headers: &HeaderMap, remote: SocketAddr) -> IpAddr {
    header_string(headers, "x-forwarded-for")
        .and_then(|chain| {
            chain
                .split(',')
                .next()
                .and_then(|first| first.trim().parse::<IpAddr>().ok())
        })
        .unwrap_or_else(|| remote.ip())
}

/// Sortable request id: 48 bits of millisecond time followed by 80 random
/// bits, hex encoded.
pub fn new_request_id(now_ms: i64) -> String {
    let random: u128 = rand::thread_rng().gen();
    format!(
        "{:012x}{:020x}",
        (now_ms as u64) & 0xffff_ffff_ffff,
        random & 0xffff_ffff_ffff_ffff_ffff
    )
}

#[cfg(test)]
pub fn test_remote() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::new(203, 0, 113, 9)), 4321)
}
