//! HMAC-SHA-256 batch signature verification.
//!
//! The signed message is `"{timestamp}:{shopDomain}:{bodyHash}"` where
//! `bodyHash` is the hex sha-256 of the exact request bytes. Body-envelope
//! signatures hash the envelope with the three carrier fields removed.
//! Verification tries the shop's secrets in priority order: current, then
//! previous (inside its grace window), then pending. The comparison is
//! constant time.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::models::SignatureSource;
use crate::shop::Shop;

type HmacSha256 = Hmac<Sha256>;

pub const MAX_SIGNATURE_LEN: usize = 256;

const CARRIER_FIELDS: [&str; 3] = ["signature", "signatureTimestamp", "signatureShopDomain"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HmacErrorCode {
    MissingSignature,
    InvalidSignature,
    MissingTimestampHeader,
    TimestampMismatch,
    TimestampOutOfWindow,
    ShopDomainMismatch,
    SecretMissing,
}

impl HmacErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HmacErrorCode::MissingSignature => "missing_signature",
            HmacErrorCode::InvalidSignature => "invalid_signature",
            HmacErrorCode::MissingTimestampHeader => "missing_timestamp_header",
            HmacErrorCode::TimestampMismatch => "timestamp_mismatch",
            HmacErrorCode::TimestampOutOfWindow => "timestamp_out_of_window",
            HmacErrorCode::ShopDomainMismatch => "shop_domain_mismatch",
            HmacErrorCode::SecretMissing => "secret_missing",
        }
    }
}

/// Which secret slot produced a match. Logged; the secret itself never is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretSlot {
    Current,
    Previous,
    Pending,
}

impl SecretSlot {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretSlot::Current => "current",
            SecretSlot::Previous => "previous",
            SecretSlot::Pending => "pending",
        }
    }
}

#[derive(Debug)]
pub enum VerifyOutcome {
    Verified { slot: SecretSlot },
    Failed { code: HmacErrorCode, detail: Option<String> },
}

/// Everything the verifier needs, already extracted from the request.
#[derive(Debug)]
pub struct SignatureInput<'a> {
    pub signature: Option<&'a str>,
    pub source: SignatureSource,
    /// Timestamp the client signed over: the header value for header-sourced
    /// signatures, `signatureTimestamp` for body-sourced ones.
    pub signature_timestamp: Option<i64>,
    /// The batch envelope timestamp, when the envelope carried one.
    pub batch_timestamp: Option<i64>,
    /// `signatureShopDomain` for body-sourced signatures.
    pub signed_shop_domain: Option<&'a str>,
    pub shop_domain: &'a str,
    /// Hex sha-256 of the signed bytes, per the signature source.
    pub body_hash: &'a str,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash for header-sourced signatures: the exact request bytes.
pub fn body_hash(body: &[u8]) -> String {
    sha256_hex(body)
}

/// Hash for body-sourced signatures: the envelope minus the carrier fields,
/// re-serialized canonically (serde_json sorts object keys).
pub fn canonical_body_hash(envelope: &serde_json::Value) -> String {
    let mut stripped = envelope.clone();
    if let Some(map) = stripped.as_object_mut() {
        for field in CARRIER_FIELDS {
            map.remove(field);
        }
    }
    sha256_hex(stripped.to_string().as_bytes())
}

pub fn signed_message(timestamp: i64, shop_domain: &str, body_hash: &str) -> String {
    format!("{timestamp}:{shop_domain}:{body_hash}")
}

/// Compute the hex signature a client would send. Test and tooling helper.
pub fn compute_signature(secret: &str, timestamp: i64, shop_domain: &str, body_hash: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(signed_message(timestamp, shop_domain, body_hash).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn is_plausible_signature(signature: &str) -> bool {
    !signature.is_empty()
        && signature.len() <= MAX_SIGNATURE_LEN
        && signature.len() % 2 == 0
        && signature.chars().all(|c| c.is_ascii_hexdigit())
}

fn slot_matches(secret: &str, message: &str, provided: &[u8]) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(message.as_bytes());
    // verify_slice is a constant-time comparison.
    mac.verify_slice(provided).is_ok()
}

/// Run the full validation sequence, failing fast with the first violated
/// check's error code.
pub fn verify_signature(
    input: &SignatureInput<'_>,
    shop: &Shop,
    now_ms: i64,
    window_ms: i64,
) -> VerifyOutcome {
    let Some(signature) = input.signature else {
        return VerifyOutcome::Failed {
            code: HmacErrorCode::MissingSignature,
            detail: None,
        };
    };

    if !is_plausible_signature(signature) {
        return VerifyOutcome::Failed {
            code: HmacErrorCode::InvalidSignature,
            detail: Some("signature is not hex or exceeds length cap".to_string()),
        };
    }

    let Some(timestamp) = input.signature_timestamp else {
        return VerifyOutcome::Failed {
            code: HmacErrorCode::MissingTimestampHeader,
            detail: None,
        };
    };

    // Header-sourced signatures must agree with the payload timestamp.
    // Body-sourced signatures carry their own timestamp, so no cross-check.
    if input.source == SignatureSource::Header {
        if let Some(batch_ts) = input.batch_timestamp {
            if batch_ts != timestamp {
                return VerifyOutcome::Failed {
                    code: HmacErrorCode::TimestampMismatch,
                    detail: Some(format!("header={timestamp} payload={batch_ts}")),
                };
            }
        }
    }

    if (now_ms - timestamp).abs() > window_ms {
        return VerifyOutcome::Failed {
            code: HmacErrorCode::TimestampOutOfWindow,
            detail: Some(format!("skew={}ms window={}ms", (now_ms - timestamp).abs(), window_ms)),
        };
    }

    if input.source == SignatureSource::Body {
        match input.signed_shop_domain {
            Some(signed) if signed == input.shop_domain => {}
            signed => {
                return VerifyOutcome::Failed {
                    code: HmacErrorCode::ShopDomainMismatch,
                    detail: Some(format!(
                        "signed={} resolved={}",
                        signed.unwrap_or("<absent>"),
                        input.shop_domain
                    )),
                };
            }
        }
    }

    if shop.current_secret.is_none() {
        return VerifyOutcome::Failed {
            code: HmacErrorCode::SecretMissing,
            detail: None,
        };
    }

    let Ok(provided) = hex::decode(signature) else {
        return VerifyOutcome::Failed {
            code: HmacErrorCode::InvalidSignature,
            detail: None,
        };
    };

    let message = signed_message(timestamp, input.shop_domain, input.body_hash);

    let slots = [
        (SecretSlot::Current, shop.current_secret.as_deref()),
        (SecretSlot::Previous, shop.previous_secret.as_deref()),
        (SecretSlot::Pending, shop.pending_secret.as_deref()),
    ];
    for (slot, secret) in slots {
        let Some(secret) = secret else { continue };
        if slot_matches(secret, &message, &provided) {
            debug!(
                shop = %shop.shop_domain,
                slot = slot.as_str(),
                "HMAC verified"
            );
            return VerifyOutcome::Verified { slot };
        }
    }

    VerifyOutcome::Failed {
        code: HmacErrorCode::InvalidSignature,
        detail: None,
    }
}
