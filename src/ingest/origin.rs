//! Origin validation.
//!
//! Two passes: a cheap pre-body check against the static Shopify allowlist,
//! and a post-shop check against the shop's own domain set. Unsigned
//! requests from unknown origins are cut early; signed requests from a
//! custom storefront domain are deferred to the post-shop pass, which knows
//! the shop's domains.

use std::collections::HashSet;

use crate::models::Config;

const STATIC_ALLOWED_HOSTS: [&str; 4] = [
    "checkout.shopify.com",
    "admin.shopify.com",
    "pay.shopify.com",
    "shop.app",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginDecision {
    Allow,
    /// Allowed, but worth a log line (dev leniency, deferred check).
    AllowLogged(&'static str),
    Reject(&'static str),
}

/// Host portion of an Origin header value, lowercased, port stripped.
pub fn origin_host(origin: &str) -> Option<String> {
    let rest = origin
        .strip_prefix("https://")
        .or_else(|| origin.strip_prefix("http://"))
        .unwrap_or(origin);
    let host = rest
        .split('/')
        .next()?
        .split(':')
        .next()?
        .trim()
        .to_ascii_lowercase();
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

pub fn is_static_allowed_host(host: &str) -> bool {
    STATIC_ALLOWED_HOSTS.contains(&host) || host.ends_with(".myshopify.com")
}

/// Pre-body pass: static allowlist only.
pub fn check_pre_body(
    origin: Option<&str>,
    origin_header_present: bool,
    is_null_origin: bool,
    signed: bool,
    config: &Config,
) -> OriginDecision {
    if !origin_header_present || is_null_origin {
        if signed || config.allow_null_origin {
            return OriginDecision::Allow;
        }
        return if config.is_production {
            OriginDecision::Reject("null_origin")
        } else {
            OriginDecision::AllowLogged("null_origin_dev")
        };
    }

    let Some(host) = origin.and_then(origin_host) else {
        return if config.is_production {
            OriginDecision::Reject("unparseable_origin")
        } else {
            OriginDecision::AllowLogged("unparseable_origin_dev")
        };
    };

    if is_static_allowed_host(&host) {
        return OriginDecision::Allow;
    }

    if signed {
        // The shop's own storefront domains are only known post-shop.
        return OriginDecision::AllowLogged("origin_pending_shop_check");
    }

    if config.is_production {
        OriginDecision::Reject("origin_not_allowed")
    } else {
        OriginDecision::AllowLogged("origin_not_allowed_dev")
    }
}

/// Post-shop pass: static allowlist plus the shop's domain set.
pub fn check_post_shop(
    origin: Option<&str>,
    origin_header_present: bool,
    is_null_origin: bool,
    signed: bool,
    shop_hosts: &HashSet<String>,
    config: &Config,
) -> OriginDecision {
    if !origin_header_present || is_null_origin {
        // Null-origin policy was settled pre-body.
        return OriginDecision::Allow;
    }

    let Some(host) = origin.and_then(origin_host) else {
        return OriginDecision::Allow;
    };

    if is_static_allowed_host(&host) || shop_hosts.contains(&host) {
        return OriginDecision::Allow;
    }

    if signed && !config.strict_origin && !config.is_production {
        return OriginDecision::AllowLogged("origin_outside_allowlist");
    }

    OriginDecision::Reject("origin_not_allowed")
}
