//! Consent filtering: maps each event × platform through the visitor's
//! consent state and the per-platform policy table.

use tracing::debug;

use super::{NormalizedEvent, PixelEvent, ProcessedEvent};
use crate::shop::PixelConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentCategory {
    Marketing,
    Analytics,
}

/// The closed per-platform policy table. Platforms not listed here are
/// treated as marketing trackers, the conservative default.
fn platform_category(platform: &str) -> ConsentCategory {
    match platform {
        "google_analytics" => ConsentCategory::Analytics,
        "meta" | "tiktok" | "pinterest" | "snapchat" | "google_ads" | "klaviyo" => {
            ConsentCategory::Marketing
        }
        _ => ConsentCategory::Marketing,
    }
}

/// Platforms whose data sharing is gated on the sale-of-data signal.
fn platform_requires_sale_of_data(platform: &str) -> bool {
    matches!(platform, "meta" | "tiktok" | "pinterest" | "snapchat")
}

/// Resolve the consent category for a config, honoring the per-shop
/// `treatAsMarketing` override.
pub fn consent_category(config: &PixelConfig) -> ConsentCategory {
    if config.treat_as_marketing() {
        return ConsentCategory::Marketing;
    }
    platform_category(&config.platform)
}

/// The destinations an event may be forwarded to under its consent state.
pub fn filter_destinations(event: &PixelEvent, configs: &[PixelConfig]) -> Vec<String> {
    let consent = event.consent.clone().unwrap_or_default();

    configs
        .iter()
        .filter(|config| config.server_side_enabled)
        .filter(|config| {
            if platform_requires_sale_of_data(&config.platform)
                && consent.sale_of_data == Some(false)
            {
                return false;
            }
            match consent_category(config) {
                ConsentCategory::Marketing => consent.marketing == Some(true),
                ConsentCategory::Analytics => consent.analytics == Some(true),
            }
        })
        .map(|config| config.platform.clone())
        .collect()
}

/// Apply the consent filter to a batch; events with zero surviving
/// destinations are dropped from the pipeline.
pub fn apply_consent(
    events: Vec<NormalizedEvent>,
    configs: &[PixelConfig],
) -> (Vec<ProcessedEvent>, usize) {
    let mut kept = Vec::with_capacity(events.len());
    let mut dropped = 0usize;

    for event in events {
        let destinations = filter_destinations(&event.payload, configs);
        if destinations.is_empty() {
            debug!(
                event = event.payload.event_name.as_str(),
                shop = %event.payload.shop_domain,
                "Event has no consented destinations"
            );
            dropped += 1;
            continue;
        }
        kept.push(ProcessedEvent {
            event,
            destinations,
        });
    }

    (kept, dropped)
}
