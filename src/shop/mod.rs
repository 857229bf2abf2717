//! Shop model: the authenticated tenant a pixel batch is bound to, its
//! rotating signing secrets, domains, and pixel destinations.

pub mod store;

pub use store::ShopStore;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::PipelineMode;

/// One configured pixel destination for a shop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PixelConfig {
    pub id: i64,
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_id: Option<String>,
    pub client_side_enabled: bool,
    pub server_side_enabled: bool,
    #[serde(default)]
    pub client_config: serde_json::Value,
}

impl PixelConfig {
    pub fn treat_as_marketing(&self) -> bool {
        self.client_config
            .get("treatAsMarketing")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    fn mode(&self) -> Option<&str> {
        self.client_config.get("mode").and_then(|v| v.as_str())
    }

    fn is_active(&self) -> bool {
        self.client_side_enabled || self.server_side_enabled
    }
}

/// A shop loaded for one request, secrets already decrypted.
#[derive(Debug, Clone)]
pub struct Shop {
    pub id: i64,
    pub shop_domain: String,
    pub is_active: bool,
    pub current_secret: Option<String>,
    pub previous_secret: Option<String>,
    pub previous_secret_expires_at: Option<i64>,
    pub pending_secret: Option<String>,
    pub pending_secret_expires_at: Option<i64>,
    pub pending_match_count: i64,
    pub primary_domain: Option<String>,
    pub storefront_domains: Vec<String>,
    pub pixel_configs: Vec<PixelConfig>,
}

impl Shop {
    /// Null out secondary secrets whose expiry has passed. Runs once at
    /// load time so the HMAC validator never sees a stale secret.
    pub fn expire_secondary_secrets(&mut self, now_ms: i64) {
        if let Some(expiry) = self.previous_secret_expires_at {
            if expiry <= now_ms && self.previous_secret.is_some() {
                debug!(shop = %self.shop_domain, "Previous secret expired");
                self.previous_secret = None;
                self.previous_secret_expires_at = None;
            }
        }
        if let Some(expiry) = self.pending_secret_expires_at {
            if expiry <= now_ms && self.pending_secret.is_some() {
                debug!(shop = %self.shop_domain, "Pending secret expired");
                self.pending_secret = None;
                self.pending_secret_expires_at = None;
            }
        }
    }

    /// Hostnames this shop's pixels may legitimately originate from.
    pub fn allowed_origin_hosts(&self) -> HashSet<String> {
        let mut hosts = HashSet::new();
        hosts.insert(self.shop_domain.to_ascii_lowercase());
        if let Some(primary) = &self.primary_domain {
            hosts.insert(primary.to_ascii_lowercase());
        }
        for domain in &self.storefront_domains {
            hosts.insert(domain.to_ascii_lowercase());
        }
        hosts
    }

    /// full_funnel when any active pixel config opts in; purchase_only is
    /// the default.
    pub fn pipeline_mode(&self) -> PipelineMode {
        let full_funnel = self
            .pixel_configs
            .iter()
            .filter(|config| config.is_active())
            .any(|config| config.mode() == Some("full_funnel"));
        if full_funnel {
            PipelineMode::FullFunnel
        } else {
            PipelineMode::PurchaseOnly
        }
    }

    pub fn enabled_server_side_configs(&self) -> Vec<PixelConfig> {
        self.pixel_configs
            .iter()
            .filter(|config| config.server_side_enabled)
            .cloned()
            .collect()
    }
}
