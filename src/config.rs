//! Environment-driven configuration

use std::path::PathBuf;

use crate::domain::value_objects::Tier;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub port: u16,
    pub shopify_store: Option<String>,
    pub shopify_client_id: Option<String>,
    pub shopify_client_secret: Option<String>,
    pub shopify_api_version: String,
    pub default_tier: Tier,
    pub pricing_store_path: PathBuf,
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            port: env_opt("PORT").and_then(|v| v.parse().ok()).unwrap_or(3000),
            shopify_store: env_opt("SHOPIFY_STORE"),
            shopify_client_id: env_opt("SHOPIFY_CLIENT_ID"),
            shopify_client_secret: env_opt("SHOPIFY_CLIENT_SECRET"),
            shopify_api_version: env_opt("SHOPIFY_API_VERSION").unwrap_or_else(|| "2025-10".to_string()),
            default_tier: env_opt("DEFAULT_PRICE_TIER")
                .map(Tier::new)
                .unwrap_or_else(Tier::retail),
            pricing_store_path: env_opt("PRICING_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/pricing-model.json")),
        }
    }

    /// True when every Shopify Dev Dashboard credential is present.
    pub fn shopify_configured(&self) -> bool {
        self.shopify_store.is_some() && self.shopify_client_id.is_some() && self.shopify_client_secret.is_some()
    }
}
