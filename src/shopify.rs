//! Order system client
//!
//! The reconciler and order routes talk to the commerce platform through the
//! [`OrderSystemClient`] trait; [`ShopifyAdminClient`] is the production
//! implementation against the Shopify Admin REST API using Dev Dashboard
//! client-credentials auth (24h tokens, cached with an expiry buffer and
//! refreshed once on 401/403).

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::{BackendError, Result};

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NoteAttribute {
    pub name: String,
    pub value: String,
}

impl NoteAttribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct CustomerRef {
    pub id: i64,
    #[serde(default)]
    pub tags: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppliedDiscount {
    pub value_type: String,
    pub value: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DraftOrderLine {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_discount: Option<AppliedDiscount>,
}

fn default_quantity() -> u32 {
    1
}

impl DraftOrderLine {
    /// Unit price net of any applied discount. The station writes
    /// `fixed_amount` discounts per unit, so the reduction applies directly.
    pub fn effective_unit_price(&self) -> Option<Decimal> {
        let price = self.price?;
        let net = match &self.applied_discount {
            Some(d) if d.value_type == "percentage" => {
                price * (Decimal::ONE - d.value / Decimal::ONE_HUNDRED)
            }
            Some(d) => price - d.value,
            None => price,
        };
        Some(net.max(Decimal::ZERO))
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct DraftOrder {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_draft_currency")]
    pub currency: String,
    #[serde(default)]
    pub customer: Option<CustomerRef>,
    #[serde(default)]
    pub line_items: Vec<DraftOrderLine>,
    #[serde(default)]
    pub note_attributes: Vec<NoteAttribute>,
    #[serde(default)]
    pub invoice_url: Option<String>,
}

fn default_draft_currency() -> String {
    "ZAR".to_string()
}

impl DraftOrder {
    pub fn note_attribute(&self, name: &str) -> Option<&str> {
        self.note_attributes.iter().find(|attr| attr.name == name).map(|attr| attr.value.as_str())
    }
}

/// Payload for creating a new draft order.
#[derive(Clone, Debug, Default, Serialize)]
pub struct NewDraftOrder {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub line_items: Vec<DraftOrderLine>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub note_attributes: Vec<NoteAttribute>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CustomerTierMetadata {
    pub tier: Option<String>,
    pub tags: Vec<String>,
}

// =============================================================================
// Client trait
// =============================================================================

#[async_trait]
pub trait OrderSystemClient: Send + Sync {
    async fn fetch_draft_order(&self, id: &str) -> Result<DraftOrder>;

    /// Full line replacement plus note-attribute rewrite in one update.
    async fn update_draft_order_lines(
        &self,
        id: &str,
        lines: &[DraftOrderLine],
        note_attributes: &[NoteAttribute],
    ) -> Result<()>;

    async fn create_draft_order(&self, draft: &NewDraftOrder) -> Result<DraftOrder>;

    async fn fetch_customer_tier_metadata(&self, customer_id: i64) -> Result<CustomerTierMetadata>;

    /// Current catalog price for a variant, if the variant resolves.
    async fn fetch_variant_price(&self, variant_id: i64) -> Result<Option<Decimal>>;

    /// Legacy `{tier: price}` metafield map for a variant, if present.
    async fn fetch_variant_price_tiers(
        &self,
        variant_id: i64,
    ) -> Result<Option<BTreeMap<String, Value>>>;
}

// =============================================================================
// Shopify Admin implementation
// =============================================================================

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

pub struct ShopifyAdminClient {
    http: reqwest::Client,
    store: String,
    client_id: String,
    client_secret: String,
    api_version: String,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct DraftOrderEnvelope {
    draft_order: DraftOrder,
}

#[derive(Deserialize)]
struct MetafieldsEnvelope {
    #[serde(default)]
    metafields: Vec<Metafield>,
}

#[derive(Deserialize)]
struct Metafield {
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: Value,
}

impl ShopifyAdminClient {
    pub fn new(store: &str, client_id: &str, client_secret: &str, api_version: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            store: store.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            api_version: api_version.to_string(),
            token: Mutex::new(None),
        }
    }

    fn base_url(&self) -> String {
        format!("https://{}.myshopify.com", self.store)
    }

    fn admin_path(&self, rest: &str) -> String {
        format!("{}/admin/api/{}/{}", self.base_url(), self.api_version, rest)
    }

    async fn access_token(&self) -> Result<String> {
        let mut cache = self.token.lock().await;
        if let Some(token) = cache.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.access_token.clone());
            }
        }

        let resp = self
            .http
            .post(format!("{}/admin/oauth/access_token", self.base_url()))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(BackendError::Upstream {
                status: status.as_u16(),
                message: format!("token request failed: {body}"),
            });
        }
        let parsed: TokenResponse = serde_json::from_str(&body)?;

        // Refresh a minute before Shopify's stated expiry.
        let expires_in = parsed.expires_in.unwrap_or(0).saturating_mul(1000).saturating_sub(60_000);
        *cache = Some(CachedToken {
            access_token: parsed.access_token.clone(),
            expires_at: Instant::now() + Duration::from_millis(expires_in),
        });
        Ok(parsed.access_token)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn send(&self, method: Method, url: &str, body: Option<&Value>) -> Result<reqwest::Response> {
        let token = self.access_token().await?;
        let mut request = self
            .http
            .request(method.clone(), url)
            .header("X-Shopify-Access-Token", token)
            .header("Accept", "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }
        let resp = request.send().await?;

        if resp.status() == StatusCode::UNAUTHORIZED || resp.status() == StatusCode::FORBIDDEN {
            self.invalidate_token().await;
            let token = self.access_token().await?;
            let mut retry = self
                .http
                .request(method, url)
                .header("X-Shopify-Access-Token", token)
                .header("Accept", "application/json");
            if let Some(body) = body {
                retry = retry.json(body);
            }
            return Ok(retry.send().await?);
        }
        Ok(resp)
    }

    async fn expect_json<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(BackendError::Upstream { status: status.as_u16(), message: body });
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl OrderSystemClient for ShopifyAdminClient {
    async fn fetch_draft_order(&self, id: &str) -> Result<DraftOrder> {
        let url = self.admin_path(&format!("draft_orders/{id}.json"));
        let resp = self.send(Method::GET, &url, None).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(BackendError::DraftOrderNotFound(id.to_string()));
        }
        let envelope: DraftOrderEnvelope = Self::expect_json(resp).await?;
        Ok(envelope.draft_order)
    }

    async fn update_draft_order_lines(
        &self,
        id: &str,
        lines: &[DraftOrderLine],
        note_attributes: &[NoteAttribute],
    ) -> Result<()> {
        let url = self.admin_path(&format!("draft_orders/{id}.json"));
        let body = serde_json::json!({
            "draft_order": {
                "id": id.parse::<i64>().ok(),
                "line_items": lines,
                "note_attributes": note_attributes,
            }
        });
        let resp = self.send(Method::PUT, &url, Some(&body)).await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await?;
            return Err(BackendError::Upstream { status: status.as_u16(), message: body });
        }
        Ok(())
    }

    async fn create_draft_order(&self, draft: &NewDraftOrder) -> Result<DraftOrder> {
        let url = self.admin_path("draft_orders.json");
        let body = serde_json::json!({ "draft_order": draft });
        let resp = self.send(Method::POST, &url, Some(&body)).await?;
        let envelope: DraftOrderEnvelope = Self::expect_json(resp).await?;
        Ok(envelope.draft_order)
    }

    async fn fetch_customer_tier_metadata(&self, customer_id: i64) -> Result<CustomerTierMetadata> {
        let url = self.admin_path(&format!(
            "customers/{customer_id}/metafields.json?namespace=custom&key=price_tier"
        ));
        let resp = self.send(Method::GET, &url, None).await?;
        let tier = if resp.status().is_success() {
            let envelope: MetafieldsEnvelope = Self::expect_json(resp).await?;
            envelope
                .metafields
                .into_iter()
                .find(|m| m.namespace == "custom" && m.key == "price_tier")
                .and_then(|m| m.value.as_str().map(|s| s.to_string()))
        } else {
            None
        };

        let url = self.admin_path(&format!("customers/{customer_id}.json?fields=id,tags"));
        let resp = self.send(Method::GET, &url, None).await?;
        let envelope: Value = Self::expect_json(resp).await?;
        let tags = envelope
            .pointer("/customer/tags")
            .and_then(Value::as_str)
            .map(|raw| {
                raw.split(',').map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect()
            })
            .unwrap_or_default();

        Ok(CustomerTierMetadata { tier, tags })
    }

    async fn fetch_variant_price(&self, variant_id: i64) -> Result<Option<Decimal>> {
        let url = self.admin_path(&format!("variants/{variant_id}.json?fields=id,price"));
        let resp = self.send(Method::GET, &url, None).await?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        let envelope: Value = Self::expect_json(resp).await?;
        Ok(envelope.pointer("/variant/price").and_then(crate::domain::pricing::coerce_decimal))
    }

    async fn fetch_variant_price_tiers(
        &self,
        variant_id: i64,
    ) -> Result<Option<BTreeMap<String, Value>>> {
        let url = self.admin_path(&format!(
            "variants/{variant_id}/metafields.json?namespace=custom&key=price_tiers"
        ));
        let resp = self.send(Method::GET, &url, None).await?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        let envelope: MetafieldsEnvelope = Self::expect_json(resp).await?;
        let Some(meta) = envelope.metafields.into_iter().next() else {
            return Ok(None);
        };
        // The metafield stores JSON either inline or as an encoded string.
        let tiers = match meta.value {
            Value::Object(map) => Some(map.into_iter().collect()),
            Value::String(raw) => serde_json::from_str::<BTreeMap<String, Value>>(&raw).ok(),
            _ => None,
        };
        Ok(tiers)
    }
}
