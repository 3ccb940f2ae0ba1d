//! FLSS Operations Backend - scan station REST service

use anyhow::Result;
use axum::{extract::{Path, State}, http::StatusCode, routing::{get, post, put}, Json, Router};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use validator::Validate;

use flss_backend::config::AppConfig;
use flss_backend::domain::pricing::hash::build_pricing_hash;
use flss_backend::domain::pricing::{
    resolver, source_for, PriceList, PriceRule, PricingContext, ResolvedPriceLine, DEFAULT_CURRENCY,
};
use flss_backend::domain::value_objects::{Tier, UnitPrice};
use flss_backend::pricing_service::{self, DraftLineRequest, PricedResolution, VariantCache};
use flss_backend::pricing_store::PricingStore;
use flss_backend::reconcile::{
    ReconciliationStatus, ReconciliationStatusStore, Reconciler, PRICE_TIER_ATTR, PRICING_HASH_ATTR,
};
use flss_backend::shopify::{NewDraftOrder, NoteAttribute, OrderSystemClient, ShopifyAdminClient};
use flss_backend::BackendError;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<PricingStore>,
    pub client: Option<Arc<dyn OrderSystemClient>>,
    pub reconciler: Option<Arc<Reconciler>>,
    pub status: Arc<ReconciliationStatusStore>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())).with(tracing_subscriber::fmt::layer()).init();

    let config = AppConfig::from_env();
    let store = Arc::new(PricingStore::open(&config.pricing_store_path).await?);
    let status = Arc::new(ReconciliationStatusStore::default());

    let client: Option<Arc<dyn OrderSystemClient>> = match (&config.shopify_store, &config.shopify_client_id, &config.shopify_client_secret) {
        (Some(shop), Some(id), Some(secret)) => Some(Arc::new(ShopifyAdminClient::new(shop, id, secret, &config.shopify_api_version))),
        _ => {
            tracing::warn!("Shopify credentials missing; order system routes return 501");
            None
        }
    };
    let reconciler = client.clone().map(|client| {
        Arc::new(Reconciler::new(client, Arc::clone(&store), Arc::clone(&status), config.default_tier.clone()))
    });

    let port = config.port;
    let state = AppState { config, store, client, reconciler, status };

    let app = Router::new()
        .route("/health", get(|| async { Json(json!({"status": "healthy", "service": "flss-backend"})) }))
        .route("/api/pricing/lists", get(list_price_lists).post(create_price_list))
        .route("/api/pricing/lists/:id", put(update_price_list).delete(delete_price_list))
        .route("/api/pricing/lists/:id/rules", post(create_rule))
        .route("/api/pricing/lists/:id/rules/:rule_id", put(update_rule).delete(delete_rule))
        .route("/api/pricing/resolve", post(resolve_pricing))
        .route("/api/draft-orders", post(create_draft_order))
        .route("/api/draft-orders/:id/reconcile", post(reconcile_draft_order))
        .route("/api/draft-orders/:id/reconciliation", get(reconciliation_status))
        .layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive()).with_state(state);

    tracing::info!("🚀 FLSS backend listening on 0.0.0.0:{}", port);
    axum::serve(tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?, app).await?;
    Ok(())
}

fn http_err(e: BackendError) -> (StatusCode, String) { (e.status_code(), e.to_string()) }

fn bad_request(message: &str) -> (StatusCode, String) { http_err(BackendError::Validation(message.to_string())) }

// =============================================================================
// Price list CRUD
// =============================================================================

async fn list_price_lists(State(s): State<AppState>) -> Json<Value> {
    Json(json!({"priceLists": s.store.list_price_lists().await}))
}

async fn create_price_list(State(s): State<AppState>, Json(r): Json<Value>) -> Result<(StatusCode, Json<Value>), (StatusCode, String)> {
    if !r.get("name").and_then(Value::as_str).map(|n| !n.trim().is_empty()).unwrap_or(false) {
        return Err(bad_request("Missing price list name"));
    }
    let list: PriceList = serde_json::from_value(r).map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    let list = s.store.upsert_list(list).await.map_err(http_err)?;
    Ok((StatusCode::CREATED, Json(json!({"priceList": list}))))
}

async fn update_price_list(State(s): State<AppState>, Path(id): Path<String>, Json(r): Json<Value>) -> Result<Json<Value>, (StatusCode, String)> {
    let mut r = r;
    let obj = r.as_object_mut().ok_or_else(|| bad_request("Expected a price list object"))?;
    obj.insert("id".to_string(), Value::String(id));
    let list: PriceList = serde_json::from_value(r).map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    let list = s.store.upsert_list(list).await.map_err(http_err)?;
    Ok(Json(json!({"priceList": list})))
}

async fn delete_price_list(State(s): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, (StatusCode, String)> {
    if s.store.delete_list(&id).await.map_err(http_err)? { Ok(StatusCode::NO_CONTENT) } else { Err(http_err(BackendError::PriceListNotFound)) }
}

async fn create_rule(State(s): State<AppState>, Path(list_id): Path<String>, Json(r): Json<Value>) -> Result<(StatusCode, Json<Value>), (StatusCode, String)> {
    let rule: PriceRule = serde_json::from_value(r).map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    match s.store.upsert_rule(&list_id, rule).await.map_err(http_err)? {
        Some(rule) => Ok((StatusCode::CREATED, Json(json!({"rule": rule})))),
        None => Err(http_err(BackendError::PriceListNotFound)),
    }
}

async fn update_rule(State(s): State<AppState>, Path((list_id, rule_id)): Path<(String, String)>, Json(r): Json<Value>) -> Result<Json<Value>, (StatusCode, String)> {
    let mut r = r;
    let obj = r.as_object_mut().ok_or_else(|| bad_request("Expected a price rule object"))?;
    obj.insert("id".to_string(), Value::String(rule_id));
    let rule: PriceRule = serde_json::from_value(r).map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    match s.store.upsert_rule(&list_id, rule).await.map_err(http_err)? {
        Some(rule) => Ok(Json(json!({"rule": rule}))),
        None => Err(http_err(BackendError::PriceListNotFound)),
    }
}

async fn delete_rule(State(s): State<AppState>, Path((list_id, rule_id)): Path<(String, String)>) -> Result<StatusCode, (StatusCode, String)> {
    if s.store.delete_rule(&list_id, &rule_id).await.map_err(http_err)? { Ok(StatusCode::NO_CONTENT) } else { Err(http_err(BackendError::PriceRuleNotFound)) }
}

// =============================================================================
// Pricing resolution
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveRequest {
    context: Option<ResolveContextRequest>,
    contexts: Option<Vec<ResolveContextRequest>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveContextRequest {
    #[serde(flatten)]
    context: PricingContext,
    customer_tier: Option<String>,
    #[serde(default)]
    tier_discounts: BTreeMap<String, Decimal>,
}

async fn resolve_pricing(State(s): State<AppState>, Json(r): Json<ResolveRequest>) -> Result<Json<Value>, (StatusCode, String)> {
    let contexts = r.contexts.or_else(|| r.context.map(|c| vec![c])).unwrap_or_default();
    if contexts.is_empty() {
        return Err(bad_request("Provide context or contexts"));
    }

    let mut results = Vec::with_capacity(contexts.len());
    for request in contexts {
        let mut context = request.context;
        let tier = request.customer_tier.as_deref().and_then(Tier::normalize)
            .or_else(|| context.customer_tags.iter().find_map(|t| Tier::normalize(t)))
            .unwrap_or_else(|| s.config.default_tier.clone());
        if !context.customer_tags.iter().any(|t| t.eq_ignore_ascii_case(tier.as_str())) {
            context.customer_tags.push(tier.as_str().to_string());
        }

        let mut rules = s.store.rules_for_channel(context.sales_channel.as_deref()).await;
        if !request.tier_discounts.is_empty() {
            let mut combined = pricing_service::override_rules(&request.tier_discounts);
            combined.append(&mut rules);
            rules = combined;
        }

        let priced = match s.client.as_ref() {
            Some(client) => {
                let mut cache = VariantCache::default();
                pricing_service::resolve_with_legacy(client.as_ref(), &rules, &context, &mut cache).await.map_err(http_err)?
            }
            None => {
                let resolution = resolver::resolve(&context, &rules);
                let source = source_for(&resolution, &rules);
                PricedResolution { resolution, source }
            }
        };

        let currency = context.currency.clone().unwrap_or_else(|| DEFAULT_CURRENCY.to_string());
        let hash_lines: Vec<ResolvedPriceLine> = match (&context.variant_id, priced.resolution.unit_price) {
            (Some(variant_id), Some(price)) => vec![ResolvedPriceLine {
                variant_id: variant_id.clone(),
                quantity: context.quantity.get(),
                resolved_unit_price: UnitPrice::clamped(price),
                source: priced.source,
            }],
            _ => Vec::new(),
        };

        results.push(json!({
            "context": {"variantId": context.variant_id, "sku": context.sku, "tier": tier},
            "unitPrice": priced.resolution.unit_price,
            "matchedRuleId": priced.resolution.matched_rule_id,
            "fallbackReason": priced.resolution.fallback_reason,
            "source": priced.source,
            "hash": build_pricing_hash(&tier, &currency, &hash_lines),
        }));
    }

    Ok(Json(json!({"results": results})))
}

// =============================================================================
// Draft orders
// =============================================================================

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct CreateDraftOrderRequest {
    customer_id: Option<i64>,
    #[validate(length(min = 1, message = "Missing lineItems"))]
    line_items: Vec<DraftLineRequest>,
    price_tier: Option<String>,
    #[serde(default)]
    customer_tags: Vec<String>,
    currency: Option<String>,
    po_number: Option<String>,
}

async fn create_draft_order(State(s): State<AppState>, Json(r): Json<CreateDraftOrderRequest>) -> Result<(StatusCode, Json<Value>), (StatusCode, String)> {
    let Some(client) = s.client.as_ref() else {
        return Err(http_err(BackendError::OrderSystemNotConfigured));
    };
    r.validate().map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let Some(customer_id) = r.customer_id else { return Err(bad_request("Missing customerId")) };

    let tier = r.price_tier.as_deref().and_then(Tier::normalize)
        .or_else(|| r.customer_tags.iter().find_map(|t| Tier::normalize(t)))
        .unwrap_or_else(|| s.config.default_tier.clone());
    let currency = r.currency.clone().unwrap_or_else(|| DEFAULT_CURRENCY.to_string());

    let rules = s.store.rules_for_channel(None).await;
    let mut cache = VariantCache::default();
    let priced = pricing_service::price_draft_lines(client.as_ref(), &rules, &tier, &r.customer_tags, &currency, &r.line_items, &mut cache).await.map_err(http_err)?;

    let resolved: Vec<ResolvedPriceLine> = priced.iter().filter_map(|p| p.resolved.clone()).collect();
    let hash = build_pricing_hash(&tier, &currency, &resolved);
    let fallback_used = priced.iter().any(|p| p.built.enforcement_reason.is_some());

    let mut note_attributes = Vec::new();
    if let Some(po) = r.po_number.as_deref() {
        note_attributes.push(NoteAttribute::new("po_number", po));
    }
    note_attributes.push(NoteAttribute::new(PRICE_TIER_ATTR, tier.as_str()));
    note_attributes.push(NoteAttribute::new(PRICING_HASH_ATTR, hash.clone()));

    let draft = NewDraftOrder {
        customer: Some(json!({"id": customer_id})),
        note: r.po_number.as_deref().map(|po| format!("PO: {po}")),
        line_items: priced.iter().map(|p| p.built.entry.clone()).collect(),
        note_attributes,
        tags: None,
    };
    let created = client.create_draft_order(&draft).await.map_err(http_err)?;

    Ok((StatusCode::CREATED, Json(json!({
        "ok": true,
        "draftOrder": {"id": created.id, "name": created.name, "invoiceUrl": created.invoice_url},
        "pricingHash": hash,
        "tier": tier,
        "fallbackUsed": fallback_used,
    }))))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ReconcileRequest {
    tier_discounts: Option<BTreeMap<String, Decimal>>,
}

async fn reconcile_draft_order(State(s): State<AppState>, Path(id): Path<String>, body: Option<Json<ReconcileRequest>>) -> Result<Json<Value>, (StatusCode, String)> {
    let Some(reconciler) = s.reconciler.as_ref() else {
        return Err(http_err(BackendError::OrderSystemNotConfigured));
    };
    if id.trim().is_empty() {
        return Err(bad_request("Missing draftOrderId"));
    }
    let discounts = body.and_then(|Json(b)| b.tier_discounts);
    let outcome = reconciler.reconcile(&id, discounts.as_ref()).await.map_err(http_err)?;
    Ok(Json(json!({"ok": true, "reconciliation": outcome})))
}

async fn reconciliation_status(State(s): State<AppState>, Path(id): Path<String>) -> Result<Json<ReconciliationStatus>, (StatusCode, String)> {
    s.status.get_status(&id).map(Json).ok_or((StatusCode::NOT_FOUND, "Not found".to_string()))
}
