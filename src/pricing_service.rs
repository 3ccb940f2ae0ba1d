//! Pricing orchestration
//!
//! Glue between the pure resolver and the order system: legacy metafield
//! fallback, per-attempt variant caches, tier-discount overrides, and the
//! draft-order line payloads the station sends upstream.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::domain::pricing::legacy::legacy_tiers_to_rules;
use crate::domain::pricing::{
    coerce_decimal, resolver, source_for, Action, ActionKind, Condition, PriceRule, PriceSource,
    PricingContext, Resolution, ResolvedPriceLine,
};
use crate::domain::value_objects::{Tier, UnitPrice};
use crate::shopify::{AppliedDiscount, DraftOrderLine, OrderSystemClient};
use crate::Result;

pub const OVERRIDE_PRICE_LIST_ID: &str = "tier-overrides";

/// Round to the two decimals the platform expects on price fields.
pub fn round2(amount: Decimal) -> Decimal {
    let mut rounded = amount.round_dp(2);
    rounded.rescale(2);
    rounded
}

// =============================================================================
// Variant caches (one per request/attempt, never shared)
// =============================================================================

#[derive(Default)]
pub struct VariantCache {
    prices: HashMap<i64, Option<Decimal>>,
    tiers: HashMap<i64, Option<BTreeMap<String, Value>>>,
}

impl VariantCache {
    pub async fn price(
        &mut self,
        client: &dyn OrderSystemClient,
        variant_id: i64,
    ) -> Result<Option<Decimal>> {
        if let Some(cached) = self.prices.get(&variant_id) {
            return Ok(*cached);
        }
        let fetched = client.fetch_variant_price(variant_id).await?;
        self.prices.insert(variant_id, fetched);
        Ok(fetched)
    }

    pub async fn tiers(
        &mut self,
        client: &dyn OrderSystemClient,
        variant_id: i64,
    ) -> Result<Option<BTreeMap<String, Value>>> {
        if let Some(cached) = self.tiers.get(&variant_id) {
            return Ok(cached.clone());
        }
        let fetched = client.fetch_variant_price_tiers(variant_id).await?;
        self.tiers.insert(variant_id, fetched.clone());
        Ok(fetched)
    }
}

// =============================================================================
// Resolution with legacy fallback
// =============================================================================

#[derive(Clone, Debug)]
pub struct PricedResolution {
    pub resolution: Resolution,
    pub source: PriceSource,
}

/// Caller-supplied `{tier: percent}` discount table, expressed as rules so
/// the resolver stays the single pricing path. Overrides outrank stored
/// rules (priority 50 vs the default 100).
pub fn override_rules(overrides: &BTreeMap<String, Decimal>) -> Vec<PriceRule> {
    overrides
        .iter()
        .map(|(tier, percent)| PriceRule {
            id: format!("override_{tier}"),
            price_list_id: OVERRIDE_PRICE_LIST_ID.to_string(),
            name: format!("Tier discount override: {tier}"),
            priority: 50,
            conditions: vec![Condition::CustomerTag { value: vec![tier.clone()] }],
            action: Action { kind: ActionKind::PercentDiscount, value: Some(*percent) },
            effective_from: None,
            effective_to: None,
            active: true,
        })
        .collect()
}

/// Resolve against modern rules first; when none matched, bridge in the
/// variant's legacy tier metafield and try again.
pub async fn resolve_with_legacy(
    client: &dyn OrderSystemClient,
    rules: &[PriceRule],
    context: &PricingContext,
    cache: &mut VariantCache,
) -> Result<PricedResolution> {
    let resolution = resolver::resolve(context, rules);
    if resolution.matched_rule_id.is_some() {
        return Ok(PricedResolution { source: source_for(&resolution, rules), resolution });
    }

    let Some(variant_id) = context.variant_id.as_deref().and_then(|v| v.parse::<i64>().ok()) else {
        return Ok(PricedResolution { source: PriceSource::Base, resolution });
    };
    let Some(tier_map) = cache.tiers(client, variant_id).await? else {
        return Ok(PricedResolution { source: PriceSource::Base, resolution });
    };

    let legacy_rules =
        legacy_tiers_to_rules(context.variant_id.as_deref(), context.sku.as_deref(), &tier_map);
    if legacy_rules.is_empty() {
        return Ok(PricedResolution { source: PriceSource::Base, resolution });
    }

    // The legacy "default" entry is a base price, not a rule.
    let mut legacy_context = context.clone();
    if legacy_context.base_price.is_none() {
        legacy_context.base_price = tier_map.get("default").and_then(coerce_decimal);
    }

    let resolution = resolver::resolve(&legacy_context, &legacy_rules);
    let source =
        if resolution.matched_rule_id.is_some() { PriceSource::Metafield } else { PriceSource::Base };
    Ok(PricedResolution { resolution, source })
}

// =============================================================================
// Draft order line building
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnforcementReason {
    TargetAboveBaseClamped,
    MissingBasePrice,
}

#[derive(Clone, Debug)]
pub struct BuiltLine {
    pub entry: DraftOrderLine,
    pub discount_applied: bool,
    pub enforcement_reason: Option<EnforcementReason>,
}

/// One incoming line from the order capture page.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DraftLineRequest {
    pub variant_id: Option<i64>,
    pub sku: Option<String>,
    pub title: Option<String>,
    pub quantity: Option<u32>,
    /// Retail/base unit price when the page already knows it.
    pub price: Option<Decimal>,
    pub retail_price: Option<Decimal>,
}

/// Build the upstream line payload for one resolved line.
///
/// Variant lines never carry an explicit price override: retail pricing is
/// preserved and net tier pricing is expressed as a per-unit applied
/// discount. A target above base clamps to base, and a variant line without
/// a base price stays deterministic by sending the bare variant reference.
pub fn build_draft_order_line(
    variant_id: Option<i64>,
    title: Option<&str>,
    sku: Option<&str>,
    quantity: u32,
    base_price: Option<Decimal>,
    target_price: Option<Decimal>,
    tier: &Tier,
) -> BuiltLine {
    let quantity = quantity.max(1);

    let Some(variant_id) = variant_id else {
        let price = target_price.or(base_price).map(round2);
        return BuiltLine {
            entry: DraftOrderLine {
                title: Some(
                    title.or(sku).map(|t| t.to_string()).unwrap_or_else(|| "Custom item".to_string()),
                ),
                sku: sku.map(|s| s.to_string()),
                quantity,
                price,
                ..Default::default()
            },
            discount_applied: false,
            enforcement_reason: None,
        };
    };

    let entry = DraftOrderLine {
        variant_id: Some(variant_id),
        sku: sku.map(|s| s.to_string()),
        quantity,
        ..Default::default()
    };

    let Some(base) = base_price else {
        return BuiltLine {
            entry,
            discount_applied: false,
            enforcement_reason: Some(EnforcementReason::MissingBasePrice),
        };
    };

    let target = match target_price {
        Some(target) => target,
        None => base,
    };

    if target > base {
        return BuiltLine {
            entry,
            discount_applied: false,
            enforcement_reason: Some(EnforcementReason::TargetAboveBaseClamped),
        };
    }

    let discount_per_unit = round2(base - target);
    if discount_per_unit <= Decimal::ZERO {
        return BuiltLine { entry, discount_applied: false, enforcement_reason: None };
    }

    BuiltLine {
        entry: DraftOrderLine {
            applied_discount: Some(AppliedDiscount {
                value_type: "fixed_amount".to_string(),
                value: discount_per_unit,
                amount: Some(discount_per_unit),
                description: Some(format!("Tier pricing ({tier})")),
                title: None,
            }),
            ..entry
        },
        discount_applied: true,
        enforcement_reason: None,
    }
}

/// Priced draft line: the upstream payload plus the fingerprint input.
#[derive(Clone, Debug)]
pub struct PricedDraftLine {
    pub built: BuiltLine,
    pub resolved: Option<ResolvedPriceLine>,
    pub source: PriceSource,
}

/// Price every requested line for a draft order.
pub async fn price_draft_lines(
    client: &dyn OrderSystemClient,
    rules: &[PriceRule],
    tier: &Tier,
    customer_tags: &[String],
    currency: &str,
    requests: &[DraftLineRequest],
    cache: &mut VariantCache,
) -> Result<Vec<PricedDraftLine>> {
    let mut tags: Vec<String> = customer_tags.to_vec();
    if !tags.iter().any(|t| t.eq_ignore_ascii_case(tier.as_str())) {
        tags.push(tier.as_str().to_string());
    }

    let mut priced = Vec::with_capacity(requests.len());
    for request in requests {
        let quantity = request.quantity.unwrap_or(1).max(1);
        let mut base_price = request.retail_price.or(request.price);
        if base_price.is_none() {
            if let Some(variant_id) = request.variant_id {
                base_price = cache.price(client, variant_id).await?;
            }
        }

        let context = PricingContext {
            variant_id: request.variant_id.map(|id| id.to_string()),
            sku: request.sku.clone(),
            customer_tags: tags.clone(),
            quantity: crate::domain::value_objects::Quantity::new(quantity),
            currency: Some(currency.to_string()),
            base_price,
            ..Default::default()
        };

        let PricedResolution { resolution, source } =
            resolve_with_legacy(client, rules, &context, cache).await?;
        let target_price = resolution.unit_price;

        let built = build_draft_order_line(
            request.variant_id,
            request.title.as_deref(),
            request.sku.as_deref(),
            quantity,
            base_price,
            target_price,
            tier,
        );

        let resolved = request.variant_id.and_then(|variant_id| {
            target_price.or(base_price).map(|price| ResolvedPriceLine {
                variant_id: variant_id.to_string(),
                quantity,
                resolved_unit_price: UnitPrice::clamped(price),
                source,
            })
        });

        priced.push(PricedDraftLine { built, resolved, source });
    }
    Ok(priced)
}
