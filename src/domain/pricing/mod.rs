//! Wholesale price rule model
//!
//! Rules are stored as `{type, value}` condition pairs plus a single action.
//! The wire format is shared with the staff pricing pages, so deserialization
//! stays lenient about scalars-vs-arrays and numeric strings.

pub mod hash;
pub mod legacy;
pub mod matcher;
pub mod resolver;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

use super::value_objects::{Quantity, UnitPrice};

pub const DEFAULT_PRIORITY: i32 = 100;
pub const DEFAULT_CURRENCY: &str = "ZAR";

// =============================================================================
// Conditions
// =============================================================================

/// One rule condition. All conditions on a rule must match (AND).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Condition {
    /// Any of the expected tags appears in the customer's tag set.
    CustomerTag {
        #[serde(default, deserialize_with = "de_string_list")]
        value: Vec<String>,
    },
    CustomerGroup {
        #[serde(default)]
        value: String,
    },
    Sku {
        #[serde(default, deserialize_with = "de_string_list")]
        value: Vec<String>,
    },
    Collection {
        #[serde(default, deserialize_with = "de_string_list")]
        value: Vec<String>,
    },
    MinQuantity {
        #[serde(default, deserialize_with = "de_lenient_u32")]
        value: u32,
    },
    Currency {
        #[serde(default)]
        value: String,
    },
    SalesChannel {
        #[serde(default)]
        value: String,
    },
    EffectiveDate {
        #[serde(default, deserialize_with = "de_lenient_date")]
        from: Option<DateTime<Utc>>,
        #[serde(default, deserialize_with = "de_lenient_date")]
        to: Option<DateTime<Utc>>,
    },
    /// Unrecognized condition types are kept as permissive no-ops so stored
    /// rules written by newer pages keep resolving (see matcher).
    #[serde(other)]
    Unknown,
}

// =============================================================================
// Actions
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "String")]
pub enum ActionKind {
    FixedUnitPrice,
    PercentDiscount,
    Unknown,
}

impl From<String> for ActionKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "fixedUnitPrice" => Self::FixedUnitPrice,
            "percentDiscount" => Self::PercentDiscount,
            _ => Self::Unknown,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(default, deserialize_with = "de_lenient_decimal")]
    pub value: Option<Decimal>,
}

impl Default for Action {
    fn default() -> Self {
        Self { kind: ActionKind::FixedUnitPrice, value: None }
    }
}

impl Action {
    /// Price produced by this action, or `None` when the action cannot yield
    /// a finite price (missing value, percent discount without a base price).
    pub fn apply(&self, base_price: Option<Decimal>) -> Option<Decimal> {
        match self.kind {
            ActionKind::FixedUnitPrice => self.value,
            ActionKind::PercentDiscount => {
                let base = base_price?;
                let pct = self.value?;
                Some((base * (Decimal::ONE - pct / Decimal::ONE_HUNDRED)).max(Decimal::ZERO))
            }
            ActionKind::Unknown => None,
        }
    }
}

// =============================================================================
// Rules and lists
// =============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceRule {
    #[serde(default = "new_rule_id")]
    pub id: String,
    #[serde(default = "default_list_id")]
    pub price_list_id: String,
    #[serde(default = "default_rule_name")]
    pub name: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Empty conditions are intentional: the rule matches everything in scope.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub action: Action,
    #[serde(default, deserialize_with = "de_lenient_date")]
    pub effective_from: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de_lenient_date")]
    pub effective_to: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceList {
    #[serde(default = "new_list_id")]
    pub id: String,
    #[serde(default = "default_list_name")]
    pub name: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub rules: Vec<PriceRule>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Resolution inputs and outputs
// =============================================================================

/// Ephemeral context for one resolution call. Not persisted.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PricingContext {
    pub variant_id: Option<String>,
    pub sku: Option<String>,
    pub customer_tags: Vec<String>,
    pub customer_group: Option<String>,
    pub collections: Vec<String>,
    pub quantity: Quantity,
    pub currency: Option<String>,
    pub sales_channel: Option<String>,
    pub base_price: Option<Decimal>,
    pub as_of: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FallbackReason {
    NoMatchingRule,
    NoBasePrice,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub unit_price: Option<Decimal>,
    pub matched_rule_id: Option<String>,
    pub fallback_reason: Option<FallbackReason>,
}

/// Where a resolved line price came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    /// A modern rule with a fixed unit price.
    FixedTier,
    /// A modern rule expressed as a percent discount.
    DiscountFallback,
    /// The legacy per-variant `price_tiers` metafield.
    Metafield,
    /// No rule produced a price; the base price was used.
    Base,
}

/// Hash input and draft-order line payload for one resolved line.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedPriceLine {
    pub variant_id: String,
    pub quantity: u32,
    pub resolved_unit_price: UnitPrice,
    pub source: PriceSource,
}

/// Source tag for a resolution against the rule set it ran over.
pub fn source_for(resolution: &Resolution, rules: &[PriceRule]) -> PriceSource {
    let Some(rule_id) = resolution.matched_rule_id.as_deref() else {
        return PriceSource::Base;
    };
    match rules.iter().find(|r| r.id == rule_id) {
        Some(rule) if rule.price_list_id == legacy::LEGACY_PRICE_LIST_ID => PriceSource::Metafield,
        Some(rule) if rule.action.kind == ActionKind::PercentDiscount => PriceSource::DiscountFallback,
        _ => PriceSource::FixedTier,
    }
}

// =============================================================================
// Lenient deserialization helpers (legacy wire tolerances)
// =============================================================================

fn scalar_to_string(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    if s.is_empty() { None } else { Some(s) }
}

/// Scalar-or-array of strings, trimmed, empties dropped.
pub(crate) fn coerce_string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.iter().filter_map(scalar_to_string).collect(),
        other => scalar_to_string(other).into_iter().collect(),
    }
}

/// Number-or-numeric-string to a decimal.
pub(crate) fn coerce_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

fn de_string_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(coerce_string_list(&value))
}

fn de_lenient_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(coerce_decimal(&value).and_then(|d| d.trunc().to_u32()).unwrap_or(0))
}

fn de_lenient_decimal<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Decimal>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(coerce_decimal(&value))
}

/// Optional ISO timestamp; unparseable input normalizes to unbounded.
fn de_lenient_date<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(parse_lenient_date(&value))
}

pub(crate) fn parse_lenient_date(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::from_str(raw)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
}

fn new_rule_id() -> String {
    format!("rule_{}", Uuid::new_v4().simple())
}

fn new_list_id() -> String {
    format!("list_{}", Uuid::new_v4().simple())
}

fn default_list_id() -> String {
    "default".to_string()
}

fn default_rule_name() -> String {
    "Untitled rule".to_string()
}

fn default_list_name() -> String {
    "Default Price List".to_string()
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

fn default_true() -> bool {
    true
}
