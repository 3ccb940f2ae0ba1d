//! Legacy tier adapter
//!
//! Older variants carry a flat `{tier: price}` JSON metafield instead of
//! price list rules. This bridge rewrites that map into synthetic rules so
//! the resolver operates uniformly over both sources. It is consulted only
//! when no modern rule applied to a variant.

use serde_json::Value;
use std::collections::BTreeMap;

use super::{coerce_decimal, Action, ActionKind, Condition, PriceRule};

pub const LEGACY_PRICE_LIST_ID: &str = "legacy-adapter";

/// Priority floor for synthetic rules: modern rules (priority <= 100 by
/// convention) always sort ahead of legacy tiers.
const LEGACY_PRIORITY_BASE: i32 = 200;

/// Rewrite a variant's flat tier map into synthetic price rules.
///
/// The `default` tier is the base/fallback price, never a conditional rule.
/// Non-numeric tier values are dropped. Rule ids are deterministic from the
/// variant (or SKU) and tier name, so repeated calls hash identically.
pub fn legacy_tiers_to_rules(
    variant_id: Option<&str>,
    sku: Option<&str>,
    price_tiers: &BTreeMap<String, Value>,
) -> Vec<PriceRule> {
    let anchor = variant_id.or(sku).unwrap_or("variant").to_string();

    price_tiers
        .iter()
        .filter(|(tier, _)| tier.as_str() != "default")
        .filter_map(|(tier, value)| coerce_decimal(value).map(|price| (tier, price)))
        .enumerate()
        .map(|(index, (tier, price))| {
            let mut conditions = vec![Condition::CustomerTag { value: vec![tier.clone()] }];
            if let Some(sku) = sku {
                conditions.push(Condition::Sku { value: vec![sku.to_string()] });
            }
            PriceRule {
                id: format!("legacy_{anchor}_{tier}"),
                price_list_id: LEGACY_PRICE_LIST_ID.to_string(),
                name: format!("Legacy tier: {tier}"),
                priority: LEGACY_PRIORITY_BASE + index as i32,
                conditions,
                action: Action { kind: ActionKind::FixedUnitPrice, value: Some(price) },
                effective_from: None,
                effective_to: None,
                active: true,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tiers(value: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_default_tier_is_never_a_rule() {
        let rules = legacy_tiers_to_rules(
            Some("12345"),
            None,
            &tiers(json!({"default": 50, "retail": 80})),
        );
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, "legacy_12345_retail");
        assert_eq!(rules[0].action.value, Some(80.into()));
    }

    #[test]
    fn test_non_numeric_values_are_dropped() {
        let rules = legacy_tiers_to_rules(
            Some("12345"),
            None,
            &tiers(json!({"agent": "72.50", "export": "call us"})),
        );
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, "legacy_12345_agent");
    }

    #[test]
    fn test_sku_adds_membership_condition() {
        let rules =
            legacy_tiers_to_rules(Some("12345"), Some("SKU-1"), &tiers(json!({"agent": 72})));
        assert_eq!(rules[0].conditions.len(), 2);
        assert!(matches!(&rules[0].conditions[1], Condition::Sku { value } if value == &vec!["SKU-1".to_string()]));
    }

    #[test]
    fn test_ids_and_priorities_are_deterministic() {
        let map = tiers(json!({"retail": 80, "agent": 72}));
        let first = legacy_tiers_to_rules(Some("12345"), None, &map);
        let second = legacy_tiers_to_rules(Some("12345"), None, &map);
        assert_eq!(first, second);
        // BTreeMap ordering: agent before retail.
        assert_eq!(first[0].priority, 200);
        assert_eq!(first[1].priority, 201);
    }
}
