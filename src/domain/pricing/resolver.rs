//! First-match-wins price resolution

use chrono::Utc;

use super::matcher::within_window;
use super::{FallbackReason, PriceRule, PricingContext, Resolution};

/// Resolve a unit price for one context against a candidate rule set.
///
/// Rules are filtered to active ones inside their effective window, then
/// scanned in ascending priority order (stable, so ties keep input order).
/// The first rule whose conditions all match and whose action yields a
/// finite price wins. A matched percent-discount rule without a base price
/// cannot price the line and resolution continues past it.
pub fn resolve(context: &PricingContext, rules: &[PriceRule]) -> Resolution {
    let as_of = context.as_of.unwrap_or_else(Utc::now);

    let mut candidates: Vec<&PriceRule> = rules
        .iter()
        .filter(|rule| rule.active)
        .filter(|rule| within_window(rule.effective_from, rule.effective_to, as_of))
        .collect();
    candidates.sort_by_key(|rule| rule.priority);

    for rule in candidates {
        if !rule.conditions.iter().all(|condition| condition.matches(context)) {
            continue;
        }
        if let Some(unit_price) = rule.action.apply(context.base_price) {
            return Resolution {
                unit_price: Some(unit_price),
                matched_rule_id: Some(rule.id.clone()),
                fallback_reason: None,
            };
        }
    }

    match context.base_price {
        Some(base) => Resolution {
            unit_price: Some(base),
            matched_rule_id: None,
            fallback_reason: Some(FallbackReason::NoMatchingRule),
        },
        None => Resolution {
            unit_price: None,
            matched_rule_id: None,
            fallback_reason: Some(FallbackReason::NoBasePrice),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::pricing::{Action, ActionKind, Condition};
    use crate::domain::value_objects::Quantity;
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    fn fixed_rule(id: &str, priority: i32, price: i64) -> PriceRule {
        PriceRule {
            id: id.to_string(),
            priority,
            action: Action { kind: ActionKind::FixedUnitPrice, value: Some(Decimal::from(price)) },
            ..serde_json::from_value(serde_json::json!({})).unwrap()
        }
    }

    #[test]
    fn test_lowest_priority_wins_regardless_of_input_order() {
        let context = PricingContext::default();
        let rules = vec![fixed_rule("late", 20, 90), fixed_rule("early", 10, 70)];
        let resolution = resolve(&context, &rules);
        assert_eq!(resolution.unit_price, Some(Decimal::from(70)));
        assert_eq!(resolution.matched_rule_id.as_deref(), Some("early"));

        let reversed = vec![fixed_rule("early", 10, 70), fixed_rule("late", 20, 90)];
        assert_eq!(resolve(&context, &reversed).matched_rule_id.as_deref(), Some("early"));
    }

    #[test]
    fn test_priority_tie_keeps_input_order() {
        let context = PricingContext::default();
        let rules = vec![fixed_rule("first", 10, 70), fixed_rule("second", 10, 90)];
        assert_eq!(resolve(&context, &rules).matched_rule_id.as_deref(), Some("first"));
    }

    #[test]
    fn test_all_conditions_must_match() {
        let mut rule = fixed_rule("partial", 10, 70);
        rule.conditions = vec![
            Condition::MinQuantity { value: 1 },
            Condition::CustomerTag { value: vec!["agent".to_string()] },
        ];
        let context = PricingContext { quantity: Quantity::new(5), ..Default::default() };
        let resolution = resolve(&context, &[rule]);
        assert!(resolution.matched_rule_id.is_none());
    }

    #[test]
    fn test_expired_rule_never_matches() {
        let mut rule = fixed_rule("expired", 10, 70);
        rule.effective_to = Some(Utc::now() - Duration::days(1));
        let context = PricingContext { base_price: Some(Decimal::from(120)), ..Default::default() };
        let resolution = resolve(&context, &[rule]);
        assert_eq!(resolution.unit_price, Some(Decimal::from(120)));
        assert_eq!(resolution.fallback_reason, Some(FallbackReason::NoMatchingRule));
    }

    #[test]
    fn test_inactive_rule_never_matches() {
        let mut rule = fixed_rule("inactive", 10, 70);
        rule.active = false;
        assert!(resolve(&PricingContext::default(), &[rule]).matched_rule_id.is_none());
    }

    #[test]
    fn test_fallback_chain() {
        let context = PricingContext { base_price: Some(Decimal::from(120)), ..Default::default() };
        let resolution = resolve(&context, &[]);
        assert_eq!(resolution.unit_price, Some(Decimal::from(120)));
        assert_eq!(resolution.fallback_reason, Some(FallbackReason::NoMatchingRule));

        let resolution = resolve(&PricingContext::default(), &[]);
        assert_eq!(resolution.unit_price, None);
        assert_eq!(resolution.fallback_reason, Some(FallbackReason::NoBasePrice));
    }

    #[test]
    fn test_percent_discount_without_base_price_is_skipped() {
        let mut discount = fixed_rule("discount", 10, 0);
        discount.action = Action { kind: ActionKind::PercentDiscount, value: Some(Decimal::from(15)) };
        let fixed = fixed_rule("fixed", 20, 70);

        let resolution = resolve(&PricingContext::default(), &[discount, fixed]);
        assert_eq!(resolution.matched_rule_id.as_deref(), Some("fixed"));
        assert_eq!(resolution.unit_price, Some(Decimal::from(70)));
    }

    #[test]
    fn test_min_quantity_percent_discount_end_to_end() {
        let mut rule = fixed_rule("bulk", 50, 0);
        rule.conditions = vec![Condition::MinQuantity { value: 10 }];
        rule.action = Action { kind: ActionKind::PercentDiscount, value: Some(Decimal::from(15)) };

        let eligible = PricingContext {
            quantity: Quantity::new(12),
            base_price: Some(Decimal::from(100)),
            ..Default::default()
        };
        let resolution = resolve(&eligible, std::slice::from_ref(&rule));
        assert_eq!(resolution.unit_price, Some(Decimal::from(85)));
        assert_eq!(resolution.matched_rule_id.as_deref(), Some("bulk"));

        let below_threshold = PricingContext {
            quantity: Quantity::new(5),
            base_price: Some(Decimal::from(100)),
            ..Default::default()
        };
        let resolution = resolve(&below_threshold, &[rule]);
        assert_eq!(resolution.unit_price, Some(Decimal::from(100)));
        assert_eq!(resolution.matched_rule_id, None);
        assert_eq!(resolution.fallback_reason, Some(FallbackReason::NoMatchingRule));
    }
}
