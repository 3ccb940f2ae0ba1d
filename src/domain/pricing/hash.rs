//! Pricing fingerprint
//!
//! A stable digest over resolved line pricing, stamped on draft orders and
//! compared on reconciliation to detect drift. Serialization is explicit:
//! fields concatenate in a fixed order and lines sort by variant id, so the
//! digest never depends on map or payload ordering.
//!
//! The line `source` provenance tag is deliberately excluded: drift
//! detection tracks prices, not where they came from.

use sha2::{Digest, Sha256};
use std::fmt::Write;

use crate::domain::value_objects::Tier;

use super::ResolvedPriceLine;

/// Digest `tier|CURRENCY|variant:qty:price;variant:qty:price;...`.
pub fn build_pricing_hash(tier: &Tier, currency: &str, lines: &[ResolvedPriceLine]) -> String {
    let mut ordered: Vec<&ResolvedPriceLine> = lines.iter().collect();
    ordered.sort_by(|a, b| a.variant_id.cmp(&b.variant_id));

    let mut canonical = format!("{}|{}|", tier, currency.trim().to_uppercase());
    for (index, line) in ordered.iter().enumerate() {
        if index > 0 {
            canonical.push(';');
        }
        let _ = write!(
            canonical,
            "{}:{}:{}",
            line.variant_id, line.quantity, line.resolved_unit_price
        );
    }

    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::pricing::PriceSource;
    use crate::domain::value_objects::UnitPrice;
    use rust_decimal::Decimal;

    fn line(variant_id: &str, quantity: u32, price: i64, source: PriceSource) -> ResolvedPriceLine {
        ResolvedPriceLine {
            variant_id: variant_id.to_string(),
            quantity,
            resolved_unit_price: UnitPrice::new(Decimal::from(price)).unwrap(),
            source,
        }
    }

    #[test]
    fn test_line_order_does_not_matter() {
        let tier = Tier::new("agent");
        let forward = [line("111", 1, 80, PriceSource::FixedTier), line("222", 2, 60, PriceSource::FixedTier)];
        let backward = [line("222", 2, 60, PriceSource::FixedTier), line("111", 1, 80, PriceSource::FixedTier)];
        assert_eq!(
            build_pricing_hash(&tier, "ZAR", &forward),
            build_pricing_hash(&tier, "ZAR", &backward)
        );
    }

    #[test]
    fn test_any_price_change_changes_the_hash() {
        let tier = Tier::new("agent");
        let before = [line("111", 1, 80, PriceSource::FixedTier), line("222", 2, 60, PriceSource::FixedTier)];
        let after = [line("111", 1, 80, PriceSource::FixedTier), line("222", 2, 61, PriceSource::FixedTier)];
        assert_ne!(build_pricing_hash(&tier, "ZAR", &before), build_pricing_hash(&tier, "ZAR", &after));
    }

    #[test]
    fn test_tier_and_currency_change_the_hash() {
        let lines = [line("111", 1, 80, PriceSource::FixedTier)];
        let agent = build_pricing_hash(&Tier::new("agent"), "ZAR", &lines);
        assert_ne!(agent, build_pricing_hash(&Tier::new("retail"), "ZAR", &lines));
        assert_ne!(agent, build_pricing_hash(&Tier::new("agent"), "USD", &lines));
    }

    #[test]
    fn test_source_tag_is_not_hashed() {
        let tier = Tier::new("agent");
        let metafield = [line("111", 1, 80, PriceSource::Metafield)];
        let fallback = [line("111", 1, 80, PriceSource::DiscountFallback)];
        assert_eq!(
            build_pricing_hash(&tier, "ZAR", &metafield),
            build_pricing_hash(&tier, "ZAR", &fallback)
        );
    }

    #[test]
    fn test_equivalent_decimal_renderings_hash_identically() {
        let tier = Tier::new("retail");
        let whole = [ResolvedPriceLine {
            variant_id: "111".to_string(),
            quantity: 1,
            resolved_unit_price: UnitPrice::new(Decimal::from(80)).unwrap(),
            source: PriceSource::FixedTier,
        }];
        let scaled = [ResolvedPriceLine {
            variant_id: "111".to_string(),
            quantity: 1,
            resolved_unit_price: UnitPrice::new(Decimal::new(8000, 2)).unwrap(),
            source: PriceSource::FixedTier,
        }];
        assert_eq!(build_pricing_hash(&tier, "ZAR", &whole), build_pricing_hash(&tier, "ZAR", &scaled));
    }
}
