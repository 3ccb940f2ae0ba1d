//! Value objects for tier pricing

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Customer pricing segments the scan station recognizes in tags and metafields.
pub const SUPPORTED_TIERS: [&str; 5] = ["agent", "retail", "export", "private", "fkb"];

/// Customer pricing tier value object. Always stored lowercase.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tier(String);

impl Tier {
    /// Trusted constructor (configuration, stored note attributes).
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into().trim().to_lowercase())
    }

    /// Normalize free-form input (tags, request fields). `None` for segments
    /// outside the supported set.
    pub fn normalize(value: &str) -> Option<Self> {
        let normalized = value.trim().to_lowercase();
        if SUPPORTED_TIERS.contains(&normalized.as_str()) { Some(Self(normalized)) } else { None }
    }

    pub fn retail() -> Self { Self("retail".to_string()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

/// Resolved unit price: non-negative money held at exactly two decimals,
/// so `Display` matches the platform's `"80.00"` wire format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitPrice(Decimal);

impl UnitPrice {
    pub fn new(amount: Decimal) -> Result<Self, UnitPriceError> {
        if amount.is_sign_negative() { return Err(UnitPriceError::Negative); }
        let mut normalized = amount.round_dp(2);
        normalized.rescale(2);
        Ok(Self(normalized))
    }

    /// Clamp-at-zero constructor for computed prices.
    pub fn clamped(amount: Decimal) -> Self {
        let mut normalized = amount.max(Decimal::ZERO).round_dp(2);
        normalized.rescale(2);
        Self(normalized)
    }

    pub fn amount(&self) -> Decimal { self.0 }
}

impl fmt::Display for UnitPrice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

#[derive(Debug, Clone)] pub enum UnitPriceError { Negative }
impl std::error::Error for UnitPriceError {}
impl fmt::Display for UnitPriceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "Unit price negative") }
}

/// Line quantity value object; the station never sends less than one unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Quantity(u32);

impl Quantity {
    pub fn new(value: u32) -> Self { Self(value.max(1)) }
    pub fn get(&self) -> u32 { self.0 }
}

impl Default for Quantity { fn default() -> Self { Self(1) } }

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self::new(u32::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_tier_normalize() {
        assert_eq!(Tier::normalize("  Retail ").unwrap().as_str(), "retail");
        assert!(Tier::normalize("wholesale-club").is_none());
    }

    #[test]
    fn test_unit_price_two_decimals() {
        let p = UnitPrice::new(Decimal::from(80)).unwrap();
        assert_eq!(p.to_string(), "80.00");
        let p = UnitPrice::new(Decimal::from_str("82.505").unwrap()).unwrap();
        assert_eq!(p.to_string(), "82.50");
        assert!(UnitPrice::new(Decimal::from_str("-1").unwrap()).is_err());
    }

    #[test]
    fn test_quantity_floor() {
        assert_eq!(Quantity::new(0).get(), 1);
        assert_eq!(Quantity::default().get(), 1);
    }
}
