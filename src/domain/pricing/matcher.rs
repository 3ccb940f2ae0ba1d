//! Condition matching
//!
//! Pure functions; a rule applies only when every condition matches (AND).

use chrono::{DateTime, Utc};

use super::{Condition, PricingContext};

/// Inclusive effective window check; absent bounds are open-ended.
pub(crate) fn within_window(
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    as_of: DateTime<Utc>,
) -> bool {
    if let Some(from) = from {
        if as_of < from {
            return false;
        }
    }
    if let Some(to) = to {
        if as_of > to {
            return false;
        }
    }
    true
}

fn eq_ignore_case(left: Option<&str>, right: &str) -> bool {
    left.unwrap_or("").trim().eq_ignore_ascii_case(right.trim())
}

impl Condition {
    pub fn matches(&self, context: &PricingContext) -> bool {
        match self {
            Condition::CustomerTag { value } => {
                value.iter().any(|expected| {
                    context.customer_tags.iter().any(|tag| tag.trim().eq_ignore_ascii_case(expected.trim()))
                })
            }
            Condition::CustomerGroup { value } => eq_ignore_case(context.customer_group.as_deref(), value),
            Condition::Sku { value } => {
                context.sku.as_deref().map(|sku| value.iter().any(|s| s == sku)).unwrap_or(false)
            }
            Condition::Collection { value } => {
                context.collections.iter().any(|c| value.iter().any(|expected| expected == c))
            }
            Condition::MinQuantity { value } => context.quantity.get() >= *value,
            Condition::Currency { value } => eq_ignore_case(context.currency.as_deref(), value),
            Condition::SalesChannel { value } => eq_ignore_case(context.sales_channel.as_deref(), value),
            Condition::EffectiveDate { from, to } => {
                within_window(*from, *to, context.as_of.unwrap_or_else(Utc::now))
            }
            // Legacy policy: unknown condition types never block a rule. Logged
            // so a new type added without a matcher arm stays visible.
            Condition::Unknown => {
                tracing::warn!("unknown price rule condition type, matching permissively");
                true
            }
        }
    }
}
