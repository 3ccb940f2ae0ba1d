//! Draft order pricing reconciliation
//!
//! Detects and corrects pricing drift on a draft order: fetch the order,
//! recompute what its lines should cost under current rules, compare the
//! stored fingerprint and the live line prices against that expectation, and
//! rewrite the order once when they diverge. Re-reading after the write
//! verifies the platform accepted the correction verbatim; disagreement is
//! reported, never retried.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::domain::pricing::hash::build_pricing_hash;
use crate::domain::pricing::{PriceSource, PricingContext, ResolvedPriceLine};
use crate::domain::value_objects::{Quantity, Tier, UnitPrice};
use crate::pricing_service::{self, PricedResolution, VariantCache};
use crate::pricing_store::PricingStore;
use crate::shopify::{DraftOrder, DraftOrderLine, NoteAttribute, OrderSystemClient};
use crate::Result;

/// Note-attribute key carrying the pricing fingerprint. Wire contract with
/// the existing platform data; do not rename.
pub const PRICING_HASH_ATTR: &str = "flss_pricing_hash";
pub const PRICE_TIER_ATTR: &str = "price_tier";

// =============================================================================
// Status store
// =============================================================================

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationStatus {
    pub draft_order_id: String,
    pub tier: Tier,
    pub hash: String,
    pub corrected: bool,
    pub mismatch: bool,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

/// Last-write-wins map of reconciliation outcomes, queryable by the staff UI.
/// Process-lifetime and unbounded: draft order volume is small, and the
/// retention policy is deliberately left to a durable successor.
#[derive(Default)]
pub struct ReconciliationStatusStore {
    inner: std::sync::RwLock<HashMap<String, ReconciliationStatus>>,
}

impl ReconciliationStatusStore {
    pub fn set_status(&self, status: ReconciliationStatus) {
        if let Ok(mut map) = self.inner.write() {
            map.insert(status.draft_order_id.clone(), status);
        }
    }

    pub fn get_status(&self, draft_order_id: &str) -> Option<ReconciliationStatus> {
        self.inner.read().ok().and_then(|map| map.get(draft_order_id).cloned())
    }
}

// =============================================================================
// Reconciler
// =============================================================================

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOutcome {
    pub draft_order_id: String,
    pub tier: Tier,
    pub tier_conflict: bool,
    pub expected_hash: String,
    pub corrected: bool,
    pub mismatch: bool,
    pub lines_checked: usize,
}

pub struct Reconciler {
    client: Arc<dyn OrderSystemClient>,
    store: Arc<PricingStore>,
    status: Arc<ReconciliationStatusStore>,
    default_tier: Tier,
    // Per-draft-order single flight: concurrent triggers for the same id
    // serialize here instead of racing duplicate corrections.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

struct TierResolution {
    tier: Tier,
    tags: Vec<String>,
    conflict: bool,
}

impl Reconciler {
    pub fn new(
        client: Arc<dyn OrderSystemClient>,
        store: Arc<PricingStore>,
        status: Arc<ReconciliationStatusStore>,
        default_tier: Tier,
    ) -> Self {
        Self { client, store, status, default_tier, locks: Mutex::new(HashMap::new()) }
    }

    pub async fn reconcile(
        &self,
        draft_order_id: &str,
        tier_discounts: Option<&BTreeMap<String, Decimal>>,
    ) -> Result<ReconcileOutcome> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(draft_order_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        let _guard = lock.lock().await;
        self.run(draft_order_id, tier_discounts).await
    }

    async fn run(
        &self,
        draft_order_id: &str,
        tier_discounts: Option<&BTreeMap<String, Decimal>>,
    ) -> Result<ReconcileOutcome> {
        // FETCHING: upstream failure here aborts the attempt; no status is
        // recorded for a decision that never completed.
        let order = self.client.fetch_draft_order(draft_order_id).await?;

        let tier_resolution = self.resolve_tier(&order).await?;
        let tier = tier_resolution.tier.clone();
        if tier_resolution.conflict {
            tracing::warn!(
                draft_order_id,
                tier = %tier,
                "customer metafield tier and tag-derived tier disagree"
            );
        }

        // COMPUTING_EXPECTED
        let mut rules = self.store.rules_for_channel(None).await;
        if let Some(overrides) = tier_discounts {
            let mut combined = pricing_service::override_rules(overrides);
            combined.append(&mut rules);
            rules = combined;
        }

        let mut cache = VariantCache::default();
        let mut expected = Vec::new();
        for line in &order.line_items {
            let Some(variant_id) = line.variant_id else {
                // Custom lines carry no variant identity to resolve against;
                // they are preserved verbatim and excluded from the fingerprint.
                continue;
            };
            let base_price = match cache.price(self.client.as_ref(), variant_id).await? {
                Some(price) => Some(price),
                None => line.effective_unit_price(),
            };
            let context = PricingContext {
                variant_id: Some(variant_id.to_string()),
                sku: line.sku.clone(),
                customer_tags: tier_resolution.tags.clone(),
                quantity: Quantity::new(line.quantity),
                currency: Some(order.currency.clone()),
                base_price,
                ..Default::default()
            };
            let PricedResolution { resolution, source } =
                pricing_service::resolve_with_legacy(self.client.as_ref(), &rules, &context, &mut cache)
                    .await?;

            let unit_price = resolution
                .unit_price
                .or(base_price)
                .or_else(|| line.effective_unit_price())
                .unwrap_or(Decimal::ZERO);
            expected.push(ResolvedPriceLine {
                variant_id: variant_id.to_string(),
                quantity: line.quantity,
                resolved_unit_price: UnitPrice::clamped(unit_price),
                source,
            });
        }
        let expected_hash = build_pricing_hash(&tier, &order.currency, &expected);

        // COMPARING: the stored fingerprint says what we stamped last time;
        // the recomputed current hash says what the order actually charges.
        let stored_hash = order.note_attribute(PRICING_HASH_ATTR).map(str::to_string);
        let current_hash = build_pricing_hash(&tier, &order.currency, &current_lines(&order));

        let lines_checked = expected.len();
        if stored_hash.as_deref() == Some(expected_hash.as_str()) && current_hash == expected_hash {
            tracing::debug!(draft_order_id, hash = %expected_hash, "pricing aligned, no write");
            let outcome = ReconcileOutcome {
                draft_order_id: draft_order_id.to_string(),
                tier: tier.clone(),
                tier_conflict: tier_resolution.conflict,
                expected_hash: expected_hash.clone(),
                corrected: false,
                mismatch: false,
                lines_checked,
            };
            self.record(&outcome, "aligned");
            return Ok(outcome);
        }

        // CORRECTING: one full-replace write; every line price becomes its
        // expected resolved price and the fingerprint attribute is re-stamped.
        let corrected_lines = corrected_line_payload(&order, &expected);
        let note_attributes = restamped_attributes(&order, &tier, &expected_hash);
        self.client
            .update_draft_order_lines(draft_order_id, &corrected_lines, &note_attributes)
            .await?;
        tracing::info!(
            draft_order_id,
            stored = stored_hash.as_deref().unwrap_or("<none>"),
            expected = %expected_hash,
            "rewrote stale draft order pricing"
        );

        // VERIFY: re-read and re-hash what the platform actually stored.
        let verified_order = self.client.fetch_draft_order(draft_order_id).await?;
        let verified_hash =
            build_pricing_hash(&tier, &verified_order.currency, &current_lines(&verified_order));
        let mismatch = verified_hash != expected_hash;
        if mismatch {
            tracing::warn!(
                draft_order_id,
                expected = %expected_hash,
                verified = %verified_hash,
                "verification hash disagrees after correction"
            );
        }

        let outcome = ReconcileOutcome {
            draft_order_id: draft_order_id.to_string(),
            tier,
            tier_conflict: tier_resolution.conflict,
            expected_hash,
            corrected: true,
            mismatch,
            lines_checked,
        };
        let message = if mismatch {
            format!("corrected, but verification disagrees (verified {verified_hash})")
        } else {
            "corrected".to_string()
        };
        self.record(&outcome, &message);
        Ok(outcome)
    }

    /// Customer metafield tier wins; tags are the fallback; the configured
    /// default covers everyone else. Conflicts are surfaced, not blocking.
    async fn resolve_tier(&self, order: &DraftOrder) -> Result<TierResolution> {
        let Some(customer) = order.customer.as_ref() else {
            return Ok(TierResolution {
                tier: self.default_tier.clone(),
                tags: Vec::new(),
                conflict: false,
            });
        };

        let metadata = self.client.fetch_customer_tier_metadata(customer.id).await?;
        let metadata_tier = metadata.tier.as_deref().and_then(Tier::normalize);
        let tag_tier = metadata.tags.iter().find_map(|tag| Tier::normalize(tag));

        let conflict = matches!(
            (&metadata_tier, &tag_tier),
            (Some(meta), Some(tag)) if meta != tag
        );
        let tier = metadata_tier.or(tag_tier).unwrap_or_else(|| self.default_tier.clone());

        let mut tags = metadata.tags;
        if !tags.iter().any(|t| t.eq_ignore_ascii_case(tier.as_str())) {
            tags.push(tier.as_str().to_string());
        }
        Ok(TierResolution { tier, tags, conflict })
    }

    fn record(&self, outcome: &ReconcileOutcome, message: &str) {
        self.status.set_status(ReconciliationStatus {
            draft_order_id: outcome.draft_order_id.clone(),
            tier: outcome.tier.clone(),
            hash: outcome.expected_hash.clone(),
            corrected: outcome.corrected,
            mismatch: outcome.mismatch,
            message: message.to_string(),
            updated_at: Utc::now(),
        });
    }
}

/// Fingerprint input for the order's live variant lines, net of applied
/// discounts.
fn current_lines(order: &DraftOrder) -> Vec<ResolvedPriceLine> {
    order
        .line_items
        .iter()
        .filter_map(|line| {
            let variant_id = line.variant_id?;
            let price = line.effective_unit_price()?;
            Some(ResolvedPriceLine {
                variant_id: variant_id.to_string(),
                quantity: line.quantity,
                resolved_unit_price: UnitPrice::clamped(price),
                source: PriceSource::Base,
            })
        })
        .collect()
}

/// Full line replacement: variant lines at their expected resolved price,
/// custom lines preserved verbatim.
fn corrected_line_payload(order: &DraftOrder, expected: &[ResolvedPriceLine]) -> Vec<DraftOrderLine> {
    let expected_by_variant: HashMap<&str, &ResolvedPriceLine> =
        expected.iter().map(|line| (line.variant_id.as_str(), line)).collect();

    order
        .line_items
        .iter()
        .map(|line| {
            let Some(variant_id) = line.variant_id else {
                return line.clone();
            };
            match expected_by_variant.get(variant_id.to_string().as_str()) {
                Some(resolved) => DraftOrderLine {
                    variant_id: Some(variant_id),
                    sku: line.sku.clone(),
                    title: line.title.clone(),
                    quantity: line.quantity,
                    price: Some(resolved.resolved_unit_price.amount()),
                    applied_discount: None,
                },
                None => line.clone(),
            }
        })
        .collect()
}

/// All note attributes survive except the fingerprint, which is re-stamped.
fn restamped_attributes(order: &DraftOrder, tier: &Tier, expected_hash: &str) -> Vec<NoteAttribute> {
    let mut attributes: Vec<NoteAttribute> = order
        .note_attributes
        .iter()
        .filter(|attr| attr.name != PRICING_HASH_ATTR && attr.name != PRICE_TIER_ATTR)
        .cloned()
        .collect();
    attributes.push(NoteAttribute::new(PRICE_TIER_ATTR, tier.as_str()));
    attributes.push(NoteAttribute::new(PRICING_HASH_ATTR, expected_hash));
    attributes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shopify::{CustomerRef, CustomerTierMetadata, NewDraftOrder};
    use crate::BackendError;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::str::FromStr;
    use std::sync::Mutex as StdMutex;

    struct UpdateCall {
        lines: Vec<DraftOrderLine>,
        note_attributes: Vec<NoteAttribute>,
    }

    /// Scripted order system. Updates mutate the held order so the verify
    /// re-fetch observes exactly what was written (unless `corrupt_on_update`
    /// simulates the platform silently adjusting a price).
    struct FakeOrderSystem {
        order: StdMutex<DraftOrder>,
        tier_metadata: CustomerTierMetadata,
        variant_prices: HashMap<i64, Decimal>,
        variant_tiers: HashMap<i64, BTreeMap<String, Value>>,
        updates: StdMutex<Vec<UpdateCall>>,
        corrupt_on_update: bool,
    }

    impl FakeOrderSystem {
        fn new(order: DraftOrder) -> Self {
            Self {
                order: StdMutex::new(order),
                tier_metadata: CustomerTierMetadata {
                    tier: Some("agent".to_string()),
                    tags: vec!["Agent".to_string()],
                },
                variant_prices: HashMap::new(),
                variant_tiers: HashMap::new(),
                updates: StdMutex::new(Vec::new()),
                corrupt_on_update: false,
            }
        }

        fn update_count(&self) -> usize {
            self.updates.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl OrderSystemClient for FakeOrderSystem {
        async fn fetch_draft_order(&self, id: &str) -> Result<DraftOrder> {
            let order = self.order.lock().unwrap();
            if order.id.to_string() != id {
                return Err(BackendError::DraftOrderNotFound(id.to_string()));
            }
            Ok(order.clone())
        }

        async fn update_draft_order_lines(
            &self,
            _id: &str,
            lines: &[DraftOrderLine],
            note_attributes: &[NoteAttribute],
        ) -> Result<()> {
            let mut order = self.order.lock().unwrap();
            order.line_items = lines.to_vec();
            order.note_attributes = note_attributes.to_vec();
            if self.corrupt_on_update {
                if let Some(line) = order.line_items.first_mut() {
                    line.price = line.price.map(|p| p + Decimal::ONE);
                }
            }
            self.updates.lock().unwrap().push(UpdateCall {
                lines: lines.to_vec(),
                note_attributes: note_attributes.to_vec(),
            });
            Ok(())
        }

        async fn create_draft_order(&self, _draft: &NewDraftOrder) -> Result<DraftOrder> {
            unimplemented!("not used in reconciliation tests")
        }

        async fn fetch_customer_tier_metadata(&self, _customer_id: i64) -> Result<CustomerTierMetadata> {
            Ok(self.tier_metadata.clone())
        }

        async fn fetch_variant_price(&self, variant_id: i64) -> Result<Option<Decimal>> {
            Ok(self.variant_prices.get(&variant_id).copied())
        }

        async fn fetch_variant_price_tiers(
            &self,
            variant_id: i64,
        ) -> Result<Option<BTreeMap<String, Value>>> {
            Ok(self.variant_tiers.get(&variant_id).cloned())
        }
    }

    fn order_with_lines(lines: Vec<DraftOrderLine>, note_attributes: Vec<NoteAttribute>) -> DraftOrder {
        DraftOrder {
            id: 9001,
            name: Some("#D9001".to_string()),
            currency: "ZAR".to_string(),
            customer: Some(CustomerRef { id: 77, tags: None }),
            line_items: lines,
            note_attributes,
            invoice_url: None,
        }
    }

    fn variant_line(variant_id: i64, quantity: u32, price: &str) -> DraftOrderLine {
        DraftOrderLine {
            variant_id: Some(variant_id),
            quantity,
            price: Some(Decimal::from_str(price).unwrap()),
            ..Default::default()
        }
    }

    async fn reconciler_for(
        system: Arc<FakeOrderSystem>,
    ) -> (tempfile::TempDir, Reconciler, Arc<ReconciliationStatusStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(PricingStore::open(&dir.path().join("pricing-model.json")).await.unwrap());
        let status = Arc::new(ReconciliationStatusStore::default());
        let reconciler =
            Reconciler::new(system, store, Arc::clone(&status), Tier::new("retail"));
        (dir, reconciler, status)
    }

    /// Expected pricing for variant 111: agent tier metafield at 72.00,
    /// catalog price 90.00.
    fn agent_system(lines: Vec<DraftOrderLine>, note_attributes: Vec<NoteAttribute>) -> FakeOrderSystem {
        let mut system = FakeOrderSystem::new(order_with_lines(lines, note_attributes));
        system.variant_prices.insert(111, Decimal::from(90));
        system.variant_tiers.insert(
            111,
            serde_json::from_value(serde_json::json!({"default": 90, "agent": 72})).unwrap(),
        );
        system
    }

    fn aligned_hash() -> String {
        build_pricing_hash(
            &Tier::new("agent"),
            "ZAR",
            &[ResolvedPriceLine {
                variant_id: "111".to_string(),
                quantity: 2,
                resolved_unit_price: UnitPrice::clamped(Decimal::from(72)),
                source: PriceSource::Metafield,
            }],
        )
    }

    #[tokio::test]
    async fn test_aligned_order_issues_no_update() {
        let system = Arc::new(agent_system(
            vec![variant_line(111, 2, "72.00")],
            vec![NoteAttribute::new(PRICING_HASH_ATTR, aligned_hash())],
        ));
        let (_dir, reconciler, status) = reconciler_for(Arc::clone(&system)).await;

        let outcome = reconciler.reconcile("9001", None).await.unwrap();
        assert!(!outcome.corrected);
        assert!(!outcome.mismatch);
        assert_eq!(outcome.lines_checked, 1);
        assert_eq!(system.update_count(), 0);

        let recorded = status.get_status("9001").unwrap();
        assert!(!recorded.corrected);
        assert_eq!(recorded.message, "aligned");
    }

    #[tokio::test]
    async fn test_stale_order_is_corrected_exactly_once() {
        // Stored fingerprint predates a tier price change and the line still
        // charges the old 80.00.
        let system = Arc::new(agent_system(
            vec![variant_line(111, 2, "80.00")],
            vec![
                NoteAttribute::new("po_number", "PO-7"),
                NoteAttribute::new(PRICING_HASH_ATTR, "stale-fingerprint"),
            ],
        ));
        let (_dir, reconciler, status) = reconciler_for(Arc::clone(&system)).await;

        let outcome = reconciler.reconcile("9001", None).await.unwrap();
        assert!(outcome.corrected);
        assert!(!outcome.mismatch);
        assert_eq!(system.update_count(), 1);

        {
            let updates = system.updates.lock().unwrap();
            let call = &updates[0];
            assert_eq!(call.lines[0].price, Some(Decimal::from_str("72.00").unwrap()));
            assert!(call.lines[0].applied_discount.is_none());
            // Unrelated attributes survive; the fingerprint is re-stamped.
            assert!(call.note_attributes.iter().any(|a| a.name == "po_number" && a.value == "PO-7"));
            let stamped = call
                .note_attributes
                .iter()
                .find(|a| a.name == PRICING_HASH_ATTR)
                .expect("fingerprint stamped");
            assert_eq!(stamped.value, outcome.expected_hash);
        }

        assert!(status.get_status("9001").unwrap().corrected);

        // Second pass sees the corrected order and is a no-op.
        let second = reconciler.reconcile("9001", None).await.unwrap();
        assert!(!second.corrected);
        assert_eq!(system.update_count(), 1);
    }

    #[tokio::test]
    async fn test_verification_mismatch_is_reported_not_retried() {
        let mut inner = agent_system(
            vec![variant_line(111, 2, "80.00")],
            vec![NoteAttribute::new(PRICING_HASH_ATTR, "stale-fingerprint")],
        );
        inner.corrupt_on_update = true;
        let system = Arc::new(inner);
        let (_dir, reconciler, status) = reconciler_for(Arc::clone(&system)).await;

        let outcome = reconciler.reconcile("9001", None).await.unwrap();
        assert!(outcome.corrected);
        assert!(outcome.mismatch);
        assert_eq!(system.update_count(), 1);

        let recorded = status.get_status("9001").unwrap();
        assert!(recorded.mismatch);
        assert!(recorded.message.contains("verification disagrees"));
    }

    #[tokio::test]
    async fn test_fetch_failure_records_no_status() {
        let system = Arc::new(agent_system(vec![variant_line(111, 1, "80.00")], vec![]));
        let (_dir, reconciler, status) = reconciler_for(system).await;

        let err = reconciler.reconcile("404404", None).await.unwrap_err();
        assert!(matches!(err, BackendError::DraftOrderNotFound(_)));
        assert!(status.get_status("404404").is_none());
    }

    #[tokio::test]
    async fn test_tier_discount_override_outranks_metafield() {
        // 10% off the 90.00 catalog price beats the metafield's 72.00 because
        // override rules sort at priority 50.
        let system = Arc::new(agent_system(
            vec![variant_line(111, 1, "90.00")],
            vec![NoteAttribute::new(PRICING_HASH_ATTR, "stale-fingerprint")],
        ));
        let (_dir, reconciler, _status) = reconciler_for(Arc::clone(&system)).await;

        let overrides: BTreeMap<String, Decimal> =
            [("agent".to_string(), Decimal::from(10))].into_iter().collect();
        let outcome = reconciler.reconcile("9001", Some(&overrides)).await.unwrap();
        assert!(outcome.corrected);

        let updates = system.updates.lock().unwrap();
        assert_eq!(updates[0].lines[0].price, Some(Decimal::from_str("81.00").unwrap()));
    }

    #[tokio::test]
    async fn test_custom_lines_pass_through_untouched() {
        let custom = DraftOrderLine {
            title: Some("Handling".to_string()),
            quantity: 1,
            price: Some(Decimal::from(25)),
            ..Default::default()
        };
        let system = Arc::new(agent_system(
            vec![variant_line(111, 2, "80.00"), custom],
            vec![NoteAttribute::new(PRICING_HASH_ATTR, "stale-fingerprint")],
        ));
        let (_dir, reconciler, _status) = reconciler_for(Arc::clone(&system)).await;

        let outcome = reconciler.reconcile("9001", None).await.unwrap();
        assert_eq!(outcome.lines_checked, 1);
        assert!(!outcome.mismatch);

        let updates = system.updates.lock().unwrap();
        let kept = updates[0].lines.iter().find(|l| l.title.as_deref() == Some("Handling")).unwrap();
        assert_eq!(kept.price, Some(Decimal::from(25)));
    }
}
