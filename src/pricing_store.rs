//! Price list store
//!
//! Price lists live in a single JSON document on disk, mirrored in memory
//! behind a lock. One writer (this process) is assumed; staff CRUD volume is
//! tiny. The store is constructed once and injected, so tests get a fresh
//! file each.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::domain::pricing::{PriceList, PriceRule};
use crate::Result;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StoreState {
    price_lists: Vec<PriceList>,
}

pub struct PricingStore {
    path: PathBuf,
    state: RwLock<StoreState>,
}

impl PricingStore {
    /// Load the store, creating an empty document when none exists.
    pub async fn open(path: &Path) -> Result<Self> {
        let state = match tokio::fs::read_to_string(path).await {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self { path: path.to_path_buf(), state: RwLock::new(state) })
    }

    async fn persist(&self, state: &StoreState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, serde_json::to_string_pretty(state)?).await?;
        Ok(())
    }

    pub async fn list_price_lists(&self) -> Vec<PriceList> {
        self.state.read().await.price_lists.clone()
    }

    /// Insert or replace a list. An existing list keeps its id and creation
    /// time; everything else comes from the input.
    pub async fn upsert_list(&self, mut input: PriceList) -> Result<PriceList> {
        let mut state = self.state.write().await;
        input.updated_at = Utc::now();

        let record = match state.price_lists.iter().position(|l| l.id == input.id) {
            Some(index) => {
                input.created_at = state.price_lists[index].created_at;
                state.price_lists[index] = input.clone();
                input
            }
            None => {
                state.price_lists.push(input.clone());
                input
            }
        };

        self.persist(&state).await?;
        Ok(record)
    }

    pub async fn delete_list(&self, list_id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let before = state.price_lists.len();
        state.price_lists.retain(|l| l.id != list_id);
        let removed = state.price_lists.len() != before;
        if removed {
            self.persist(&state).await?;
        }
        Ok(removed)
    }

    /// Insert or replace a rule inside a list. `None` when the list is gone.
    pub async fn upsert_rule(&self, list_id: &str, mut rule: PriceRule) -> Result<Option<PriceRule>> {
        let mut state = self.state.write().await;
        let Some(list) = state.price_lists.iter_mut().find(|l| l.id == list_id) else {
            return Ok(None);
        };

        rule.price_list_id = list_id.to_string();
        let record = match list.rules.iter().position(|r| r.id == rule.id) {
            Some(index) => {
                list.rules[index] = rule.clone();
                rule
            }
            None => {
                list.rules.push(rule.clone());
                rule
            }
        };
        list.updated_at = Utc::now();

        self.persist(&state).await?;
        Ok(Some(record))
    }

    pub async fn delete_rule(&self, list_id: &str, rule_id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(list) = state.price_lists.iter_mut().find(|l| l.id == list_id) else {
            return Ok(false);
        };
        let before = list.rules.len();
        list.rules.retain(|r| r.id != rule_id);
        let removed = list.rules.len() != before;
        if removed {
            list.updated_at = Utc::now();
            self.persist(&state).await?;
        }
        Ok(removed)
    }

    /// Candidate rules for a resolution context: lists scoped to another
    /// sales channel are excluded, everything else contributes its rules.
    pub async fn rules_for_channel(&self, sales_channel: Option<&str>) -> Vec<PriceRule> {
        self.state
            .read()
            .await
            .price_lists
            .iter()
            .filter(|list| match (&list.channel, sales_channel) {
                (Some(channel), Some(requested)) => channel.eq_ignore_ascii_case(requested),
                _ => true,
            })
            .flat_map(|list| list.rules.iter().cloned())
            .collect()
    }
}
