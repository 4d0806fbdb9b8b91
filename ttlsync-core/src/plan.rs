//! Diff planner
//!
//! Compares the fingerprint of every (dataset, model) group in a canonical
//! document with the one committed in the state store, and decides what the
//! updater has to do. Planning only reads fingerprints; the updater reads
//! identifier mappings for a group before it sends anything for that group.

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

use crate::document::CanonicalDocument;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::state::SyncStateStore;

/// Outcome of comparing stored and fresh fingerprints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Never synced: insert only
    New,
    /// Same content as the last sync: nothing to do
    Unchanged,
    /// Content differs: delete then insert
    Changed,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Classification::New => "new",
            Classification::Unchanged => "unchanged",
            Classification::Changed => "changed",
        };
        write!(f, "{}", s)
    }
}

/// Pure classification by exact digest equality.
pub fn classify(stored: Option<&Fingerprint>, new: &Fingerprint) -> Classification {
    match stored {
        None => Classification::New,
        Some(stored) if stored == new => Classification::Unchanged,
        Some(_) => Classification::Changed,
    }
}

/// Decision for one (dataset, model) group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelDecision {
    pub dataset_id: String,
    pub model: String,
    pub classification: Classification,
    pub new_fingerprint: Fingerprint,
    pub stored_fingerprint: Option<Fingerprint>,
    pub record_count: usize,
    /// Classified `Changed` because a force option applied
    pub forced: bool,
}

/// Ordered decisions, by dataset then model
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncPlan {
    pub decisions: Vec<ModelDecision>,
}

impl SyncPlan {
    pub fn count(&self, classification: Classification) -> usize {
        self.decisions
            .iter()
            .filter(|d| d.classification == classification)
            .count()
    }

    pub fn dataset_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        for decision in &self.decisions {
            if ids.last() != Some(&decision.dataset_id.as_str()) {
                ids.push(&decision.dataset_id);
            }
        }
        ids
    }

    pub fn is_noop(&self) -> bool {
        self.decisions
            .iter()
            .all(|d| d.classification == Classification::Unchanged)
    }
}

/// Planner restrictions and overrides
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Only plan this dataset
    pub dataset: Option<String>,
    /// Treat every previously synced group as changed
    pub force_all: bool,
    /// Treat previously synced groups of these models as changed
    pub force_models: BTreeSet<String>,
    /// Datasets already completed by an interrupted run
    pub skip_datasets: BTreeSet<String>,
}

pub struct DiffPlanner<'a> {
    store: &'a dyn SyncStateStore,
    options: PlanOptions,
}

impl<'a> DiffPlanner<'a> {
    pub fn new(store: &'a dyn SyncStateStore, options: PlanOptions) -> Self {
        Self { store, options }
    }

    pub async fn plan(&self, document: &CanonicalDocument) -> Result<SyncPlan> {
        if let Some(dataset) = &self.options.dataset {
            if !document.contains_dataset(dataset) {
                return Err(Error::UnknownDataset(dataset.clone()));
            }
        }

        let mut plan = SyncPlan::default();
        for dataset_id in document.dataset_ids() {
            if let Some(only) = &self.options.dataset {
                if only != dataset_id {
                    continue;
                }
            }
            if self.options.skip_datasets.contains(dataset_id) {
                tracing::info!("Skipping {} (completed by a previous run)", dataset_id);
                continue;
            }

            for (model, records) in document.models(dataset_id) {
                let new_fingerprint = Fingerprint::of_records(records);
                let stored_fingerprint = self.store.get(dataset_id, model).await?;
                let mut classification = classify(stored_fingerprint.as_ref(), &new_fingerprint);

                let force = self.options.force_all || self.options.force_models.contains(model);
                let forced = force && classification == Classification::Unchanged;
                if forced {
                    classification = Classification::Changed;
                }

                tracing::debug!(
                    "{}/{}: {} ({} records, {})",
                    dataset_id,
                    model,
                    classification,
                    records.len(),
                    new_fingerprint.short()
                );
                plan.decisions.push(ModelDecision {
                    dataset_id: dataset_id.to_string(),
                    model: model.to_string(),
                    classification,
                    new_fingerprint,
                    stored_fingerprint,
                    record_count: records.len(),
                    forced,
                });
            }
        }

        tracing::info!(
            "Plan: {} new, {} changed, {} unchanged",
            plan.count(Classification::New),
            plan.count(Classification::Changed),
            plan.count(Classification::Unchanged)
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Record;
    use crate::state::MemoryStateStore;

    fn document() -> CanonicalDocument {
        let mut doc = CanonicalDocument::new();
        doc.add_dataset("D1", ["sample", "subject"]);
        doc.add_dataset("D2", ["sample", "subject"]);
        doc.set_records("D1", "sample", vec![Record::new("id:1").with_field("val", "a")]);
        doc.set_records("D2", "subject", vec![Record::new("s1").with_field("sex", "f")]);
        doc
    }

    #[test]
    fn test_classify() {
        let a = Fingerprint::new([1u8; 32]);
        let b = Fingerprint::new([2u8; 32]);
        assert_eq!(classify(None, &a), Classification::New);
        assert_eq!(classify(Some(&a), &a), Classification::Unchanged);
        assert_eq!(classify(Some(&b), &a), Classification::Changed);
    }

    #[tokio::test]
    async fn test_plan_order_and_classes() {
        let doc = document();
        let store = MemoryStateStore::new();
        store
            .put("D1", "sample", &Fingerprint::of_records(doc.records("D1", "sample")))
            .await
            .unwrap();
        store.put("D1", "subject", &Fingerprint::new([0u8; 32])).await.unwrap();

        let plan = DiffPlanner::new(&store, PlanOptions::default())
            .plan(&doc)
            .await
            .unwrap();
        let summary: Vec<_> = plan
            .decisions
            .iter()
            .map(|d| (d.dataset_id.as_str(), d.model.as_str(), d.classification))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("D1", "sample", Classification::Unchanged),
                ("D1", "subject", Classification::Changed),
                ("D2", "sample", Classification::New),
                ("D2", "subject", Classification::New),
            ]
        );
        assert_eq!(plan.dataset_ids(), vec!["D1", "D2"]);
        assert!(!plan.is_noop());
    }

    #[tokio::test]
    async fn test_force_model() {
        let doc = document();
        let store = MemoryStateStore::new();
        let fp = Fingerprint::of_records(doc.records("D1", "sample"));
        store.put("D1", "sample", &fp).await.unwrap();

        let options = PlanOptions {
            force_models: ["sample".to_string()].into_iter().collect(),
            dataset: Some("D1".to_string()),
            ..Default::default()
        };
        let plan = DiffPlanner::new(&store, options).plan(&doc).await.unwrap();
        assert_eq!(plan.decisions.len(), 2);
        assert_eq!(plan.decisions[0].classification, Classification::Changed);
        assert!(plan.decisions[0].forced);
        assert_eq!(plan.decisions[1].classification, Classification::New);
        assert!(!plan.decisions[1].forced);
    }

    #[tokio::test]
    async fn test_unknown_dataset() {
        let store = MemoryStateStore::new();
        let options = PlanOptions {
            dataset: Some("D9".to_string()),
            ..Default::default()
        };
        let result = DiffPlanner::new(&store, options).plan(&document()).await;
        assert!(matches!(result, Err(Error::UnknownDataset(id)) if id == "D9"));
    }

    #[tokio::test]
    async fn test_skip_datasets() {
        let store = MemoryStateStore::new();
        let options = PlanOptions {
            skip_datasets: ["D1".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let plan = DiffPlanner::new(&store, options).plan(&document()).await.unwrap();
        assert_eq!(plan.dataset_ids(), vec!["D2"]);
    }

    #[tokio::test]
    async fn test_unchanged_plan_is_noop() {
        let doc = document();
        let store = MemoryStateStore::new();
        for dataset in ["D1", "D2"] {
            for model in ["sample", "subject"] {
                let fp = Fingerprint::of_records(doc.records(dataset, model));
                store.put(dataset, model, &fp).await.unwrap();
            }
        }
        let plan = DiffPlanner::new(&store, PlanOptions::default())
            .plan(&doc)
            .await
            .unwrap();
        assert!(plan.is_noop());
        assert_eq!(plan.count(Classification::Unchanged), 4);
    }
}
