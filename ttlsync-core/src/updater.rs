//! Platform updater
//!
//! Executes a [`SyncPlan`] against the platform:
//! - `Unchanged`: nothing is sent, nothing is written
//! - `New`: insert all records, then commit the new fingerprint
//! - `Changed`: delete the remote records, insert, then commit
//!
//! With link rules configured, a dataset gets a link pass after its models are
//! synced. A model is relinked when it was inserted or replaced, or when a
//! model it links to was. Its fingerprint is committed only after its links
//! are created.
//!
//! The fingerprint of a group is committed only after every platform call for
//! it succeeded. A failed delete or a partial insert leaves the stored
//! fingerprint untouched, so the next run classifies the group `Changed` again.
//! Platform failures are reported per model and the run continues; state
//! store failures abort the run.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use crate::document::{record_key, CanonicalDocument, Record};
use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::plan::{Classification, ModelDecision, SyncPlan};
use crate::platform::{AssignedId, BulkResult, OutgoingRecord, PlatformApi, RecordLink};
use crate::resume::ResumeJournal;
use crate::schema::LinkRule;
use crate::state::SyncStateStore;

/// Records per insert call unless configured otherwise
pub const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct UpdaterOptions {
    pub batch_size: usize,
    /// Log intended mutations without calling the platform or writing state
    pub dry_run: bool,
    /// Append fully synced datasets to this journal
    pub resume_journal: Option<PathBuf>,
    /// Link fields to create after insertion
    pub links: Vec<LinkRule>,
}

impl Default for UpdaterOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            dry_run: false,
            resume_journal: None,
            links: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Delete,
    Insert,
    Link,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureStage::Delete => write!(f, "delete"),
            FailureStage::Insert => write!(f, "insert"),
            FailureStage::Link => write!(f, "link"),
        }
    }
}

/// What happened to one (dataset, model) group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ModelOutcome {
    Skipped,
    Inserted { records: usize },
    Replaced { deleted: usize, inserted: usize },
    Cleared { deleted: usize },
    /// Unchanged records whose links were recreated
    Relinked { links: usize },
    Failed { stage: FailureStage, reason: String },
    /// Dry run: what would have been sent
    Planned { delete: bool, insert: usize },
}

impl fmt::Display for ModelOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelOutcome::Skipped => write!(f, "skipped"),
            ModelOutcome::Inserted { records } => write!(f, "inserted {}", records),
            ModelOutcome::Replaced { deleted, inserted } => {
                write!(f, "replaced (deleted {}, inserted {})", deleted, inserted)
            }
            ModelOutcome::Cleared { deleted } => write!(f, "cleared {}", deleted),
            ModelOutcome::Relinked { links } => write!(f, "relinked {}", links),
            ModelOutcome::Failed { stage, reason } => write!(f, "FAILED at {}: {}", stage, reason),
            ModelOutcome::Planned { delete, insert } => {
                if *delete {
                    write!(f, "would delete and insert {}", insert)
                } else {
                    write!(f, "would insert {}", insert)
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelReport {
    pub dataset_id: String,
    pub model: String,
    pub outcome: ModelOutcome,
}

/// Per-model outcomes of one run, in plan order
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub models: Vec<ModelReport>,
    /// Datasets whose models all succeeded (or were skipped)
    pub completed_datasets: Vec<String>,
}

impl SyncReport {
    fn count(&self, pred: impl Fn(&ModelOutcome) -> bool) -> usize {
        self.models.iter().filter(|m| pred(&m.outcome)).count()
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, ModelOutcome::Skipped))
    }

    pub fn inserted(&self) -> usize {
        self.count(|o| matches!(o, ModelOutcome::Inserted { .. }))
    }

    pub fn replaced(&self) -> usize {
        self.count(|o| matches!(o, ModelOutcome::Replaced { .. }))
    }

    pub fn cleared(&self) -> usize {
        self.count(|o| matches!(o, ModelOutcome::Cleared { .. }))
    }

    pub fn relinked(&self) -> usize {
        self.count(|o| matches!(o, ModelOutcome::Relinked { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ModelOutcome::Failed { .. }))
    }

    pub fn planned(&self) -> usize {
        self.count(|o| matches!(o, ModelOutcome::Planned { .. }))
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &ModelReport> {
        self.models
            .iter()
            .filter(|m| matches!(m.outcome, ModelOutcome::Failed { .. }))
    }

    /// Number of distinct datasets in the report
    pub fn dataset_count(&self) -> usize {
        let mut count = 0;
        let mut last: Option<&str> = None;
        for m in &self.models {
            if last != Some(m.dataset_id.as_str()) {
                count += 1;
                last = Some(&m.dataset_id);
            }
        }
        count
    }
}

pub struct PlatformUpdater<'a> {
    store: &'a dyn SyncStateStore,
    platform: Option<&'a dyn PlatformApi>,
    options: UpdaterOptions,
}

impl<'a> PlatformUpdater<'a> {
    /// Without a platform every run is a dry run.
    pub fn new(
        store: &'a dyn SyncStateStore,
        platform: Option<&'a dyn PlatformApi>,
        options: UpdaterOptions,
    ) -> Self {
        Self {
            store,
            platform,
            options,
        }
    }

    /// The platform to mutate, or `None` for a dry run.
    fn target(&self) -> Option<&'a dyn PlatformApi> {
        if self.options.dry_run {
            None
        } else {
            self.platform
        }
    }

    pub async fn apply(&self, plan: &SyncPlan, document: &CanonicalDocument) -> Result<SyncReport> {
        let target = self.target();
        let mut journal = match (&self.options.resume_journal, target) {
            (Some(path), Some(_)) => Some(ResumeJournal::load(path)?),
            _ => None,
        };
        let mut probed = false;
        let mut report = SyncReport::default();

        for decisions in plan.decisions.chunk_by(|a, b| a.dataset_id == b.dataset_id) {
            let mut outcomes = Vec::with_capacity(decisions.len());
            for decision in decisions {
                let records = document.records(&decision.dataset_id, &decision.model);
                let outcome = match (decision.classification, target) {
                    (Classification::Unchanged, _) => {
                        tracing::debug!("{}/{}: unchanged, skipping", decision.dataset_id, decision.model);
                        ModelOutcome::Skipped
                    }
                    (classification, None) => {
                        let outcome = ModelOutcome::Planned {
                            delete: classification == Classification::Changed,
                            insert: records.len(),
                        };
                        tracing::info!("[dry-run] {}/{}: {}", decision.dataset_id, decision.model, outcome);
                        outcome
                    }
                    (_, Some(platform)) => {
                        if !probed {
                            platform.probe().await?;
                            probed = true;
                        }
                        let commit = !self.has_links(&decision.model);
                        self.sync_model(platform, decision, records, commit).await?
                    }
                };
                outcomes.push(outcome);
            }

            match target {
                Some(platform) if !self.options.links.is_empty() => {
                    self.link_dataset(platform, decisions, &mut outcomes, document)
                        .await?
                }
                None => {
                    for (decision, outcome) in decisions.iter().zip(&outcomes) {
                        if matches!(outcome, ModelOutcome::Planned { .. }) && self.has_links(&decision.model) {
                            tracing::info!("[dry-run] {}/{}: would relink", decision.dataset_id, decision.model);
                        }
                    }
                }
                _ => {}
            }

            let mut dataset_ok = true;
            for (decision, outcome) in decisions.iter().zip(outcomes) {
                if let ModelOutcome::Failed { stage, reason } = &outcome {
                    tracing::error!(
                        "{}/{}: {} failed: {}",
                        decision.dataset_id,
                        decision.model,
                        stage,
                        reason
                    );
                    dataset_ok = false;
                }
                report.models.push(ModelReport {
                    dataset_id: decision.dataset_id.clone(),
                    model: decision.model.clone(),
                    outcome,
                });
            }

            if let Some(first) = decisions.first() {
                if dataset_ok {
                    report.completed_datasets.push(first.dataset_id.clone());
                    if let Some(journal) = journal.as_mut() {
                        journal.mark_completed(&first.dataset_id)?;
                    }
                }
            }
        }

        tracing::info!(
            "Sync finished: {} skipped, {} inserted, {} replaced, {} relinked, {} failed, {} planned",
            report.skipped(),
            report.inserted(),
            report.replaced(),
            report.relinked(),
            report.failed(),
            report.planned()
        );
        Ok(report)
    }

    /// Delete every record of the given models of one dataset and mark the
    /// groups as empty in the state store.
    pub async fn clear_dataset(&self, dataset_id: &str, models: &[String]) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let target = self.target();
        if let Some(platform) = target {
            platform.probe().await?;
        }
        let platform_dataset = self.platform_dataset_id(dataset_id).await?;

        for model in models {
            let outcome = match target {
                None => {
                    let outcome = ModelOutcome::Planned {
                        delete: true,
                        insert: 0,
                    };
                    tracing::info!("[dry-run] {}/{}: {}", dataset_id, model, outcome);
                    outcome
                }
                Some(platform) => match platform.delete_records(&platform_dataset, model).await {
                    Ok(result) if result.is_complete() => {
                        self.store.put(dataset_id, model, &Fingerprint::empty()).await?;
                        tracing::info!("{}/{}: deleted {} records", dataset_id, model, result.succeeded);
                        ModelOutcome::Cleared {
                            deleted: result.succeeded,
                        }
                    }
                    Ok(result) => ModelOutcome::Failed {
                        stage: FailureStage::Delete,
                        reason: result.failure_summary(),
                    },
                    Err(e) => ModelOutcome::Failed {
                        stage: FailureStage::Delete,
                        reason: e.to_string(),
                    },
                },
            };
            if let ModelOutcome::Failed { reason, .. } = &outcome {
                tracing::error!("{}/{}: clear failed: {}", dataset_id, model, reason);
            }
            report.models.push(ModelReport {
                dataset_id: dataset_id.to_string(),
                model: model.clone(),
                outcome,
            });
        }
        if !report.has_failures() {
            report.completed_datasets.push(dataset_id.to_string());
        }
        Ok(report)
    }

    async fn sync_model(
        &self,
        platform: &dyn PlatformApi,
        decision: &ModelDecision,
        records: &[Record],
        commit: bool,
    ) -> Result<ModelOutcome> {
        let dataset_id = decision.dataset_id.as_str();
        let model = decision.model.as_str();

        // Store reads first: a store failure must abort before the platform is touched.
        let platform_dataset = self.platform_dataset_id(dataset_id).await?;
        let mut outgoing = Vec::with_capacity(records.len());
        for record in records {
            let key = record_key(dataset_id, model, &record.source_id);
            let platform_id = self.store.get_identifier_mapping(&key).await?;
            outgoing.push(OutgoingRecord::from_record(record, platform_id));
        }

        let mut deleted = None;
        if decision.classification == Classification::Changed {
            match platform.delete_records(&platform_dataset, model).await {
                Ok(result) if result.is_complete() => deleted = Some(result.succeeded),
                Ok(result) => {
                    return Ok(ModelOutcome::Failed {
                        stage: FailureStage::Delete,
                        reason: result.failure_summary(),
                    })
                }
                Err(e) => {
                    return Ok(ModelOutcome::Failed {
                        stage: FailureStage::Delete,
                        reason: e.to_string(),
                    })
                }
            }
        }

        let mut total = BulkResult::default();
        let mut transport_error = None;
        for batch in outgoing.chunks(self.options.batch_size.max(1)) {
            match platform.insert_records(&platform_dataset, model, batch).await {
                Ok(result) => {
                    let complete = result.is_complete();
                    total.merge(result);
                    if !complete {
                        break;
                    }
                }
                Err(e) => {
                    transport_error = Some(e.to_string());
                    break;
                }
            }
        }
        self.record_assigned(dataset_id, model, &total.assigned).await?;

        if let Some(reason) = transport_error {
            return Ok(ModelOutcome::Failed {
                stage: FailureStage::Insert,
                reason,
            });
        }
        if !total.is_complete() {
            return Ok(ModelOutcome::Failed {
                stage: FailureStage::Insert,
                reason: total.failure_summary(),
            });
        }

        if commit {
            self.store.put(dataset_id, model, &decision.new_fingerprint).await?;
        }
        let outcome = match deleted {
            Some(deleted) => ModelOutcome::Replaced {
                deleted,
                inserted: total.succeeded,
            },
            None => ModelOutcome::Inserted {
                records: total.succeeded,
            },
        };
        tracing::info!("{}/{}: {}", dataset_id, model, outcome);
        Ok(outcome)
    }

    fn has_links(&self, model: &str) -> bool {
        self.options.links.iter().any(|rule| rule.model == model)
    }

    /// Link pass over one dataset. Commits the fingerprints that `sync_model`
    /// held back for models with link rules.
    async fn link_dataset(
        &self,
        platform: &dyn PlatformApi,
        decisions: &[ModelDecision],
        outcomes: &mut [ModelOutcome],
        document: &CanonicalDocument,
    ) -> Result<()> {
        let touched: BTreeSet<&str> = decisions
            .iter()
            .zip(outcomes.iter())
            .filter(|(_, o)| matches!(o, ModelOutcome::Inserted { .. } | ModelOutcome::Replaced { .. }))
            .map(|(d, _)| d.model.as_str())
            .collect();
        if touched.is_empty() {
            return Ok(());
        }

        for (decision, outcome) in decisions.iter().zip(outcomes.iter_mut()) {
            let rules: Vec<&LinkRule> = self
                .options
                .links
                .iter()
                .filter(|rule| rule.model == decision.model)
                .collect();
            if rules.is_empty() || matches!(outcome, ModelOutcome::Failed { .. }) {
                continue;
            }
            let changed = touched.contains(decision.model.as_str());
            if !changed && !rules.iter().any(|rule| touched.contains(rule.target.as_str())) {
                continue;
            }

            let dataset_id = decision.dataset_id.as_str();
            let model = decision.model.as_str();
            let platform_dataset = self.platform_dataset_id(dataset_id).await?;
            let records = document.records(dataset_id, model);
            let links = self.resolve_links(dataset_id, model, records, &rules).await?;

            match self.send_links(platform, &platform_dataset, model, &links).await {
                Ok(linked) => {
                    if changed {
                        self.store.put(dataset_id, model, &decision.new_fingerprint).await?;
                        tracing::info!("{}/{}: linked {}", dataset_id, model, linked);
                    } else {
                        *outcome = ModelOutcome::Relinked { links: linked };
                        tracing::info!("{}/{}: {}", dataset_id, model, outcome);
                    }
                }
                Err(reason) => {
                    if !changed {
                        // Force a full resync of the model on the next run.
                        self.store.put(dataset_id, model, &Fingerprint::empty()).await?;
                    }
                    *outcome = ModelOutcome::Failed {
                        stage: FailureStage::Link,
                        reason,
                    };
                }
            }
        }
        Ok(())
    }

    /// Platform ids for every link value of `records`. Values whose source or
    /// target has no platform id yet are skipped with a warning.
    async fn resolve_links(
        &self,
        dataset_id: &str,
        model: &str,
        records: &[Record],
        rules: &[&LinkRule],
    ) -> Result<Vec<RecordLink>> {
        let mut links = Vec::new();
        for record in records {
            let key = record_key(dataset_id, model, &record.source_id);
            let Some(from) = self.store.get_identifier_mapping(&key).await? else {
                tracing::warn!("{}/{}: {} has no platform id, not linked", dataset_id, model, record.source_id);
                continue;
            };
            for rule in rules {
                for value in link_values(record.fields.get(rule.field.as_str())) {
                    let target_key = record_key(dataset_id, &rule.target, value);
                    match self.store.get_identifier_mapping(&target_key).await? {
                        Some(to) => links.push(RecordLink {
                            from: from.clone(),
                            field: rule.field.clone(),
                            target_model: rule.target.clone(),
                            to,
                        }),
                        None => tracing::warn!(
                            "{}/{}: {}.{} points at unknown {} {}",
                            dataset_id,
                            model,
                            record.source_id,
                            rule.field,
                            rule.target,
                            value
                        ),
                    }
                }
            }
        }
        Ok(links)
    }

    /// Send links in batches. Returns the number created, or the failure reason.
    async fn send_links(
        &self,
        platform: &dyn PlatformApi,
        platform_dataset: &str,
        model: &str,
        links: &[RecordLink],
    ) -> std::result::Result<usize, String> {
        let mut total = BulkResult::default();
        for batch in links.chunks(self.options.batch_size.max(1)) {
            let result = platform
                .link_records(platform_dataset, model, batch)
                .await
                .map_err(|e| e.to_string())?;
            total.merge(result);
            if !total.is_complete() {
                return Err(total.failure_summary());
            }
        }
        Ok(total.succeeded)
    }

    async fn record_assigned(&self, dataset_id: &str, model: &str, assigned: &[AssignedId]) -> Result<()> {
        for a in assigned {
            let key = record_key(dataset_id, model, &a.source_id);
            self.store.put_identifier_mapping(&key, &a.platform_id).await?;
        }
        Ok(())
    }

    /// Dataset id on the platform, falling back to the graph id.
    async fn platform_dataset_id(&self, dataset_id: &str) -> Result<String> {
        Ok(self
            .store
            .get_dataset_mapping(dataset_id)
            .await?
            .unwrap_or_else(|| dataset_id.to_string()))
    }
}

fn link_values(value: Option<&Value>) -> Vec<&str> {
    match value {
        Some(Value::String(s)) => vec![s.as_str()],
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}
