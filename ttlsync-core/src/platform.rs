//! Platform record API
//!
//! Bulk operations report partial failure as data: a [`BulkResult`] lists
//! what succeeded and which records failed. An `Err` from these methods means
//! the call as a whole failed (transport, authentication, bad response).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::document::Record;
use crate::error::Result;

/// A record on its way to the platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingRecord {
    /// `@id` of the record in the canonical document
    pub source_id: String,
    /// Previously assigned platform id, if known
    pub platform_id: Option<String>,
    /// Field values, without `@id`
    pub values: Map<String, Value>,
}

impl OutgoingRecord {
    pub fn from_record(record: &Record, platform_id: Option<String>) -> Self {
        Self {
            source_id: record.source_id.clone(),
            platform_id,
            values: record
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

/// Platform id assigned to an inserted record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedId {
    pub source_id: String,
    pub platform_id: String,
}

/// Link from one platform record to another, both by platform id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLink {
    pub from: String,
    /// Field of the source record the link came from
    pub field: String,
    pub target_model: String,
    pub to: String,
}

/// One rejected record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub record_id: String,
    pub reason: String,
}

/// Outcome of a bulk call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkResult {
    pub succeeded: usize,
    #[serde(default)]
    pub assigned: Vec<AssignedId>,
    #[serde(default)]
    pub failures: Vec<RecordFailure>,
}

impl BulkResult {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn merge(&mut self, other: BulkResult) {
        self.succeeded += other.succeeded;
        self.assigned.extend(other.assigned);
        self.failures.extend(other.failures);
    }

    /// First failure reasons, for logs and reports.
    pub fn failure_summary(&self) -> String {
        const SHOWN: usize = 3;
        let mut parts: Vec<String> = self
            .failures
            .iter()
            .take(SHOWN)
            .map(|f| format!("{}: {}", f.record_id, f.reason))
            .collect();
        if self.failures.len() > SHOWN {
            parts.push(format!("... {} more", self.failures.len() - SHOWN));
        }
        format!("{} record(s) failed ({})", self.failures.len(), parts.join("; "))
    }
}

/// Remote record store
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// Check connectivity and credentials before the first mutation
    async fn probe(&self) -> Result<()>;

    /// Insert records into a model of a dataset
    async fn insert_records(
        &self,
        dataset_id: &str,
        model: &str,
        records: &[OutgoingRecord],
    ) -> Result<BulkResult>;

    /// Delete every record of a model of a dataset
    async fn delete_records(&self, dataset_id: &str, model: &str) -> Result<BulkResult>;

    /// Create links from records of `model` to records of other models.
    /// Creating a link that already exists is not an error.
    async fn link_records(
        &self,
        dataset_id: &str,
        model: &str,
        links: &[RecordLink],
    ) -> Result<BulkResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_record_drops_id() {
        let record = Record::new("id:1").with_field("val", "a");
        let out = OutgoingRecord::from_record(&record, Some("P-1".to_string()));
        assert_eq!(out.source_id, "id:1");
        assert_eq!(out.platform_id.as_deref(), Some("P-1"));
        assert_eq!(Value::Object(out.values), serde_json::json!({"val": "a"}));
    }

    #[test]
    fn test_merge_and_summary() {
        let mut total = BulkResult {
            succeeded: 2,
            assigned: vec![AssignedId {
                source_id: "a".to_string(),
                platform_id: "1".to_string(),
            }],
            failures: vec![],
        };
        assert!(total.is_complete());

        total.merge(BulkResult {
            succeeded: 0,
            assigned: vec![],
            failures: (0..5)
                .map(|i| RecordFailure {
                    record_id: format!("r{}", i),
                    reason: "bad".to_string(),
                })
                .collect(),
        });
        assert!(!total.is_complete());
        assert_eq!(total.succeeded, 2);
        assert_eq!(total.assigned.len(), 1);
        let summary = total.failure_summary();
        assert!(summary.starts_with("5 record(s) failed"));
        assert!(summary.contains("... 2 more"));
    }
}
