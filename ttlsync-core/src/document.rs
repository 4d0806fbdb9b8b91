//! Canonical document: `{ dataset_id: { model_name: [record, ...] } }`
//!
//! The document is recomputed from the graph on every run. Datasets and models
//! are kept in ordered maps and records are sorted by `@id`, so two documents
//! built from the same content compare equal and serialize identically.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Key under which a record's source identifier is stored
pub const ID_KEY: &str = "@id";

/// One instance of a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "@id")]
    pub source_id: String,

    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// JSON object form, `@id` included.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(ID_KEY.to_string(), Value::String(self.source_id.clone()));
        for (name, value) in &self.fields {
            map.insert(name.clone(), value.clone());
        }
        Value::Object(map)
    }
}

/// Per-dataset, per-model record groups
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalDocument {
    datasets: BTreeMap<String, BTreeMap<String, Vec<Record>>>,
}

impl CanonicalDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dataset with an empty group for every model name.
    pub fn add_dataset<'a>(&mut self, dataset_id: &str, models: impl IntoIterator<Item = &'a str>) {
        let entry = self.datasets.entry(dataset_id.to_string()).or_default();
        for model in models {
            entry.entry(model.to_string()).or_default();
        }
    }

    /// Replace one model's records; they are sorted by `@id`.
    pub fn set_records(&mut self, dataset_id: &str, model: &str, mut records: Vec<Record>) {
        records.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        self.datasets
            .entry(dataset_id.to_string())
            .or_default()
            .insert(model.to_string(), records);
    }

    /// Records of one group, empty when the group is absent.
    pub fn records(&self, dataset_id: &str, model: &str) -> &[Record] {
        self.datasets
            .get(dataset_id)
            .and_then(|models| models.get(model))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains_dataset(&self, dataset_id: &str) -> bool {
        self.datasets.contains_key(dataset_id)
    }

    pub fn dataset_ids(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }

    /// Model groups of one dataset, in model-name order.
    pub fn models(&self, dataset_id: &str) -> impl Iterator<Item = (&str, &[Record])> {
        self.datasets
            .get(dataset_id)
            .into_iter()
            .flat_map(|models| models.iter().map(|(name, recs)| (name.as_str(), recs.as_slice())))
    }

    pub fn dataset_count(&self) -> usize {
        self.datasets.len()
    }

    pub fn record_count(&self) -> usize {
        self.datasets
            .values()
            .flat_map(|models| models.values())
            .map(Vec::len)
            .sum()
    }

    /// Record count per model name across all datasets.
    pub fn counts_by_model(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for models in self.datasets.values() {
            for (model, records) in models {
                *counts.entry(model.clone()).or_insert(0) += records.len();
            }
        }
        counts
    }

    /// Write as pretty JSON via a temporary file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Load a saved document. Records are re-sorted in case the file was edited.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        let mut document: CanonicalDocument = serde_json::from_str(&data)?;
        for models in document.datasets.values_mut() {
            for records in models.values_mut() {
                records.sort_by(|a, b| a.source_id.cmp(&b.source_id));
            }
        }
        Ok(document)
    }
}

/// Compact JSON with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Identifier-mapping key of a record
pub fn record_key(dataset_id: &str, model: &str, source_id: &str) -> String {
    format!("{}|{}|{}", dataset_id, model, source_id)
}

/// Identifier-mapping key of a dataset
pub fn dataset_key(dataset_id: &str) -> String {
    format!("dataset|{}", dataset_id)
}
