//! Schema mapping from graph predicates to platform models
//!
//! A [`Schema`] is loaded once per run (from TOML, or the built-in SPARC
//! mapping) and passed explicitly into the normalizer. CURIEs such as
//! `sparc:Subject` are expanded against `prefixes` when the schema is loaded,
//! so the rest of the engine only ever sees full IRIs.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

const BUILTIN_SPARC: &str = include_str!("../schema/sparc.toml");

/// Complete mapping used by the normalizer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    /// IRI prefixes removed from IRI values and identifiers, first match wins
    #[serde(default)]
    pub strip_prefixes: Vec<String>,

    /// CURIE prefix → namespace IRI
    #[serde(default)]
    pub prefixes: BTreeMap<String, String>,

    pub dataset: DatasetRule,

    #[serde(default)]
    pub measure: MeasureRule,

    pub models: BTreeMap<String, ModelSpec>,
}

/// How dataset nodes are recognised
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetRule {
    #[serde(rename = "type")]
    pub type_iri: String,

    /// Regex locating the dataset id inside an IRI
    pub id_pattern: String,
}

/// Predicates of a blank-node measurement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasureRule {
    pub value_predicate: String,
    pub unit_predicate: String,
}

impl Default for MeasureRule {
    fn default() -> Self {
        Self {
            value_predicate: crate::graph::RDF_VALUE.to_string(),
            unit_predicate: "http://uri.interlex.org/temp/uris/hasUnit".to_string(),
        }
    }
}

/// How a node is attached to its dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatasetLink {
    /// The dataset id is embedded in the node IRI
    #[default]
    SubjectIri,
    /// `node predicate <dataset-iri>`
    Outbound { predicate: String },
    /// `<dataset-node> predicate node`
    Inbound { predicate: String },
    /// IRIs used as field values by the other models of the dataset that
    /// carry `predicate` (typically a label)
    Terms { predicate: String },
}

/// One platform model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Required `rdf:type` of candidate nodes
    #[serde(rename = "type", default)]
    pub type_iri: Option<String>,

    #[serde(default)]
    pub link: DatasetLink,

    /// Regex extracting the record id from the node text
    #[serde(default)]
    pub id_pattern: Option<String>,

    /// Also store the record id under this field name
    #[serde(default)]
    pub id_field: Option<String>,

    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
}

/// One field of a model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub predicate: String,

    #[serde(default)]
    pub required: bool,

    /// Multi-valued: stored as a sorted array
    #[serde(default)]
    pub multiple: bool,

    /// Values are `@id`s of records of this model, linked on the platform
    #[serde(default)]
    pub target: Option<String>,
}

/// A field whose values point at records of another model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRule {
    pub model: String,
    pub field: String,
    pub target: String,
}

impl Schema {
    /// Parse a TOML schema, expand CURIEs and validate it.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let mut schema: Schema = toml::from_str(text)?;
        schema.expand_curies();
        schema.validate()?;
        Ok(schema)
    }

    /// Load a schema file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let schema = Self::from_toml_str(&text)
            .map_err(|e| Error::Schema(format!("{}: {}", path.display(), e)))?;
        tracing::debug!(
            "Loaded schema from {} with {} models",
            path.display(),
            schema.models.len()
        );
        Ok(schema)
    }

    /// The mapping for the SPARC curation export.
    pub fn builtin() -> Result<Self> {
        Self::from_toml_str(BUILTIN_SPARC)
    }

    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    /// Every field with a `target`, ordered by model then field.
    pub fn link_rules(&self) -> Vec<LinkRule> {
        let mut rules = Vec::new();
        for (model, spec) in &self.models {
            for (field, field_spec) in &spec.fields {
                if let Some(target) = &field_spec.target {
                    rules.push(LinkRule {
                        model: model.clone(),
                        field: field.clone(),
                        target: target.clone(),
                    });
                }
            }
        }
        rules
    }

    /// Expand `prefix:local` when `prefix` is declared; anything else is returned as is.
    pub fn expand(&self, value: &str) -> String {
        if let Some((prefix, local)) = value.split_once(':') {
            if !local.starts_with("//") {
                if let Some(namespace) = self.prefixes.get(prefix) {
                    return format!("{}{}", namespace, local);
                }
            }
        }
        value.to_string()
    }

    /// Remove the first matching `strip_prefixes` entry.
    pub fn strip_iri<'a>(&self, iri: &'a str) -> &'a str {
        for prefix in &self.strip_prefixes {
            if let Some(rest) = iri.strip_prefix(prefix.as_str()) {
                return rest;
            }
        }
        iri
    }

    fn expand_curies(&mut self) {
        let expanded_type = self.expand(&self.dataset.type_iri);
        self.dataset.type_iri = expanded_type;
        self.measure.value_predicate = self.expand(&self.measure.value_predicate);
        self.measure.unit_predicate = self.expand(&self.measure.unit_predicate);

        let mut models = std::mem::take(&mut self.models);
        for model in models.values_mut() {
            model.type_iri = model.type_iri.as_deref().map(|t| self.expand(t));
            match &mut model.link {
                DatasetLink::SubjectIri => {}
                DatasetLink::Outbound { predicate }
                | DatasetLink::Inbound { predicate }
                | DatasetLink::Terms { predicate } => {
                    *predicate = self.expand(predicate);
                }
            }
            for field in model.fields.values_mut() {
                field.predicate = self.expand(&field.predicate);
            }
        }
        self.models = models;
    }

    /// Structural checks; regexes are compiled by the normalizer.
    pub fn validate(&self) -> Result<()> {
        if self.dataset.type_iri.is_empty() {
            return Err(Error::Schema("dataset.type must not be empty".to_string()));
        }
        if self.dataset.id_pattern.is_empty() {
            return Err(Error::Schema(
                "dataset.id_pattern must not be empty".to_string(),
            ));
        }
        if self.models.is_empty() {
            return Err(Error::Schema("no models defined".to_string()));
        }

        for (name, model) in &self.models {
            if name.is_empty() || name.contains('|') {
                return Err(Error::Schema(format!("invalid model name {:?}", name)));
            }
            if model.link == DatasetLink::SubjectIri && model.type_iri.is_none() {
                return Err(Error::Schema(format!(
                    "model {}: subject_iri link requires a type",
                    name
                )));
            }
            if model.fields.is_empty() && model.id_field.is_none() {
                return Err(Error::Schema(format!(
                    "model {}: needs at least one field or an id_field",
                    name
                )));
            }
            for (field, spec) in &model.fields {
                if field.starts_with('@') {
                    return Err(Error::Schema(format!(
                        "model {}: field {} uses the reserved '@' prefix",
                        name, field
                    )));
                }
                if let Some(target) = &spec.target {
                    if !self.models.contains_key(target) {
                        return Err(Error::Schema(format!(
                            "model {}: field {} targets unknown model {}",
                            name, field, target
                        )));
                    }
                }
            }
            if let Some(id_field) = &model.id_field {
                if id_field.starts_with('@') || model.fields.contains_key(id_field) {
                    return Err(Error::Schema(format!(
                        "model {}: id_field {} is reserved or shadows a field",
                        name, id_field
                    )));
                }
            }
        }
        Ok(())
    }
}
