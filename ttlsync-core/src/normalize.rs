//! Graph normalizer
//!
//! Turns a parsed graph into a [`CanonicalDocument`] following a [`Schema`].
//! Normalization is a pure function of (graph, schema): every traversal goes
//! through ordered indexes and every record group is sorted by `@id`, so the
//! output does not depend on the order of the input triples.
//!
//! Problems with individual nodes never abort the run. They are collected as
//! [`ValidationIssue`]s, logged as warnings, and the offending record is left
//! out of its group.

use crate::document::{CanonicalDocument, Record};
use crate::error::{Error, Result};
use crate::graph::{GraphQuery, Term, RDF_TYPE};
use crate::schema::{DatasetLink, ModelSpec, Schema};
use regex::Regex;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A record (or dataset node) that was skipped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub dataset_id: Option<String>,
    pub model: Option<String>,
    pub source_id: Option<String>,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}/{}] {}: {}",
            self.dataset_id.as_deref().unwrap_or("-"),
            self.model.as_deref().unwrap_or("-"),
            self.source_id.as_deref().unwrap_or("-"),
            self.message
        )
    }
}

/// Result of a normalization pass
#[derive(Debug, Clone)]
pub struct Normalized {
    pub document: CanonicalDocument,
    pub issues: Vec<ValidationIssue>,
}

struct CompiledModel<'a> {
    name: &'a str,
    spec: &'a ModelSpec,
    id_pattern: Option<Regex>,
}

/// Schema compiled for repeated use
pub struct Normalizer<'a> {
    schema: &'a Schema,
    dataset_pattern: Regex,
    models: Vec<CompiledModel<'a>>,
}

impl<'a> Normalizer<'a> {
    pub fn new(schema: &'a Schema) -> Result<Self> {
        let dataset_pattern = compile(&schema.dataset.id_pattern, "dataset")?;
        let mut models = Vec::with_capacity(schema.models.len());
        for (name, spec) in &schema.models {
            let id_pattern = match &spec.id_pattern {
                Some(pattern) => Some(compile(pattern, name)?),
                None => None,
            };
            models.push(CompiledModel {
                name: name.as_str(),
                spec,
                id_pattern,
            });
        }
        // Term models collect IRIs from the others, so they run last.
        models.sort_by_key(|m| matches!(m.spec.link, DatasetLink::Terms { .. }));
        Ok(Self {
            schema,
            dataset_pattern,
            models,
        })
    }

    pub fn normalize(&self, graph: &impl GraphQuery) -> Normalized {
        let mut issues = Vec::new();
        let mut document = CanonicalDocument::new();

        let datasets = self.find_datasets(graph, &mut issues);
        for dataset_id in datasets.keys() {
            document.add_dataset(dataset_id, self.schema.model_names());
        }

        // IRIs referenced by accepted records, per dataset
        let mut referenced: BTreeMap<String, BTreeSet<&Term>> = BTreeMap::new();

        for model in &self.models {
            let mut groups: BTreeMap<&str, BTreeMap<String, Record>> = BTreeMap::new();
            let is_terms = matches!(model.spec.link, DatasetLink::Terms { .. });
            let candidates = match &model.spec.link {
                DatasetLink::Terms { predicate } => {
                    self.term_candidates(graph, model, predicate, &referenced)
                }
                _ => self.candidates(graph, model, &datasets, &mut issues),
            };

            for (dataset_id, node) in candidates {
                let Some((dataset_id, _)) = datasets.get_key_value(dataset_id.as_str()) else {
                    issues.push(issue(
                        Some(dataset_id.as_str()),
                        Some(model.name),
                        Some(node.text()),
                        "references a dataset that is not in the graph",
                    ));
                    continue;
                };
                let Some((record, iris)) =
                    self.build_record(graph, model, dataset_id, node, &mut issues)
                else {
                    continue;
                };

                let group = groups.entry(dataset_id.as_str()).or_default();
                if group.contains_key(&record.source_id) {
                    issues.push(issue(
                        Some(dataset_id.as_str()),
                        Some(model.name),
                        Some(record.source_id.as_str()),
                        "duplicate record id, keeping the first node",
                    ));
                    continue;
                }
                group.insert(record.source_id.clone(), record);
                if !is_terms {
                    referenced.entry(dataset_id.clone()).or_default().extend(iris);
                }
            }

            for (dataset_id, records) in groups {
                document.set_records(dataset_id, model.name, records.into_values().collect());
            }
        }

        for problem in &issues {
            tracing::warn!("Validation: {}", problem);
        }
        tracing::info!(
            "Normalized {} datasets, {} records ({} issues)",
            document.dataset_count(),
            document.record_count(),
            issues.len()
        );

        Normalized { document, issues }
    }

    fn find_datasets<'g>(
        &self,
        graph: &'g impl GraphQuery,
        issues: &mut Vec<ValidationIssue>,
    ) -> BTreeMap<String, &'g Term> {
        let mut datasets = BTreeMap::new();
        for node in graph.subjects_of_type(&self.schema.dataset.type_iri) {
            let Some(iri) = node.as_iri() else {
                issues.push(issue(None, None, Some(node.text()), "dataset node is not an IRI"));
                continue;
            };
            let Some(dataset_id) = extract(&self.dataset_pattern, iri) else {
                issues.push(issue(None, None, Some(iri), "no dataset id in dataset IRI"));
                continue;
            };
            if datasets.contains_key(dataset_id) {
                issues.push(issue(
                    Some(dataset_id),
                    None,
                    Some(iri),
                    "several nodes share this dataset id, keeping the first",
                ));
                continue;
            }
            tracing::debug!("Found dataset {}", dataset_id);
            datasets.insert(dataset_id.to_string(), node);
        }
        datasets
    }

    /// `(dataset id, node)` pairs for one model, before record extraction.
    fn candidates<'g>(
        &self,
        graph: &'g impl GraphQuery,
        model: &CompiledModel<'_>,
        datasets: &BTreeMap<String, &'g Term>,
        issues: &mut Vec<ValidationIssue>,
    ) -> Vec<(String, &'g Term)> {
        let mut found = Vec::new();
        match &model.spec.link {
            DatasetLink::SubjectIri => {
                let Some(type_iri) = &model.spec.type_iri else {
                    return found;
                };
                for node in graph.subjects_of_type(type_iri) {
                    match self.dataset_of(node) {
                        Some(dataset_id) => found.push((dataset_id, node)),
                        None => issues.push(issue(
                            None,
                            Some(model.name),
                            Some(node.text()),
                            "node IRI carries no dataset id",
                        )),
                    }
                }
            }
            DatasetLink::Outbound { predicate } => {
                for (node, target) in graph.subject_objects(predicate) {
                    if !self.has_type(graph, node, model.spec) {
                        continue;
                    }
                    match self.dataset_of(target) {
                        Some(dataset_id) => found.push((dataset_id, node)),
                        None => issues.push(issue(
                            None,
                            Some(model.name),
                            Some(node.text()),
                            "link target carries no dataset id",
                        )),
                    }
                }
            }
            DatasetLink::Terms { .. } => {}
            DatasetLink::Inbound { predicate } => {
                for (dataset_id, dataset_node) in datasets {
                    for node in graph.objects(dataset_node, predicate) {
                        if self.has_type(graph, node, model.spec) {
                            found.push((dataset_id.clone(), node));
                        }
                    }
                }
            }
        }
        found
    }

    /// Referenced IRIs that carry `predicate` and the model's type.
    fn term_candidates<'g>(
        &self,
        graph: &'g impl GraphQuery,
        model: &CompiledModel<'_>,
        predicate: &str,
        referenced: &BTreeMap<String, BTreeSet<&'g Term>>,
    ) -> Vec<(String, &'g Term)> {
        let mut found = Vec::new();
        for (dataset_id, iris) in referenced {
            for &node in iris {
                if !graph.objects(node, predicate).is_empty()
                    && self.has_type(graph, node, model.spec)
                {
                    found.push((dataset_id.clone(), node));
                }
            }
        }
        found
    }

    /// Record id a node would get in `target`, used for link field values.
    fn target_id(&self, target: &CompiledModel<'_>, node: &Term) -> String {
        let text = node.text().trim();
        target
            .id_pattern
            .as_ref()
            .and_then(|pattern| extract(pattern, text))
            .unwrap_or_else(|| self.schema.strip_iri(text))
            .to_string()
    }

    /// The record for `node` and the IRIs its fields reference.
    fn build_record<'g>(
        &self,
        graph: &'g impl GraphQuery,
        model: &CompiledModel<'_>,
        dataset_id: &str,
        node: &'g Term,
        issues: &mut Vec<ValidationIssue>,
    ) -> Option<(Record, Vec<&'g Term>)> {
        if node.is_blank() {
            issues.push(issue(
                Some(dataset_id),
                Some(model.name),
                Some(node.text()),
                "blank nodes cannot be records",
            ));
            return None;
        }

        let source_id = match &model.id_pattern {
            Some(pattern) => match extract(pattern, node.text().trim()) {
                Some(id) => id.to_string(),
                None => {
                    issues.push(issue(
                        Some(dataset_id),
                        Some(model.name),
                        Some(node.text()),
                        "record id pattern does not match or yields an empty id",
                    ));
                    return None;
                }
            },
            None => self.schema.strip_iri(node.text().trim()).to_string(),
        };

        let mut record = Record::new(source_id);
        let mut iris = Vec::new();
        for (name, field) in &model.spec.fields {
            let target = field.target.as_deref().and_then(|t| self.model(t));
            let mut values: Vec<Value> = graph
                .objects(node, &field.predicate)
                .into_iter()
                .filter_map(|object| {
                    if object.as_iri().is_some() {
                        iris.push(object);
                    }
                    match target {
                        Some(target) if !object.is_blank() => {
                            Some(Value::String(self.target_id(target, object)))
                        }
                        _ => self.convert_value(graph, dataset_id, object),
                    }
                })
                .collect();
            values.sort_by(compare_values);
            values.dedup();

            if values.is_empty() {
                if field.required {
                    issues.push(issue(
                        Some(dataset_id),
                        Some(model.name),
                        Some(record.source_id.as_str()),
                        &format!("missing required field {}", name),
                    ));
                    return None;
                }
                continue;
            }

            let value = if field.multiple {
                Value::Array(values)
            } else {
                if values.len() > 1 {
                    tracing::warn!(
                        "{}/{} {}: field {} has {} values, keeping the smallest",
                        dataset_id,
                        model.name,
                        record.source_id,
                        name,
                        values.len()
                    );
                }
                values.swap_remove(0)
            };
            record.fields.insert(name.clone(), value);
        }

        if let Some(id_field) = &model.spec.id_field {
            record
                .fields
                .insert(id_field.clone(), Value::String(record.source_id.clone()));
        }

        if record.fields.is_empty() {
            issues.push(issue(
                Some(dataset_id),
                Some(model.name),
                Some(record.source_id.as_str()),
                "record has no fields",
            ));
            return None;
        }
        Some((record, iris))
    }

    fn convert_value(&self, graph: &impl GraphQuery, dataset_id: &str, object: &Term) -> Option<Value> {
        match object {
            Term::Iri(iri) => Some(Value::String(self.schema.strip_iri(iri.trim()).to_string())),
            Term::Literal { value, .. } => Some(Value::String(value.trim().to_string())),
            Term::Blank(_) => self.convert_measurement(graph, dataset_id, object),
        }
    }

    fn convert_measurement(
        &self,
        graph: &impl GraphQuery,
        dataset_id: &str,
        node: &Term,
    ) -> Option<Value> {
        let measure = &self.schema.measure;
        let value = graph
            .objects(node, &measure.value_predicate)
            .into_iter()
            .filter(|v| !v.is_blank())
            .map(|v| v.text().trim().to_string())
            .min();
        let Some(value) = value else {
            tracing::warn!("Ignoring a blank node that is not a measurement in {}", dataset_id);
            return None;
        };
        let unit = graph
            .objects(node, &measure.unit_predicate)
            .into_iter()
            .filter(|u| !u.is_blank())
            .map(|u| self.schema.strip_iri(u.text().trim()).to_string())
            .min()
            .unwrap_or_default();
        if unit.is_empty() || unit == "dimensionless" {
            tracing::debug!("Measurement without unit (value {}) in {}", value, dataset_id);
        }

        let mut map = Map::new();
        map.insert("unit".to_string(), Value::String(unit));
        map.insert("value".to_string(), Value::String(value));
        Some(Value::Object(map))
    }

    fn model(&self, name: &str) -> Option<&CompiledModel<'a>> {
        self.models.iter().find(|m| m.name == name)
    }

    fn dataset_of(&self, node: &Term) -> Option<String> {
        let iri = node.as_iri()?;
        extract(&self.dataset_pattern, iri).map(str::to_string)
    }

    fn has_type(&self, graph: &impl GraphQuery, node: &Term, spec: &ModelSpec) -> bool {
        match &spec.type_iri {
            Some(type_iri) => graph
                .objects(node, RDF_TYPE)
                .iter()
                .any(|t| t.as_iri() == Some(type_iri.as_str())),
            None => true,
        }
    }
}

fn compile(pattern: &str, owner: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| Error::Schema(format!("{}: invalid pattern {:?}: {}", owner, pattern, e)))
}

/// Named group `id` when present, otherwise the whole match. Empty ids do not count.
fn extract<'t>(pattern: &Regex, text: &'t str) -> Option<&'t str> {
    let caps = pattern.captures(text)?;
    let m = caps.name("id").or_else(|| caps.get(0))?;
    Some(m.as_str().trim()).filter(|id| !id.is_empty())
}

/// Strings by content, everything else after them by canonical JSON.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::String(_), _) => Ordering::Less,
        (_, Value::String(_)) => Ordering::Greater,
        _ => crate::document::canonical_json(a).cmp(&crate::document::canonical_json(b)),
    }
}

fn issue(
    dataset_id: Option<&str>,
    model: Option<&str>,
    source_id: Option<&str>,
    message: &str,
) -> ValidationIssue {
    ValidationIssue {
        dataset_id: dataset_id.map(str::to_string),
        model: model.map(str::to_string),
        source_id: source_id.map(str::to_string),
        message: message.to_string(),
    }
}
