//! In-memory RDF graph
//!
//! Triples are indexed subject → predicate → object set using ordered maps, so
//! every query answers in the same order no matter how the source file listed
//! its statements. Turtle input is parsed with `oxttl`.

use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;

/// `rdf:type`
pub const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";
/// `rdf:value`
pub const RDF_VALUE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#value";

const XSD_STRING: &str = "http://www.w3.org/2001/XMLSchema#string";
const RDF_LANG_STRING: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#langString";

/// A node or value in the graph
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Term {
    Iri(String),
    Blank(String),
    Literal {
        value: String,
        /// Omitted for plain and language-tagged strings.
        datatype: Option<String>,
        language: Option<String>,
    },
}

impl Term {
    pub fn iri(iri: impl Into<String>) -> Self {
        Term::Iri(iri.into())
    }

    pub fn blank(id: impl Into<String>) -> Self {
        Term::Blank(id.into())
    }

    /// Plain string literal
    pub fn literal(value: impl Into<String>) -> Self {
        Term::Literal {
            value: value.into(),
            datatype: None,
            language: None,
        }
    }

    pub fn as_iri(&self) -> Option<&str> {
        match self {
            Term::Iri(iri) => Some(iri),
            _ => None,
        }
    }

    pub fn is_blank(&self) -> bool {
        matches!(self, Term::Blank(_))
    }

    /// IRI, blank node label or lexical form, depending on the kind.
    pub fn text(&self) -> &str {
        match self {
            Term::Iri(s) | Term::Blank(s) => s,
            Term::Literal { value, .. } => value,
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Iri(iri) => write!(f, "<{}>", iri),
            Term::Blank(id) => write!(f, "_:{}", id),
            Term::Literal { value, .. } => write!(f, "{:?}", value),
        }
    }
}

/// A single statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Triple {
    pub subject: Term,
    pub predicate: String,
    pub object: Term,
}

impl Triple {
    pub fn new(subject: Term, predicate: impl Into<String>, object: Term) -> Self {
        Self {
            subject,
            predicate: predicate.into(),
            object,
        }
    }
}

/// Read access to a parsed graph, as consumed by the normalizer
pub trait GraphQuery {
    /// All subjects carrying `rdf:type <type_iri>`.
    fn subjects_of_type(&self, type_iri: &str) -> Vec<&Term>;

    /// All objects of `(subject, predicate, ?)`.
    fn objects(&self, subject: &Term, predicate: &str) -> Vec<&Term>;

    /// All `(subject, object)` pairs joined by `predicate`.
    fn subject_objects(&self, predicate: &str) -> Vec<(&Term, &Term)>;
}

/// Ordered in-memory triple store
#[derive(Debug, Default, Clone)]
pub struct Graph {
    spo: BTreeMap<Term, BTreeMap<String, BTreeSet<Term>>>,
    by_type: BTreeMap<String, BTreeSet<Term>>,
    len: usize,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_triples(triples: impl IntoIterator<Item = Triple>) -> Self {
        let mut graph = Self::new();
        for triple in triples {
            graph.insert(triple);
        }
        graph
    }

    /// Add a triple. Returns `false` if it was already present.
    pub fn insert(&mut self, triple: Triple) -> bool {
        if triple.predicate == RDF_TYPE {
            if let Term::Iri(type_iri) = &triple.object {
                self.by_type
                    .entry(type_iri.clone())
                    .or_default()
                    .insert(triple.subject.clone());
            }
        }
        let inserted = self
            .spo
            .entry(triple.subject)
            .or_default()
            .entry(triple.predicate)
            .or_default()
            .insert(triple.object);
        if inserted {
            self.len += 1;
        }
        inserted
    }

    /// Number of distinct triples
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Parse Turtle text.
    pub fn parse_turtle(text: &str, base_iri: Option<&str>) -> Result<Self> {
        let mut parser = oxttl::TurtleParser::new();
        if let Some(base) = base_iri {
            parser = parser
                .with_base_iri(base)
                .map_err(|e| Error::Graph(format!("Invalid base IRI {}: {}", base, e)))?;
        }

        let mut graph = Self::new();
        let mut skipped = 0usize;
        for triple in parser.for_reader(text.as_bytes()) {
            let triple = triple.map_err(|e| Error::Graph(format!("Turtle parse error: {}", e)))?;
            match convert_triple(triple) {
                Some(t) => {
                    graph.insert(t);
                }
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            tracing::warn!("Ignored {} quoted-triple statements", skipped);
        }
        Ok(graph)
    }

    /// Load and parse a Turtle file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let graph = Self::parse_turtle(&text, None)?;
        tracing::info!("Loaded {} triples from {}", graph.len(), path.display());
        Ok(graph)
    }
}

impl GraphQuery for Graph {
    fn subjects_of_type(&self, type_iri: &str) -> Vec<&Term> {
        self.by_type
            .get(type_iri)
            .map(|subjects| subjects.iter().collect())
            .unwrap_or_default()
    }

    fn objects(&self, subject: &Term, predicate: &str) -> Vec<&Term> {
        self.spo
            .get(subject)
            .and_then(|preds| preds.get(predicate))
            .map(|objects| objects.iter().collect())
            .unwrap_or_default()
    }

    fn subject_objects(&self, predicate: &str) -> Vec<(&Term, &Term)> {
        let mut pairs = Vec::new();
        for (subject, preds) in &self.spo {
            if let Some(objects) = preds.get(predicate) {
                for object in objects {
                    pairs.push((subject, object));
                }
            }
        }
        pairs
    }
}

fn convert_triple(triple: oxrdf::Triple) -> Option<Triple> {
    let subject = match triple.subject {
        oxrdf::Subject::NamedNode(node) => Term::Iri(node.into_string()),
        oxrdf::Subject::BlankNode(node) => Term::Blank(node.into_string()),
        #[allow(unreachable_patterns)]
        _ => return None,
    };
    let object = match triple.object {
        oxrdf::Term::NamedNode(node) => Term::Iri(node.into_string()),
        oxrdf::Term::BlankNode(node) => Term::Blank(node.into_string()),
        oxrdf::Term::Literal(literal) => {
            let datatype = literal.datatype().as_str();
            let datatype = if datatype == XSD_STRING || datatype == RDF_LANG_STRING {
                None
            } else {
                Some(datatype.to_string())
            };
            Term::Literal {
                value: literal.value().to_string(),
                datatype,
                language: literal.language().map(str::to_string),
            }
        }
        #[allow(unreachable_patterns)]
        _ => return None,
    };
    Some(Triple::new(subject, triple.predicate.into_string(), object))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_TTL: &str = r#"
@prefix ex: <http://example.org/> .
@prefix rdf: <http://www.w3.org/1999/02/22-rdf-syntax-ns#> .
@prefix xsd: <http://www.w3.org/2001/XMLSchema#> .

ex:s1 a ex:Subject ;
    ex:name "first" ;
    ex:age [ rdf:value "12" ; ex:unit ex:weeks ] ;
    ex:count "3"^^xsd:integer .

ex:s2 a ex:Subject, ex:Other ;
    ex:name "second"@en .
"#;

    #[test]
    fn test_parse_turtle() {
        let graph = Graph::parse_turtle(SAMPLE_TTL, None).unwrap();
        assert_eq!(graph.len(), 10);

        let subjects = graph.subjects_of_type("http://example.org/Subject");
        assert_eq!(subjects.len(), 2);
        assert_eq!(subjects[0], &Term::iri("http://example.org/s1"));
        assert_eq!(
            graph.subjects_of_type("http://example.org/Other"),
            vec![&Term::iri("http://example.org/s2")]
        );
    }

    #[test]
    fn test_parse_literals() {
        let graph = Graph::parse_turtle(SAMPLE_TTL, None).unwrap();
        let s1 = Term::iri("http://example.org/s1");

        let names = graph.objects(&s1, "http://example.org/name");
        assert_eq!(names, vec![&Term::literal("first")]);

        let counts = graph.objects(&s1, "http://example.org/count");
        assert_eq!(
            counts,
            vec![&Term::Literal {
                value: "3".to_string(),
                datatype: Some("http://www.w3.org/2001/XMLSchema#integer".to_string()),
                language: None,
            }]
        );

        let s2 = Term::iri("http://example.org/s2");
        let names = graph.objects(&s2, "http://example.org/name");
        assert_eq!(names.len(), 1);
        assert_eq!(names[0].text(), "second");
    }

    #[test]
    fn test_parse_blank_node() {
        let graph = Graph::parse_turtle(SAMPLE_TTL, None).unwrap();
        let s1 = Term::iri("http://example.org/s1");
        let ages = graph.objects(&s1, "http://example.org/age");
        assert_eq!(ages.len(), 1);
        assert!(ages[0].is_blank());

        let values = graph.objects(ages[0], RDF_VALUE);
        assert_eq!(values, vec![&Term::literal("12")]);
    }

    #[test]
    fn test_parse_error() {
        let result = Graph::parse_turtle("ex:s1 ex:p", None);
        assert!(matches!(result, Err(Error::Graph(_))));
    }

    #[test]
    fn test_insert_deduplicates() {
        let mut graph = Graph::new();
        let t = Triple::new(Term::iri("s"), "p", Term::literal("o"));
        assert!(graph.insert(t.clone()));
        assert!(!graph.insert(t));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_subject_objects_ordered() {
        let graph = Graph::from_triples(vec![
            Triple::new(Term::iri("b"), "p", Term::iri("x")),
            Triple::new(Term::iri("a"), "p", Term::iri("y")),
            Triple::new(Term::iri("a"), "q", Term::iri("z")),
        ]);
        let pairs = graph.subject_objects("p");
        assert_eq!(
            pairs,
            vec![
                (&Term::iri("a"), &Term::iri("y")),
                (&Term::iri("b"), &Term::iri("x")),
            ]
        );
    }

    #[test]
    fn test_load_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("graph.ttl");
        fs::write(&path, SAMPLE_TTL).unwrap();
        let graph = Graph::load(&path).unwrap();
        assert_eq!(graph.len(), 10);
    }
}
