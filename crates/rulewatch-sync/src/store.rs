//! Document store contract and an in-process implementation.
//!
//! Documents are flat JSON objects keyed by id within a named index. Upserts
//! merge shallowly: every top-level key in the new document replaces the
//! stored key, and stored keys absent from the new document are kept.

use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::cmp::Ordering;

/// A stored document.
pub type Document = serde_json::Map<String, Value>;

/// One predicate of a conjunctive search filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Field equals the value exactly.
    Term {
        /// Document field name.
        field: String,
        /// Required value.
        value: Value,
    },
    /// Field lies within the inclusive bounds. Missing bounds are open.
    Range {
        /// Document field name.
        field: String,
        /// Inclusive lower bound.
        gte: Option<Value>,
        /// Inclusive upper bound.
        lte: Option<Value>,
    },
}

impl Predicate {
    /// Field the predicate applies to.
    pub fn field(&self) -> &str {
        match self {
            Predicate::Term { field, .. } | Predicate::Range { field, .. } => field,
        }
    }

    /// Evaluate against a document. Documents missing the field never match.
    pub fn matches(&self, doc: &Document) -> bool {
        let Some(actual) = doc.get(self.field()) else {
            return false;
        };
        match self {
            Predicate::Term { value, .. } => compare_values(actual, value) == Some(Ordering::Equal),
            Predicate::Range { gte, lte, .. } => {
                let above = gte.as_ref().map_or(true, |bound| {
                    matches!(
                        compare_values(actual, bound),
                        Some(Ordering::Greater | Ordering::Equal)
                    )
                });
                let below = lte.as_ref().map_or(true, |bound| {
                    matches!(
                        compare_values(actual, bound),
                        Some(Ordering::Less | Ordering::Equal)
                    )
                });
                above && below
            }
        }
    }
}

/// Numbers compare numerically, strings lexically; anything else only by equality.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (x, y) if x == y => Some(Ordering::Equal),
        _ => None,
    }
}

/// A conjunction of predicates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    predicates: Vec<Predicate>,
}

impl Filter {
    /// An empty filter, matching every document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a term-equality predicate.
    pub fn term(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.predicates.push(Predicate::Term {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    /// Add an inclusive range predicate.
    pub fn range(
        mut self,
        field: impl Into<String>,
        gte: Option<Value>,
        lte: Option<Value>,
    ) -> Self {
        self.predicates.push(Predicate::Range {
            field: field.into(),
            gte,
            lte,
        });
        self
    }

    /// The predicates, in insertion order.
    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// True when every predicate matches.
    pub fn matches(&self, doc: &Document) -> bool {
        self.predicates.iter().all(|p| p.matches(doc))
    }
}

/// Durable, searchable storage for rule records.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Fetch a document by id. Fails with [`StoreError::NotFound`] when absent.
    async fn get(&self, index: &str, id: &str) -> StoreResult<Document>;

    /// Create the document, or shallow-merge it into the existing one.
    async fn upsert(&self, index: &str, id: &str, doc: Document) -> StoreResult<()>;

    /// Up to `max_rows` documents matching the filter, in no particular order.
    async fn search(&self, index: &str, filter: &Filter, max_rows: usize)
        -> StoreResult<Vec<Document>>;

    /// Number of matching documents, capped at `max_rows`.
    async fn count(&self, index: &str, filter: &Filter, max_rows: usize) -> StoreResult<usize> {
        Ok(self.search(index, filter, max_rows).await?.len())
    }
}

/// Record store held in process memory.
///
/// Used by tests and by dry runs; each document update is atomic per key.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    docs: DashMap<(String, String), Document>,
}

impl MemoryRecordStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in an index.
    pub fn len(&self, index: &str) -> usize {
        self.docs.iter().filter(|e| e.key().0 == index).count()
    }

    /// True when the index holds no documents.
    pub fn is_empty(&self, index: &str) -> bool {
        self.len(index) == 0
    }

    /// All documents in an index, sorted by id.
    pub fn documents(&self, index: &str) -> Vec<(String, Document)> {
        let mut docs: Vec<_> = self
            .docs
            .iter()
            .filter(|e| e.key().0 == index)
            .map(|e| (e.key().1.clone(), e.value().clone()))
            .collect();
        docs.sort_by(|a, b| a.0.cmp(&b.0));
        docs
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, index: &str, id: &str) -> StoreResult<Document> {
        self.docs
            .get(&(index.to_string(), id.to_string()))
            .map(|doc| doc.value().clone())
            .ok_or_else(|| StoreError::NotFound {
                index: index.to_string(),
                id: id.to_string(),
            })
    }

    async fn upsert(&self, index: &str, id: &str, doc: Document) -> StoreResult<()> {
        let mut entry = self
            .docs
            .entry((index.to_string(), id.to_string()))
            .or_default();
        for (key, value) in doc {
            entry.insert(key, value);
        }
        Ok(())
    }

    async fn search(
        &self,
        index: &str,
        filter: &Filter,
        max_rows: usize,
    ) -> StoreResult<Vec<Document>> {
        Ok(self
            .documents(index)
            .into_iter()
            .map(|(_, doc)| doc)
            .filter(|doc| filter.matches(doc))
            .take(max_rows)
            .collect())
    }
}
