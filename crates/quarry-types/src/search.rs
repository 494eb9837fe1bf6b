//! Document and search request/response types.
//!
//! Document sources travel as raw JSON strings so that every type here can
//! be carried by non-self-describing formats on the transport.

use serde::{Deserialize, Serialize};

/// A search query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Query {
    /// Matches every document.
    #[default]
    MatchAll,
    /// Exact match of a field's scalar value against `value`.
    Term { field: String, value: String },
    /// Lucene-like query string: `*`, `*:*`, `field:value` or a bare value.
    QueryString(String),
}

impl Query {
    pub fn match_all() -> Self {
        Self::MatchAll
    }

    pub fn term(field: impl Into<String>, value: impl ToString) -> Self {
        Self::Term {
            field: field.into(),
            value: value.to_string(),
        }
    }

    pub fn query_string(q: impl Into<String>) -> Self {
        Self::QueryString(q.into())
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Sort specification for a search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub field: String,
    pub order: SortOrder,
}

impl Sort {
    /// Ascending sort on `field`.
    pub fn field(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Asc,
        }
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }
}

/// One returned document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub index: String,
    pub doc_type: String,
    pub id: String,
    /// Raw JSON source.
    pub source: String,
}

impl SearchHit {
    pub fn source_value(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.source)
    }
}

/// Result page of a search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub took_ms: u64,
    pub timed_out: bool,
    /// Number of matching documents, independent of the page window.
    pub total_hits: u64,
    pub hits: Vec<SearchHit>,
}

/// Outcome of indexing one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexResponse {
    pub index: String,
    pub doc_type: String,
    pub id: String,
    pub version: u64,
    /// `true` when the document did not exist before.
    pub created: bool,
}

/// Outcome of deleting one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub index: String,
    pub doc_type: String,
    pub id: String,
    pub version: u64,
    pub found: bool,
}

/// Outcome of a realtime get.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetResponse {
    pub index: String,
    pub doc_type: String,
    pub id: String,
    pub version: u64,
    pub found: bool,
    pub source: Option<String>,
}

/// A paged search over one index (or all indices when `index` is `None`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub index: Option<String>,
    pub doc_type: Option<String>,
    pub query: Query,
    pub sort: Option<Sort>,
    pub from: usize,
    pub size: usize,
}

impl SearchRequest {
    /// Match-all search over `index`, first ten hits.
    pub fn new(index: impl Into<String>) -> Self {
        Self {
            index: Some(index.into()),
            ..Self::default()
        }
    }

    pub fn all_indices() -> Self {
        Self::default()
    }

    pub fn doc_type(mut self, doc_type: impl Into<String>) -> Self {
        self.doc_type = Some(doc_type.into());
        self
    }

    pub fn query(mut self, query: Query) -> Self {
        self.query = query;
        self
    }

    pub fn sort(mut self, sort: Sort) -> Self {
        self.sort = Some(sort);
        self
    }

    /// Sets the page window.
    pub fn page(mut self, from: usize, size: usize) -> Self {
        self.from = from;
        self.size = size;
        self
    }
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            index: None,
            doc_type: None,
            query: Query::MatchAll,
            sort: None,
            from: 0,
            size: 10,
        }
    }
}
