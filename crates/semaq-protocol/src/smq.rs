//! The SMQ (Semantic Model Query) data model.
//!
//! An SMQ describes a query against the semantic layer; the backend compiles
//! it into dialect-specific SQL. The client only constructs and transports
//! these values, it never interprets them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A query against the semantic model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SmqQuery {
    /// Metric identifiers, `entity.measure` form.
    pub metrics: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<Vec<String>>,

    /// Filter expressions, passed through verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Explicit join hints; shape is owned by the compiler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joins: Option<Vec<Value>>,
}

impl SmqQuery {
    pub fn new(metrics: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            metrics: metrics.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

/// Tabular sample data produced by the query-execution stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResultSet {
    #[serde(default)]
    pub columns: Vec<String>,
    /// One JSON object per row, keyed by column name.
    #[serde(default)]
    pub rows: Vec<Map<String, Value>>,
}

impl QueryResultSet {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
