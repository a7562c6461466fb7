//! DTOs for the SMQ-to-SQL conversion endpoint.
//!
//! `POST /api/smq/convert` is an external collaborator: the request carries a
//! JSON-encoded SMQ string and a dialect, the response is success-flagged
//! with either SQL or an error string. The compiler behind it is out of
//! scope here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::smq::SmqQuery;

/// Request body for `POST /api/smq/convert`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertRequest {
    /// JSON-encoded SMQ. The endpoint expects a string, not a nested object.
    pub smq: String,
    /// Target SQL dialect (e.g. `"bigquery"`, `"oracle"`).
    pub dialect: String,
}

impl ConvertRequest {
    /// Encode an [`SmqQuery`] for the wire.
    pub fn from_query(smq: &SmqQuery, dialect: impl Into<String>) -> serde_json::Result<Self> {
        Ok(Self {
            smq: serde_json::to_string(smq)?,
            dialect: dialect.into(),
        })
    }
}

/// Response body of `POST /api/smq/convert`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertResponse {
    pub success: bool,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub all_queries: Option<Vec<Value>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ConvertResponse {
    /// The generated SQL, or the backend's error string when conversion
    /// failed.
    pub fn sql_or_error(&self) -> Result<&str, &str> {
        if self.success {
            Ok(self.sql.as_deref().unwrap_or_default())
        } else {
            Err(self.error.as_deref().unwrap_or("SMQ conversion failed"))
        }
    }
}
