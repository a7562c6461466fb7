//! HTTP client for the SMQ-to-SQL conversion endpoint.
//!
//! Thin wrapper over `POST /api/smq/convert`; the compiler behind the
//! endpoint is an external collaborator and only its request/response
//! contract is modeled here.

use anyhow::{Context, Result};

use semaq_protocol::{ConvertRequest, ConvertResponse, SmqQuery};

/// Default REST base of the console backend.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Client for the SMQ conversion endpoint.
#[derive(Debug, Clone)]
pub struct SmqConvertClient {
    http: reqwest::Client,
    base_url: String,
}

impl SmqConvertClient {
    /// Create a client against the given REST base URL (no trailing slash
    /// required).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Convert one SMQ into SQL for the given dialect.
    ///
    /// A `success: false` response is not an `Err`: the backend reporting a
    /// conversion failure is a normal outcome the caller surfaces to the
    /// user (see [`ConvertResponse::sql_or_error`]).
    pub async fn convert(&self, smq: &SmqQuery, dialect: &str) -> Result<ConvertResponse> {
        let request =
            ConvertRequest::from_query(smq, dialect).context("encoding SMQ for conversion")?;
        self.convert_raw(&request).await
    }

    /// Convert an already JSON-encoded SMQ string.
    pub async fn convert_raw(&self, request: &ConvertRequest) -> Result<ConvertResponse> {
        let url = format!("{}/api/smq/convert", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .with_context(|| format!("posting to {url}"))?
            .error_for_status()
            .context("conversion endpoint returned an error status")?;

        response
            .json::<ConvertResponse>()
            .await
            .context("parsing conversion response")
    }
}
