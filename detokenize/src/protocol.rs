//! BigQuery remote function wire format.
//!
//! See <https://cloud.google.com/bigquery/docs/remote-functions#input_format>
//! and <https://cloud.google.com/bigquery/docs/remote-functions#output_format>.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum BindError {
    #[error(
        "invalid request format: request body does not match expected format: see https://cloud.google.com/bigquery/docs/remote-functions#input_format"
    )]
    Format,
    #[error("invalid request format: missing requestId")]
    MissingRequestId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRequest {
    #[serde(default)]
    calls: Option<Vec<Vec<Value>>>,
    #[serde(default)]
    request_id: Option<String>,
}

/// One remote function invocation. Each call is the argument list of one row.
#[derive(Debug, PartialEq)]
pub struct BigQueryRequest {
    pub calls: Vec<Vec<Value>>,
    /// Stable across BigQuery's retries of the same request.
    pub request_id: String,
}

impl BigQueryRequest {
    pub fn bind(body: &[u8]) -> Result<Self, BindError> {
        let raw: RawRequest = serde_json::from_slice(body).map_err(|_| BindError::Format)?;
        let request_id = raw.request_id.ok_or(BindError::MissingRequestId)?;
        Ok(BigQueryRequest {
            calls: raw.calls.unwrap_or_default(),
            request_id,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct BigQueryResponse<T> {
    pub replies: Vec<T>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BigQueryError {
    pub error_message: String,
}

impl BigQueryError {
    pub fn proxy(message: impl std::fmt::Display) -> Self {
        BigQueryError {
            error_message: format!("error encountered in proxy: {message}"),
        }
    }
}
