//! Vault detokenize API surface for [`BatchFlow`].

use batchflow::flow::{BatchFlow, FlowConfig, FlowError, FlowHandler};
use batchflow::status::is_server_error;
use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use url::Url;

pub const DETOKENIZE_ROUTE: &str = "/v2/tokens/detokenize";

/// Result of detokenizing one token, as returned by the vault and as replied
/// to BigQuery.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetokenizeRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_group_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_code: Option<u16>,
    /// Extra details such as the table name or record id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
struct BatchBody {
    response: Vec<DetokenizeRecord>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<ErrorObject>,
}

#[derive(Deserialize)]
struct ErrorObject {
    message: Option<String>,
}

pub struct DetokenizeHandler {
    vault_id: String,
}

impl DetokenizeHandler {
    pub fn new(vault_id: impl Into<String>) -> Self {
        DetokenizeHandler {
            vault_id: vault_id.into(),
        }
    }
}

impl FlowHandler for DetokenizeHandler {
    type Input = String;
    type Output = DetokenizeRecord;

    fn build_payload(&self, tokens: &[&String]) -> Result<Value, serde_json::Error> {
        Ok(serde_json::json!({
            "vaultID": self.vault_id,
            "tokens": tokens,
        }))
    }

    fn decode_batch(
        &self,
        _expected: usize,
        body: &[u8],
    ) -> Result<Vec<DetokenizeRecord>, serde_json::Error> {
        let decoded: BatchBody = serde_json::from_slice(body)?;
        Ok(decoded.response)
    }

    fn decode_error(&self, body: &[u8]) -> Option<String> {
        serde_json::from_slice::<ErrorBody>(body)
            .ok()
            .and_then(|b| b.error)
            .and_then(|e| e.message)
            .filter(|m| !m.is_empty())
    }

    fn should_retry(&self, record: &DetokenizeRecord) -> bool {
        matches!(record.http_code, Some(code) if is_server_error(code) || code == 429)
    }

    fn set_error(&self, record: &mut DetokenizeRecord, error: &FlowError, status: StatusCode) {
        record.error = Some(error.to_string());
        record.http_code = Some(status.as_u16());
    }
}

pub type DetokenizeFlow = BatchFlow<DetokenizeHandler>;

/// Settings for a `POST` to the detokenize route of `vault_url`.
pub fn flow_config(
    vault_url: &Url,
    bearer: &str,
    timeout: Duration,
) -> Result<FlowConfig, FlowError> {
    FlowConfig::new(Method::POST, vault_url, DETOKENIZE_ROUTE, bearer, timeout)
}
