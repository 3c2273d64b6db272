//! Adapts BigQuery call rows to vault detokenize batches.

use crate::errors::DetokenizeError;
use crate::vault::{DetokenizeFlow, DetokenizeHandler, DetokenizeRecord};
use async_trait::async_trait;
use batchflow::BoxError;
use batchflow::batch::{Batch, BatchKeyGetter, BatchSubmitter, BatchValueGetter};
use batchflow::flow::FlowConfig;
use batchflow::retry::{ExponentialBackoff, send_request};
use batchflow::sender::HttpSender;
use serde_json::Value;
use std::sync::Arc;

const CALL_ARGUMENTS: usize = 2;

/// Tokens are batched per vault.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub vault_id: String,
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum CallError {
    #[error("exactly {CALL_ARGUMENTS} arguments are expected")]
    ArgumentCount,
    #[error("vaultId argument must be a string")]
    VaultId,
    #[error("token argument must be a string")]
    Token,
}

fn check_arguments(call: &[Value]) -> Result<(), CallError> {
    if call.len() != CALL_ARGUMENTS {
        return Err(CallError::ArgumentCount);
    }
    Ok(())
}

/// Reads the vault id from the first argument of a call.
pub struct CallKeyGetter;

impl BatchKeyGetter<Vec<Value>, BatchKey> for CallKeyGetter {
    fn batch_key(&self, call: &Vec<Value>) -> Result<BatchKey, BoxError> {
        check_arguments(call)?;
        match &call[0] {
            Value::String(vault_id) => Ok(BatchKey {
                vault_id: vault_id.clone(),
            }),
            _ => Err(CallError::VaultId.into()),
        }
    }
}

/// Reads the token from the second argument of a call. SQL `NULL` tokens are
/// passed through as `None`.
pub struct CallValueGetter;

impl BatchValueGetter<Vec<Value>, Option<String>> for CallValueGetter {
    fn batch_value(&self, call: &Vec<Value>) -> Result<Option<String>, BoxError> {
        check_arguments(call)?;
        match &call[1] {
            Value::Null => Ok(None),
            Value::String(token) => Ok(Some(token.clone())),
            _ => Err(CallError::Token.into()),
        }
    }
}

/// Detokenizes each submitted batch and writes the records into `replies` at
/// the positions of the originating calls.
pub struct DetokenizeSubmitter {
    replies: Vec<DetokenizeRecord>,
    sender: Arc<dyn HttpSender>,
    config: FlowConfig,
    backoff: ExponentialBackoff,
}

impl DetokenizeSubmitter {
    pub fn new(
        calls: usize,
        sender: Arc<dyn HttpSender>,
        config: FlowConfig,
        backoff: ExponentialBackoff,
    ) -> Self {
        DetokenizeSubmitter {
            replies: vec![DetokenizeRecord::default(); calls],
            sender,
            config,
            backoff,
        }
    }

    pub fn replies(&self) -> &[DetokenizeRecord] {
        &self.replies
    }

    pub fn into_replies(self) -> Vec<DetokenizeRecord> {
        self.replies
    }

    fn set_reply(&mut self, index: usize, record: DetokenizeRecord) -> Result<(), DetokenizeError> {
        let len = self.replies.len();
        let reply = self
            .replies
            .get_mut(index)
            .ok_or(DetokenizeError::IndexOutOfRange { index, len })?;
        *reply = record;
        Ok(())
    }
}

#[async_trait]
impl BatchSubmitter<BatchKey, Option<String>> for DetokenizeSubmitter {
    async fn submit(&mut self, key: &BatchKey, batch: &Batch<Option<String>>) -> Result<(), BoxError> {
        let mut indices = Vec::with_capacity(batch.len());
        let mut tokens = Vec::with_capacity(batch.len());
        for (index, token) in batch.iter() {
            match token {
                Some(token) => {
                    indices.push(index);
                    tokens.push(token.clone());
                }
                None => self.set_reply(index, DetokenizeRecord::default())?,
            }
        }

        if tokens.is_empty() {
            return Ok(());
        }

        tracing::debug!(
            vault_id = %key.vault_id,
            tokens = tokens.len(),
            "Submitting detokenize batch"
        );
        let mut flow = DetokenizeFlow::new(
            self.sender.clone(),
            self.config.clone(),
            DetokenizeHandler::new(key.vault_id.as_str()),
            tokens,
        );
        send_request(&mut flow, &self.backoff).await?;

        for (index, record) in indices.into_iter().zip(flow.into_results()) {
            self.set_reply(index, record)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::FakeVault;
    use crate::vault::flow_config;
    use serde_json::json;
    use std::time::Duration;

    fn call(vault: Value, token: Value) -> Vec<Value> {
        vec![vault, token]
    }

    fn submitter(calls: usize, vault: Arc<FakeVault>) -> DetokenizeSubmitter {
        DetokenizeSubmitter::new(
            calls,
            vault,
            flow_config(&FakeVault::url(), "secret", Duration::from_secs(5)).unwrap(),
            FakeVault::backoff(),
        )
    }

    #[test]
    fn test_key_getter() {
        assert_eq!(
            CallKeyGetter
                .batch_key(&call(json!("v1"), json!("tok")))
                .unwrap(),
            BatchKey {
                vault_id: "v1".into()
            }
        );

        let err = CallKeyGetter.batch_key(&vec![json!("v1")]).unwrap_err();
        assert_eq!(err.to_string(), "exactly 2 arguments are expected");

        let err = CallKeyGetter
            .batch_key(&call(json!(42), json!("tok")))
            .unwrap_err();
        assert_eq!(err.to_string(), "vaultId argument must be a string");
    }

    #[test]
    fn test_value_getter() {
        assert_eq!(
            CallValueGetter
                .batch_value(&call(json!("v1"), json!("tok")))
                .unwrap(),
            Some("tok".to_string())
        );
        assert_eq!(
            CallValueGetter
                .batch_value(&call(json!("v1"), Value::Null))
                .unwrap(),
            None
        );

        let err = CallValueGetter
            .batch_value(&call(json!("v1"), json!(["tok"])))
            .unwrap_err();
        assert_eq!(err.to_string(), "token argument must be a string");

        let err = CallValueGetter
            .batch_value(&vec![json!("v1"), json!("a"), json!("b")])
            .unwrap_err();
        assert_eq!(err.to_string(), "exactly 2 arguments are expected");
    }

    #[tokio::test]
    async fn test_submit_scatters_by_original_index() {
        let vault = FakeVault::new();
        let mut submitter = submitter(6, vault.clone());
        let batch = Batch::from_parts(
            Vec::from([5, 1, 3]),
            Vec::from([Some("a".to_string()), None, Some("missing".to_string())]),
        )
        .unwrap();

        submitter
            .submit(&BatchKey { vault_id: "v1".into() }, &batch)
            .await
            .unwrap();

        let replies = submitter.replies();
        assert_eq!(replies[5].value, Some(json!("v1:a")));
        assert_eq!(replies[5].http_code, Some(200));
        assert_eq!(replies[1], DetokenizeRecord::default());
        assert_eq!(replies[3].http_code, Some(404));
        assert_eq!(replies[0], DetokenizeRecord::default());
        assert_eq!(vault.requested_tokens(), vec![vec!["a", "missing"]]);
    }

    #[tokio::test]
    async fn test_submit_only_null_tokens_sends_nothing() {
        let vault = FakeVault::new();
        let mut submitter = submitter(2, vault.clone());
        let batch = Batch::from_parts(Vec::from([0, 1]), Vec::from([None, None])).unwrap();

        submitter
            .submit(&BatchKey { vault_id: "v1".into() }, &batch)
            .await
            .unwrap();

        assert!(vault.requested_tokens().is_empty());
        assert!(
            submitter
                .replies()
                .iter()
                .all(|r| *r == DetokenizeRecord::default())
        );
    }

    #[tokio::test]
    async fn test_submit_retries_transient_failures() {
        let vault = FakeVault::new();
        let mut submitter = submitter(3, vault.clone());
        let batch = Batch::from_parts(
            Vec::from([0, 1, 2]),
            Vec::from([
                Some("a".to_string()),
                Some("flaky".to_string()),
                Some("b".to_string()),
            ]),
        )
        .unwrap();

        submitter
            .submit(&BatchKey { vault_id: "v1".into() }, &batch)
            .await
            .unwrap();

        assert_eq!(
            vault.requested_tokens(),
            vec![vec!["a", "flaky", "b"], vec!["flaky"]]
        );
        assert!(submitter.replies().iter().all(|r| r.http_code == Some(200)));
        assert_eq!(submitter.replies()[1].value, Some(json!("v1:flaky")));
    }

    #[tokio::test]
    async fn test_submit_index_out_of_range() {
        let vault = FakeVault::new();
        let mut submitter = submitter(1, vault);
        let batch = Batch::from_parts(Vec::from([4]), Vec::from([Some("a".to_string())])).unwrap();

        let err = submitter
            .submit(&BatchKey { vault_id: "v1".into() }, &batch)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "batch indices must match output size: found index 4, output size 1"
        );
    }
}
