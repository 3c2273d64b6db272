use crate::config::VaultConfig;
use crate::errors::DetokenizeError;
use crate::submitter::{BatchKey, CallKeyGetter, CallValueGetter, DetokenizeSubmitter};
use crate::vault::{DetokenizeRecord, flow_config};
use batchflow::batch::Batcher;
use batchflow::bearer::{BearerError, BearerSupplier};
use batchflow::flow::validate_vault_url;
use batchflow::retry::ExponentialBackoff;
use batchflow::sender::HttpSender;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use url::Url;

/// Resolves the tokens of a BigQuery remote function call against the vault.
pub struct Detokenizer {
    sender: Arc<dyn HttpSender>,
    bearer: Arc<dyn BearerSupplier>,
    vault_url: Url,
    timeout: Duration,
    max_batch_size: usize,
    backoff: ExponentialBackoff,
    // Whether the last attempt to obtain a bearer succeeded
    has_bearer: AtomicBool,
}

impl Detokenizer {
    pub fn new(
        sender: Arc<dyn HttpSender>,
        bearer: Arc<dyn BearerSupplier>,
        vault: &VaultConfig,
        backoff: ExponentialBackoff,
    ) -> Result<Self, DetokenizeError> {
        validate_vault_url(&vault.url)?;
        Ok(Detokenizer {
            sender,
            bearer,
            vault_url: vault.url.clone(),
            timeout: vault.api_timeout(),
            max_batch_size: vault.max_batch_size,
            backoff,
            has_bearer: AtomicBool::new(false),
        })
    }

    /// Ready once a bearer for the vault API could be obtained, and for as long
    /// as later attempts keep succeeding.
    pub fn is_ready(&self) -> bool {
        self.has_bearer.load(Ordering::Relaxed)
    }

    /// Obtains a bearer up front so readiness reflects the vault credentials
    /// before the first request arrives.
    pub async fn check_bearer(&self) -> bool {
        match self.bearer().await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Could not obtain vault bearer token");
                false
            }
        }
    }

    async fn bearer(&self) -> Result<String, BearerError> {
        let result = self.bearer.bearer().await;
        self.has_bearer.store(result.is_ok(), Ordering::Relaxed);
        result
    }

    /// Returns one record per call, in call order.
    ///
    /// Per-token failures are reported inside the records. An `Err` means the
    /// request as a whole could not be processed.
    pub async fn detokenize(
        &self,
        calls: &[Vec<Value>],
    ) -> Result<Vec<DetokenizeRecord>, DetokenizeError> {
        let bearer = self.bearer().await?;
        let submitter = DetokenizeSubmitter::new(
            calls.len(),
            self.sender.clone(),
            flow_config(&self.vault_url, &bearer, self.timeout)?,
            self.backoff.clone(),
        );

        let mut batcher = Batcher::new(
            submitter,
            CallKeyGetter,
            CallValueGetter,
            self.max_batch_size,
        )?;
        batcher
            .partition::<Vec<Value>, BatchKey, Option<String>>(calls)
            .await?;

        Ok(batcher.into_submitter().into_replies())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BearerSource;
    use crate::testutils::FakeVault;
    use batchflow::bearer::StaticBearer;
    use serde_json::json;

    fn detokenizer(vault: Arc<FakeVault>, max_batch_size: usize, bearer: &str) -> Detokenizer {
        let config = VaultConfig {
            url: FakeVault::url(),
            max_batch_size,
            api_timeout_secs: 5,
            bearer: BearerSource::Static {
                token: bearer.into(),
            },
        };
        Detokenizer::new(
            vault,
            Arc::new(StaticBearer::new(bearer)),
            &config,
            FakeVault::backoff(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_detokenize_groups_by_vault_and_keeps_order() {
        let vault = FakeVault::new();
        let calls = vec![
            vec![json!("v1"), json!("a")],
            vec![json!("v2"), json!("b")],
            vec![json!("v1"), json!(null)],
            vec![json!("v1"), json!("c")],
            vec![json!("v2"), json!("missing")],
        ];

        let replies = detokenizer(vault.clone(), 1000, "secret")
            .detokenize(&calls)
            .await
            .unwrap();

        assert_eq!(replies.len(), 5);
        assert_eq!(replies[0].value, Some(json!("v1:a")));
        assert_eq!(replies[1].value, Some(json!("v2:b")));
        assert_eq!(replies[2], DetokenizeRecord::default());
        assert_eq!(replies[3].value, Some(json!("v1:c")));
        assert_eq!(replies[4].http_code, Some(404));
        assert_eq!(replies[4].error.as_deref(), Some("Token not found"));

        let mut vaults = vault.requested_vaults();
        vaults.sort();
        assert_eq!(vaults, vec!["v1", "v2"]);
    }

    #[tokio::test]
    async fn test_detokenize_respects_max_batch_size() {
        let vault = FakeVault::new();
        let calls: Vec<Vec<Value>> = (0..7)
            .map(|i| vec![json!("v1"), json!(format!("t{i}"))])
            .collect();

        let replies = detokenizer(vault.clone(), 3, "secret")
            .detokenize(&calls)
            .await
            .unwrap();

        assert_eq!(
            vault.requested_tokens(),
            vec![
                vec!["t0", "t1", "t2"],
                vec!["t3", "t4", "t5"],
                vec!["t6"],
            ]
        );
        for (i, reply) in replies.iter().enumerate() {
            assert_eq!(reply.value, Some(json!(format!("v1:t{i}"))));
        }
    }

    #[tokio::test]
    async fn test_detokenize_batch_rejected_by_vault() {
        let vault = FakeVault::new();
        let calls = vec![
            vec![json!("forbidden"), json!("a")],
            vec![json!("forbidden"), json!("b")],
        ];

        let replies = detokenizer(vault.clone(), 1000, "secret")
            .detokenize(&calls)
            .await
            .unwrap();

        // Non-retryable status: a single request, every token carries the error
        assert_eq!(vault.requested_tokens().len(), 1);
        for reply in &replies {
            assert_eq!(reply.http_code, Some(403));
            assert_eq!(reply.error.as_deref(), Some("Vault access denied"));
        }
    }

    #[tokio::test]
    async fn test_detokenize_invalid_call() {
        let vault = FakeVault::new();
        let calls = vec![vec![json!("v1"), json!("a")], vec![json!("v1")]];

        let err = detokenizer(vault.clone(), 1000, "secret")
            .detokenize(&calls)
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "error getting batch key: exactly 2 arguments are expected"
        );
        assert!(vault.requested_tokens().is_empty());
    }

    #[tokio::test]
    async fn test_detokenize_bearer_failure() {
        let vault = FakeVault::new();
        let calls = vec![vec![json!("v1"), json!("a")]];

        let err = detokenizer(vault.clone(), 1000, "")
            .detokenize(&calls)
            .await
            .unwrap_err();

        assert!(matches!(err, DetokenizeError::Bearer(_)));
        assert!(vault.requested_tokens().is_empty());
    }

    #[tokio::test]
    async fn test_readiness_follows_bearer() {
        let vault = FakeVault::new();

        let authenticated = detokenizer(vault.clone(), 1000, "secret");
        assert!(!authenticated.is_ready());
        assert!(authenticated.check_bearer().await);
        assert!(authenticated.is_ready());

        let unauthenticated = detokenizer(vault.clone(), 1000, "");
        assert!(!unauthenticated.check_bearer().await);
        assert!(!unauthenticated.is_ready());
        let calls = vec![vec![json!("v1"), json!("a")]];
        assert!(unauthenticated.detokenize(&calls).await.is_err());
        assert!(!unauthenticated.is_ready());
    }

    #[test]
    fn test_rejects_insecure_vault_url() {
        let config = VaultConfig {
            url: Url::parse("http://vault.example.com").unwrap(),
            max_batch_size: 10,
            api_timeout_secs: 5,
            bearer: BearerSource::Static {
                token: "secret".into(),
            },
        };
        let result = Detokenizer::new(
            FakeVault::new(),
            Arc::new(StaticBearer::new("secret")),
            &config,
            FakeVault::backoff(),
        );
        assert!(matches!(result, Err(DetokenizeError::Flow(_))));
    }
}
