//! Batch request flow against a vault API that can fail items individually.
//!
//! A [`BatchFlow`] keeps its inputs as a stable arena and tracks the positions
//! that still need a result in `remaining`. Every [`BatchFlow::send`] only
//! requests those positions and narrows `remaining` to the items the handler
//! considers retryable, so repeated sends converge on the transient failures.
//!
//! Response handling by status family:
//!
//! | status        | body            | outcome                                            |
//! |---------------|-----------------|----------------------------------------------------|
//! | 2xx           | batch           | unpack; undecodable or short batch is fatal         |
//! | 5xx           | batch           | unpack; undecodable keeps all items for retry       |
//! | 429           | error object    | all items keep the error and stay for retry         |
//! | anything else | error object    | all items keep the error and are resolved           |

use crate::metrics_defs::{VAULT_REQUEST_DURATION, VAULT_REQUESTS};
use crate::retry::RequestFlow;
use crate::sender::{HttpSender, SendError};
use crate::status::{is_server_error, is_successful};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{Method, Request, Response, StatusCode};
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum FlowError {
    #[error("invalid vault URL: {0}")]
    InvalidVaultUrl(String),
    #[error("failed to marshal body of vault API request: {0}")]
    Payload(String),
    #[error("failed to create vault API request: {0}")]
    Request(String),
    #[error("vault API request timed out after {0:?}")]
    Timeout(Duration),
    #[error("vault API request failed: {0}")]
    Transport(String),
    #[error("failed to decode vault API response: while decoding '{body}': {reason}")]
    Decode { body: String, reason: String },
    #[error("received {received} results for {expected} requested items")]
    BatchSizeMismatch { expected: usize, received: usize },
    #[error("{0}")]
    Api(String),
}

/// Endpoint-specific encoding and interpretation for a [`BatchFlow`].
pub trait FlowHandler: Send + Sync {
    type Input: Send + Sync;
    type Output: Default + Send + Sync;

    /// Builds the JSON request body for a subset of the inputs.
    fn build_payload(&self, inputs: &[&Self::Input]) -> Result<serde_json::Value, serde_json::Error>;

    /// Decodes a batch-shaped response body. `expected` is the number of
    /// requested items.
    fn decode_batch(
        &self,
        expected: usize,
        body: &[u8],
    ) -> Result<Vec<Self::Output>, serde_json::Error>;

    /// Extracts the message of an error-shaped response body, if it has one.
    fn decode_error(&self, body: &[u8]) -> Option<String>;

    fn should_retry(&self, output: &Self::Output) -> bool;

    fn set_error(&self, output: &mut Self::Output, error: &FlowError, status: StatusCode);
}

/// Static per-flow request settings. The vault URL is always https or
/// localhost.
#[derive(Clone, Debug)]
pub struct FlowConfig {
    method: Method,
    vault_url: Url,
    route: String,
    bearer: String,
    timeout: Duration,
}

impl FlowConfig {
    pub fn new(
        method: Method,
        vault_url: &Url,
        route: &str,
        bearer: &str,
        timeout: Duration,
    ) -> Result<Self, FlowError> {
        validate_vault_url(vault_url)?;
        Ok(FlowConfig {
            method,
            vault_url: vault_url.clone(),
            route: route.to_string(),
            bearer: bearer.to_string(),
            timeout,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}{}",
            self.vault_url.as_str().trim_end_matches('/'),
            self.route
        )
    }
}

/// Parses a vault URL, which must use https unless it points at localhost.
pub fn parse_vault_url(vault_url: &str) -> Result<Url, FlowError> {
    let url = Url::parse(vault_url).map_err(|e| FlowError::InvalidVaultUrl(e.to_string()))?;
    validate_vault_url(&url)?;
    Ok(url)
}

pub fn validate_vault_url(url: &Url) -> Result<(), FlowError> {
    let host = match url.host_str() {
        Some(host) if !host.is_empty() => host,
        _ => return Err(FlowError::InvalidVaultUrl("must have host".into())),
    };
    if url.scheme() != "https" && host != "localhost" && host != "127.0.0.1" {
        return Err(FlowError::InvalidVaultUrl(
            "must have scheme `https` or point to localhost".into(),
        ));
    }
    Ok(())
}

pub struct BatchFlow<H: FlowHandler> {
    sender: Arc<dyn HttpSender>,
    config: FlowConfig,
    handler: H,
    inputs: Vec<H::Input>,
    outputs: Vec<H::Output>,
    // Positions of inputs/outputs that have not been resolved, ascending
    remaining: Vec<usize>,
}

impl<H: FlowHandler> BatchFlow<H> {
    pub fn new(
        sender: Arc<dyn HttpSender>,
        config: FlowConfig,
        handler: H,
        inputs: Vec<H::Input>,
    ) -> Self {
        let outputs = inputs.iter().map(|_| H::Output::default()).collect();
        let remaining = (0..inputs.len()).collect();

        BatchFlow {
            sender,
            config,
            handler,
            inputs,
            outputs,
            remaining,
        }
    }

    /// Performs one request for every unresolved item.
    ///
    /// Transient failures are recorded on the affected items and leave them
    /// eligible for another send. An `Err` means the flow hit a failure that
    /// retrying cannot fix; every unresolved item carries the error and the
    /// flow is done.
    pub async fn send(&mut self) -> Result<(), FlowError> {
        if self.remaining.is_empty() {
            return Ok(());
        }

        let request = match self.build_request() {
            Ok(request) => request,
            Err(e) => {
                self.set_error_on_remaining(&e, StatusCode::INTERNAL_SERVER_ERROR);
                self.remaining.clear();
                return Err(e);
            }
        };

        let start = Instant::now();
        let result = match tokio::time::timeout(self.config.timeout, self.sender.send(request))
            .await
        {
            Ok(result) => result,
            Err(_elapsed) => Err(SendError::Timeout),
        };
        metrics::histogram!(VAULT_REQUEST_DURATION.name).record(start.elapsed().as_secs_f64());

        let response = match result {
            Ok(response) => response,
            Err(SendError::Timeout) => {
                metrics::counter!(VAULT_REQUESTS.name, "outcome" => "timeout").increment(1);
                tracing::warn!(
                    items = self.remaining.len(),
                    timeout = ?self.config.timeout,
                    "Vault API request timed out, not retrying"
                );
                let e = FlowError::Timeout(self.config.timeout);
                self.set_error_on_remaining(&e, StatusCode::INTERNAL_SERVER_ERROR);
                self.remaining.clear();
                return Ok(());
            }
            Err(SendError::Transport(message)) => {
                metrics::counter!(VAULT_REQUESTS.name, "outcome" => "transport_error").increment(1);
                tracing::info!(
                    items = self.remaining.len(),
                    error = %message,
                    "Vault API request failed"
                );
                let e = FlowError::Transport(message);
                self.set_error_on_remaining(&e, StatusCode::INTERNAL_SERVER_ERROR);
                return Ok(());
            }
        };

        metrics::counter!(VAULT_REQUESTS.name, "outcome" => status_family(response.status()))
            .increment(1);

        if let Err(e) = self.unpack_response(response) {
            tracing::error!(error = %e, "Unrecoverable vault API response");
            self.set_error_on_remaining(&e, StatusCode::INTERNAL_SERVER_ERROR);
            self.remaining.clear();
            return Err(e);
        }

        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.remaining.is_empty()
    }

    /// All outputs by original position, resolved or not.
    pub fn results(&self) -> &[H::Output] {
        &self.outputs
    }

    pub fn into_results(self) -> Vec<H::Output> {
        self.outputs
    }

    pub fn remaining(&self) -> &[usize] {
        &self.remaining
    }

    fn build_request(&self) -> Result<Request<Bytes>, FlowError> {
        let inputs: Vec<&H::Input> = self.remaining.iter().map(|&i| &self.inputs[i]).collect();

        let payload = self
            .handler
            .build_payload(&inputs)
            .map_err(|e| FlowError::Payload(e.to_string()))?;
        let body = serde_json::to_vec(&payload).map_err(|e| FlowError::Payload(e.to_string()))?;

        Request::builder()
            .method(self.config.method.clone())
            .uri(self.config.endpoint())
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {}", self.config.bearer))
            .body(Bytes::from(body))
            .map_err(|e| FlowError::Request(e.to_string()))
    }

    fn unpack_response(&mut self, response: Response<Bytes>) -> Result<(), FlowError> {
        let status = response.status();
        let body = response.into_body();

        if is_successful(status.as_u16()) {
            // A success body we cannot read means the response format changed
            let outputs = self.decode_batch(&body)?;
            return self.unpack_batch(outputs);
        }

        if is_server_error(status.as_u16()) {
            // The same transient condition may have mangled the body, so retry
            return match self.decode_batch(&body) {
                Ok(outputs) => self.unpack_batch(outputs),
                Err(e) => {
                    self.set_error_on_remaining(&e, status);
                    Ok(())
                }
            };
        }

        let e = self.decode_error(&body);
        self.set_error_on_remaining(&e, status);
        if status != StatusCode::TOO_MANY_REQUESTS {
            self.remaining.clear();
        }
        Ok(())
    }

    fn unpack_batch(&mut self, outputs: Vec<H::Output>) -> Result<(), FlowError> {
        if outputs.len() != self.remaining.len() {
            return Err(FlowError::BatchSizeMismatch {
                expected: self.remaining.len(),
                received: outputs.len(),
            });
        }

        let mut retry = Vec::new();
        for (&index, output) in self.remaining.iter().zip(outputs) {
            if self.handler.should_retry(&output) {
                retry.push(index);
            }
            self.outputs[index] = output;
        }

        tracing::debug!(
            requested = self.remaining.len(),
            retryable = retry.len(),
            "Unpacked vault API batch"
        );
        self.remaining = retry;
        Ok(())
    }

    fn decode_batch(&self, body: &[u8]) -> Result<Vec<H::Output>, FlowError> {
        self.handler
            .decode_batch(self.remaining.len(), body)
            .map_err(|e| match self.handler.decode_error(body) {
                Some(message) => FlowError::Api(message),
                None => FlowError::Decode {
                    body: String::from_utf8_lossy(body).into_owned(),
                    reason: e.to_string(),
                },
            })
    }

    fn decode_error(&self, body: &[u8]) -> FlowError {
        let message = self
            .handler
            .decode_error(body)
            .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());
        FlowError::Api(message)
    }

    fn set_error_on_remaining(&mut self, error: &FlowError, status: StatusCode) {
        for &index in &self.remaining {
            self.handler
                .set_error(&mut self.outputs[index], error, status);
        }
    }
}

#[async_trait]
impl<H: FlowHandler> RequestFlow for BatchFlow<H> {
    async fn send(&mut self) -> Result<(), FlowError> {
        BatchFlow::send(self).await
    }

    fn is_done(&self) -> bool {
        BatchFlow::is_done(self)
    }
}

fn status_family(status: StatusCode) -> &'static str {
    match status.as_u16() {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        429 => "429",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}
