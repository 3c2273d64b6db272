use async_trait::async_trait;
use batchflow::retry::ExponentialBackoff;
use batchflow::sender::{HttpSender, SendError};
use bytes::Bytes;
use http::header::AUTHORIZATION;
use http::{Request, Response, StatusCode};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

/// In-memory vault API.
///
/// Token `missing` is not found, token `flaky` fails with a 503 on its first
/// lookup, and every token of vault `forbidden` is rejected with a 403 for
/// the whole batch. Anything else resolves to `<vault>:<token>`.
pub struct FakeVault {
    requests: Mutex<Vec<(String, Vec<String>)>>,
    lookups: Mutex<HashMap<String, usize>>,
}

impl FakeVault {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeVault {
            requests: Mutex::new(Vec::new()),
            lookups: Mutex::new(HashMap::new()),
        })
    }

    pub fn url() -> Url {
        Url::parse("https://vault.example.com").unwrap()
    }

    pub fn backoff() -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    pub fn requested_tokens(&self) -> Vec<Vec<String>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(_, tokens)| tokens.clone())
            .collect()
    }

    pub fn requested_vaults(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(vault, _)| vault.clone())
            .collect()
    }

    fn lookup(&self, vault: &str, token: &str) -> Value {
        let mut lookups = self.lookups.lock().unwrap();
        let seen = lookups.entry(token.to_string()).or_insert(0);
        *seen += 1;

        match token {
            "missing" => json!({"token": token, "error": "Token not found", "httpCode": 404}),
            "flaky" if *seen == 1 => {
                json!({"token": token, "error": "Internal error", "httpCode": 503})
            }
            _ => json!({"token": token, "value": format!("{vault}:{token}"), "httpCode": 200}),
        }
    }
}

fn respond(status: StatusCode, body: Value) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(body.to_string()));
    *response.status_mut() = status;
    response
}

#[async_trait]
impl HttpSender for FakeVault {
    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, SendError> {
        assert_eq!(
            request.uri(),
            "https://vault.example.com/v2/tokens/detokenize"
        );
        assert_eq!(request.headers()[AUTHORIZATION], "Bearer secret");

        let body: Value = serde_json::from_slice(request.body()).unwrap();
        let vault = body["vaultID"].as_str().unwrap().to_string();
        let tokens: Vec<String> = serde_json::from_value(body["tokens"].clone()).unwrap();
        self.requests
            .lock()
            .unwrap()
            .push((vault.clone(), tokens.clone()));

        if vault == "forbidden" {
            return Ok(respond(
                StatusCode::FORBIDDEN,
                json!({"error": {"message": "Vault access denied"}}),
            ));
        }

        let records: Vec<Value> = tokens.iter().map(|t| self.lookup(&vault, t)).collect();
        Ok(respond(StatusCode::OK, json!({ "response": records })))
    }
}
