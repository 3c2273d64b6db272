//! Bearer token supply for vault API requests.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

#[derive(thiserror::Error, Debug)]
pub enum BearerError {
    #[error("failed to authenticate with the vault API: {0}")]
    Authenticate(String),
    #[error("could not read bearer token: {0}")]
    Io(#[from] std::io::Error),
    #[error("bearer token is empty")]
    Empty,
}

/// Hands out a bearer token that is valid at the time of the call.
#[async_trait]
pub trait BearerSupplier: Send + Sync {
    async fn bearer(&self) -> Result<String, BearerError>;
}

/// Produces a fresh bearer token on demand.
#[async_trait]
pub trait BearerGenerator: Send + Sync {
    async fn generate(&self) -> Result<String, BearerError>;
}

pub struct StaticBearer(String);

impl StaticBearer {
    pub fn new(token: impl Into<String>) -> Self {
        StaticBearer(token.into())
    }
}

#[async_trait]
impl BearerSupplier for StaticBearer {
    async fn bearer(&self) -> Result<String, BearerError> {
        if self.0.is_empty() {
            return Err(BearerError::Empty);
        }
        Ok(self.0.clone())
    }
}

/// Reads the token from a file that some other process keeps up to date.
pub struct FileBearerGenerator {
    path: PathBuf,
}

impl FileBearerGenerator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileBearerGenerator { path: path.into() }
    }
}

#[async_trait]
impl BearerGenerator for FileBearerGenerator {
    async fn generate(&self) -> Result<String, BearerError> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let token = contents.trim();
        if token.is_empty() {
            return Err(BearerError::Empty);
        }
        Ok(token.to_string())
    }
}

/// Caches a generated token and regenerates it once it has expired.
pub struct RefreshingBearer<G> {
    generator: G,
    cached: Mutex<String>,
}

impl<G: BearerGenerator> RefreshingBearer<G> {
    pub fn new(generator: G) -> Self {
        RefreshingBearer {
            generator,
            cached: Mutex::new(String::new()),
        }
    }
}

#[async_trait]
impl<G: BearerGenerator> BearerSupplier for RefreshingBearer<G> {
    async fn bearer(&self) -> Result<String, BearerError> {
        let mut cached = self.cached.lock().await;
        if is_bearer_expired(&cached) {
            let token = self
                .generator
                .generate()
                .await
                .map_err(|e| BearerError::Authenticate(e.to_string()))?;
            tracing::debug!("Refreshed vault bearer token");
            *cached = token;
        }
        Ok(cached.clone())
    }
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<u64>,
}

/// Checks the `exp` claim of a JWT against the current time.
///
/// Anything that cannot be decoded as a JWT counts as expired. A token
/// without an `exp` claim never expires.
pub fn is_bearer_expired(bearer: &str) -> bool {
    let Some(payload) = bearer.split('.').nth(1) else {
        return true;
    };
    let Ok(decoded) = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')) else {
        return true;
    };
    let Ok(claims) = serde_json::from_slice::<Claims>(&decoded) else {
        return true;
    };

    match claims.exp {
        Some(exp) => {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            exp <= now
        }
        None => false,
    }
}
