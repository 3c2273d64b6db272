use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};

#[derive(thiserror::Error, Debug)]
pub enum SendError {
    #[error("request timed out")]
    Timeout,
    #[error("{0}")]
    Transport(String),
}

/// Sends one HTTP request and buffers the whole response body.
///
/// The body is read to completion before returning, so the connection is
/// released regardless of how the caller interprets the response.
#[async_trait]
pub trait HttpSender: Send + Sync {
    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, SendError>;
}

/// [`HttpSender`] backed by a shared `reqwest` client.
#[derive(Clone, Default)]
pub struct ReqwestSender {
    client: reqwest::Client,
}

impl ReqwestSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        ReqwestSender { client }
    }
}

#[async_trait]
impl HttpSender for ReqwestSender {
    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, SendError> {
        let request = reqwest::Request::try_from(request).map_err(map_reqwest_error)?;
        let response = self
            .client
            .execute(request)
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| {
            SendError::Transport(format!("failed to read vault API response body: {e}"))
        })?;

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

fn map_reqwest_error(e: reqwest::Error) -> SendError {
    if e.is_timeout() {
        SendError::Timeout
    } else {
        SendError::Transport(e.to_string())
    }
}
