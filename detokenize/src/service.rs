use crate::detokenizer::Detokenizer;
use crate::errors::DetokenizeError;
use crate::metrics_defs::{REQUEST_DURATION, REQUESTS};
use crate::protocol::{BigQueryError, BigQueryRequest, BigQueryResponse};
use crate::replies::log_replies;
use crate::trace::gcp_trace_id;
use crate::vault::DetokenizeRecord;
use batchflow::status::STATUS_INTERNAL_SERVER_ERROR_PERMANENT;
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use shared::http::{make_boxed_error_response, make_json_response};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

type ServiceResponse = Response<BoxBody<Bytes, DetokenizeError>>;

/// Serves the BigQuery remote function endpoint at `POST /`.
pub struct DetokenizeService {
    detokenizer: Arc<Detokenizer>,
    gcp_project_id: Option<String>,
}

impl DetokenizeService {
    pub fn new(detokenizer: Arc<Detokenizer>, gcp_project_id: Option<String>) -> Self {
        DetokenizeService {
            detokenizer,
            gcp_project_id,
        }
    }
}

impl Service<Request<Incoming>> for DetokenizeService {
    type Response = ServiceResponse;
    type Error = DetokenizeError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let detokenizer = self.detokenizer.clone();
        let span = tracing::info_span!(
            "request",
            request_id = %new_request_id(),
            idempotency_key = tracing::field::Empty,
            trace = tracing::field::Empty,
        );
        if let Some(trace) = self
            .gcp_project_id
            .as_deref()
            .and_then(|project| gcp_trace_id(project, req.headers()))
        {
            span.record("trace", trace.as_str());
        }

        Box::pin(
            async move {
                let start = Instant::now();
                let method = req.method().clone();
                let path = req.uri().path().to_string();

                let result = match route(&method, &path) {
                    Some(status) => Err((status, None)),
                    None => match req.into_body().collect().await {
                        Ok(body) => handle_request(&detokenizer, &body.to_bytes()).await,
                        Err(e) => Err((
                            StatusCode::BAD_REQUEST,
                            Some(DetokenizeError::from(e).to_string()),
                        )),
                    },
                };

                let response = match result {
                    Ok(response) => response,
                    Err((status, None)) => make_boxed_error_response(status),
                    Err((status, Some(message))) => {
                        tracing::debug!(error = %message, "Returning error to caller");
                        make_json_response(status, &BigQueryError::proxy(&message))
                    }
                };
                log_response(&method, &path, response.status(), start);
                Ok(response)
            }
            .instrument(span),
        )
    }
}

/// The status to reply with when the request does not target the endpoint.
fn route(method: &Method, path: &str) -> Option<StatusCode> {
    if path != "/" {
        return Some(StatusCode::NOT_FOUND);
    }
    if method != Method::POST {
        return Some(StatusCode::METHOD_NOT_ALLOWED);
    }
    None
}

/// Status 599 is outside the set of statuses BigQuery retries on its own
/// (408, 429, 500, 503, 504).
fn permanent_error_status() -> StatusCode {
    StatusCode::from_u16(STATUS_INTERNAL_SERVER_ERROR_PERMANENT)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn handle_request(
    detokenizer: &Detokenizer,
    body: &[u8],
) -> Result<ServiceResponse, (StatusCode, Option<String>)> {
    let request = BigQueryRequest::bind(body)
        .map_err(|e| (StatusCode::BAD_REQUEST, Some(e.to_string())))?;
    tracing::Span::current().record("idempotency_key", request.request_id.as_str());

    if request.calls.is_empty() {
        tracing::info!("received request with empty calls; returning response with empty replies");
        let response: BigQueryResponse<DetokenizeRecord> = BigQueryResponse { replies: vec![] };
        return Ok(make_json_response(StatusCode::OK, &response));
    }

    let replies = detokenizer.detokenize(&request.calls).await.map_err(|e| {
        (
            permanent_error_status(),
            Some(format!("detokenization failed: {e}")),
        )
    })?;

    log_replies(&replies);
    Ok(make_json_response(
        StatusCode::OK,
        &BigQueryResponse { replies },
    ))
}

fn log_response(method: &Method, path: &str, status: StatusCode, start: Instant) {
    let latency = start.elapsed();
    metrics::counter!(REQUESTS.name, "status" => status.as_str().to_string()).increment(1);
    metrics::histogram!(REQUEST_DURATION.name).record(latency.as_secs_f64());

    if status == StatusCode::OK {
        tracing::info!(status = status.as_u16(), ?latency, %method, path, "Request handled");
    } else {
        tracing::error!(status = status.as_u16(), ?latency, %method, path, "Request failed");
    }
}

fn new_request_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}
