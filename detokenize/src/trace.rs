use http::HeaderMap;

/// Set by Cloud Run on every request, formatted as `TRACE_ID/SPAN_ID;o=OPTIONS`.
pub const CLOUD_TRACE_CONTEXT: &str = "x-cloud-trace-context";

/// Builds the Cloud Logging trace id for a request, if the project is known
/// and the request carries a trace context.
pub fn gcp_trace_id(project_id: &str, headers: &HeaderMap) -> Option<String> {
    if project_id.is_empty() {
        return None;
    }
    let context = headers.get(CLOUD_TRACE_CONTEXT)?.to_str().ok()?;
    let trace_id = context.split('/').next().filter(|id| !id.is_empty())?;
    Some(format!("projects/{project_id}/traces/{trace_id}"))
}
