use crate::metrics_defs::TOKENS;
use crate::vault::DetokenizeRecord;

const MISSING_ERROR_MESSAGE: &str = "detokenization failed but the error message is missing";

/// One line per reply that did not come back with a 200, formatted as
/// `index: status: message`.
pub fn failed_replies(replies: &[DetokenizeRecord]) -> Vec<String> {
    replies
        .iter()
        .enumerate()
        .filter(|(_, reply)| reply.http_code != Some(200))
        .map(|(i, reply)| {
            let status = reply.http_code.map(|c| c.to_string()).unwrap_or_default();
            let message = reply.error.as_deref().unwrap_or(MISSING_ERROR_MESSAGE);
            format!("{i}: {status}: {message}")
        })
        .collect()
}

pub fn log_replies(replies: &[DetokenizeRecord]) {
    let failures = failed_replies(replies);
    let ok = replies.len() - failures.len();
    metrics::counter!(TOKENS.name, "outcome" => "ok").increment(ok as u64);
    metrics::counter!(TOKENS.name, "outcome" => "failed").increment(failures.len() as u64);

    if failures.is_empty() {
        tracing::info!("successfully detokenized {} token(s)", replies.len());
    } else {
        tracing::warn!(
            "failed to detokenize {}/{} token(s):\n{}",
            failures.len(),
            replies.len(),
            failures.join("\n")
        );
    }
}
