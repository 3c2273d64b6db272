//! Structured log entries for Cloud Run.
//!
//! Cloud Logging parses every JSON line written to stdout as a log entry. The
//! `severity` key sets the entry's level and `logging.googleapis.com/trace`
//! links the entry to the request's trace, which the request span carries in
//! its `trace` field.

use serde_json::{Map, Value};
use std::fmt;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{JsonFields, Writer};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields, MakeWriter};
use tracing_subscriber::registry::LookupSpan;

pub const TRACE_KEY: &str = "logging.googleapis.com/trace";

/// Formats each event as one Cloud Logging JSON entry.
pub struct CloudRunFormat;

/// A fmt layer that writes Cloud Logging entries to `make_writer`.
pub fn layer<S, W>(
    make_writer: W,
) -> tracing_subscriber::fmt::Layer<S, JsonFields, CloudRunFormat, W>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + 'static,
{
    tracing_subscriber::fmt::layer()
        .fmt_fields(JsonFields::new())
        .event_format(CloudRunFormat)
        .with_writer(make_writer)
}

fn severity(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "ERROR",
        Level::WARN => "WARNING",
        Level::INFO => "INFO",
        _ => "DEBUG",
    }
}

impl<S, N> FormatEvent<S, N> for CloudRunFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut fields = Map::new();

        // Outer span fields first so the innermost value wins
        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                let extensions = span.extensions();
                let Some(formatted) = extensions.get::<FormattedFields<N>>() else {
                    continue;
                };
                if let Ok(Value::Object(span_fields)) =
                    serde_json::from_str::<Value>(&formatted.fields)
                {
                    fields.extend(span_fields);
                }
            }
        }
        event.record(&mut JsonVisitor(&mut fields));

        let mut entry = Map::new();
        entry.insert(
            "severity".into(),
            severity(event.metadata().level()).into(),
        );
        entry.insert(
            "message".into(),
            fields.remove("message").unwrap_or(Value::String(String::new())),
        );
        if let Some(trace) = fields.remove("trace") {
            entry.insert(TRACE_KEY.into(), trace);
        }
        entry.insert("target".into(), event.metadata().target().into());
        entry.extend(fields);

        writeln!(writer, "{}", Value::Object(entry))
    }
}

struct JsonVisitor<'a>(&'a mut Map<String, Value>);

impl Visit for JsonVisitor<'_> {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.0.insert(field.name().into(), value.into());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().into(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().into(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().into(), value.into());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().into(), value.into());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.0.insert(field.name().into(), value.to_string().into());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0
            .insert(field.name().into(), format!("{value:?}").into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::prelude::*;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn entries(&self) -> Vec<Value> {
            let output = String::from_utf8(self.0.lock().unwrap().clone()).unwrap();
            output
                .lines()
                .map(|line| serde_json::from_str(line).unwrap())
                .collect()
        }
    }

    fn capture(f: impl FnOnce()) -> Vec<Value> {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::registry().with(layer(move || writer.clone()));
        tracing::subscriber::with_default(subscriber, f);
        captured.entries()
    }

    #[test]
    fn test_entry_carries_severity_and_trace() {
        let entries = capture(|| {
            let span = tracing::info_span!(
                "request",
                request_id = "r1",
                trace = tracing::field::Empty,
            );
            span.record("trace", "projects/p/traces/abc");
            let _guard = span.enter();
            tracing::warn!(items = 3, "Vault API request failed");
        });

        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry["severity"], "WARNING");
        assert_eq!(entry[TRACE_KEY], "projects/p/traces/abc");
        assert_eq!(entry["message"], "Vault API request failed");
        assert_eq!(entry["request_id"], "r1");
        assert_eq!(entry["items"], 3);
        assert!(entry.get("trace").is_none());
    }

    #[test]
    fn test_entry_without_trace() {
        let entries = capture(|| {
            tracing::error!(error = "boom", "server cannot start");
            tracing::info!("Starting detokenize service");
        });

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["severity"], "ERROR");
        assert_eq!(entries[0]["error"], "boom");
        assert!(entries[0].get(TRACE_KEY).is_none());
        assert_eq!(entries[1]["severity"], "INFO");
        assert_eq!(entries[1]["message"], "Starting detokenize service");
    }

    #[test]
    fn test_severity_mapping() {
        assert_eq!(severity(&Level::ERROR), "ERROR");
        assert_eq!(severity(&Level::WARN), "WARNING");
        assert_eq!(severity(&Level::INFO), "INFO");
        assert_eq!(severity(&Level::DEBUG), "DEBUG");
        assert_eq!(severity(&Level::TRACE), "DEBUG");
    }
}
