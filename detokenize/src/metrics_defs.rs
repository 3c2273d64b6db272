//! Metrics definitions for the detokenize service.

use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUESTS: MetricDef = MetricDef {
    name: "detokenize.requests",
    metric_type: MetricType::Counter,
    description: "Remote function requests handled. Tagged with status.",
};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "detokenize.request.duration",
    metric_type: MetricType::Histogram,
    description: "Time to handle one remote function request in seconds",
};

pub const TOKENS: MetricDef = MetricDef {
    name: "detokenize.tokens",
    metric_type: MetricType::Counter,
    description: "Replies sent back to BigQuery. Tagged with outcome (ok, failed).",
};

pub const ALL_METRICS: &[MetricDef] = &[REQUESTS, REQUEST_DURATION, TOKENS];
