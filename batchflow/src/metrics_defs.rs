//! Metrics definitions for vault request flows.

use shared::metrics_defs::{MetricDef, MetricType};

pub const VAULT_REQUESTS: MetricDef = MetricDef {
    name: "vault.requests",
    metric_type: MetricType::Counter,
    description: "Vault API requests. Tagged with outcome (status family, timeout, transport_error).",
};

pub const VAULT_REQUEST_DURATION: MetricDef = MetricDef {
    name: "vault.request.duration",
    metric_type: MetricType::Histogram,
    description: "Time spent waiting on a single vault API request in seconds",
};

pub const ALL_METRICS: &[MetricDef] = &[VAULT_REQUESTS, VAULT_REQUEST_DURATION];
