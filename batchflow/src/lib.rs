//! Batch partitioning and partial-failure retry engine for bulk vault APIs.
//!
//! Inputs are grouped into capacity-bounded [`batch::Batch`]es by a
//! [`batch::Batcher`], each batch is driven against the remote API by a
//! [`flow::BatchFlow`], and [`retry::send_request`] repeats the flow with
//! exponential backoff until every item is resolved or the budget runs out.

pub mod batch;
pub mod bearer;
pub mod flow;
pub mod metrics_defs;
pub mod retry;
pub mod sender;
pub mod status;

/// Error type returned by the pluggable extractors and submitters.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
