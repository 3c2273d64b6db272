use crate::config::ValidationError;
use batchflow::batch::BatchError;
use batchflow::bearer::BearerError;
use batchflow::flow::FlowError;
use thiserror::Error;

/// Errors that can occur while serving detokenize requests
#[derive(Error, Debug)]
pub enum DetokenizeError {
    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error(transparent)]
    Bearer(#[from] BearerError),

    #[error("batch indices must match output size: found index {index}, output size {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("invalid configuration: {0}")]
    Config(#[from] ValidationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to read request body: {0}")]
    Hyper(#[from] hyper::Error),
}
