//! Errors raised by the harness itself.

use insitu_core::InSituError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    InSitu(#[from] InSituError),

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("producer cluster did not start: {0}")]
    Launch(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("export failed: {0}")]
    Export(#[from] serde_json::Error),
}

pub type SimResult<T> = std::result::Result<T, SimError>;
