//! Momentum-contrast self-supervised learning.
//!
//! The crate hosts the training-side core of a MoCo-style learner: a dual
//! encoder pair with momentum blending, fixed-capacity negative queues with
//! circular overwrite, a cross-worker batch shuffle that keeps batch-norm
//! statistics honest under data parallelism, InfoNCE logit assembly, an
//! optional KNN hard-negative miner and an optional clustering regulariser.
//! Collective communication is injected behind [`collective::Collective`] so
//! the same step logic runs single-process or across synchronous workers.

pub mod cluster;
pub mod collective;
pub mod config;
pub mod contrastive;
pub mod encoder;
pub mod knn;
pub mod metrics;
pub mod model;
pub mod queue;
pub mod rendezvous;
pub mod shuffle;
pub mod trainer;

use collective::CollectiveError;
use mc_tensor::TensorError;
use thiserror::Error;

/// Errors surfaced by the momentum-contrast crate.
#[derive(Debug, Error, PartialEq)]
pub enum MocoError {
    /// Raised when inputs have mismatched batch or feature dimensions.
    #[error("shape mismatch: {0}")]
    Shape(String),
    /// Raised when an invalid parameter (temperature, momentum, etc.) is provided.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Raised when a KNN distance metric name is not recognised.
    #[error("unsupported metric: {0}")]
    UnsupportedMetric(String),
    /// Raised when a collective communication call fails.
    #[error("collective failure: {0}")]
    Collective(#[from] CollectiveError),
}

pub type Result<T> = std::result::Result<T, MocoError>;

impl From<TensorError> for MocoError {
    fn from(err: TensorError) -> Self {
        match err {
            TensorError::InvalidDimensions { rows, cols } => {
                MocoError::Shape(format!("invalid tensor dimensions: {rows}x{cols}"))
            }
            TensorError::DataLength { expected, got } => MocoError::Shape(format!(
                "data length mismatch: expected {expected}, got {got}"
            )),
            TensorError::ShapeMismatch { left, right } => {
                MocoError::Shape(format!("shape mismatch: left={left:?}, right={right:?}"))
            }
            other => MocoError::InvalidArgument(other.to_string()),
        }
    }
}
