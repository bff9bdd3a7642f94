//! High-level neural module API built on top of MomentumContrast primitives.
//!
//! This crate offers a lightweight `nn.Module` style surface that keeps the
//! stack entirely in Rust: parameters carry explicit gradient buffers, and
//! updates flow through the SGD optimizer rather than an autodiff tape.

pub mod layers;
pub mod module;
pub mod optim;

pub use layers::linear::Linear;
pub use layers::sequential::Sequential;
pub use layers::Relu;
pub use module::{Module, Parameter};
pub use optim::{CosineAnnealingLr, LrScheduler, Sgd};

pub use mc_tensor::{Tensor, TensorError, TensorResult};
