//! Runtime configuration shared by every MomentumContrast crate.

pub mod determinism;
pub mod tracing;
