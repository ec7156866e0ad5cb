//! Embedding provider implementations.

pub mod onnx;
pub mod trigram;
