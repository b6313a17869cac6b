//! MedScan: brain, lung and skin cancer image classification.
//!
//! `ops` holds the CPU image operations behind the brain MRI preprocessing
//! pipeline, `model` the checkpoint registry and inference dispatcher, and
//! `onnx` the dynamically loaded ONNX Runtime backend that runs the graphs.

pub mod logger;

pub mod cli;
pub mod error;
pub mod io;
pub mod model;
pub mod onnx;
pub mod ops;
pub mod settings;

pub use error::{CheckpointError, ClassifyError, Fallback};
pub use model::{CancerKind, Dispatcher, ModelRegistry, Prediction};
