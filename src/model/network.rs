use std::path::Path;

use crate::error::CheckpointError;
use crate::onnx::{Device, OnnxError};

/// A loaded classifier graph.
///
/// `forward` receives one normalized NCHW tensor of shape
/// `[1, 3, size, size]` and returns raw class logits. Implementations must
/// be pure: no training-mode state, same input gives the same output.
pub trait Network: Send + Sync {
    fn forward(&self, input: &[f32], size: u32) -> Result<Vec<f32>, OnnxError>;

    /// Number of classes the graph declares, if it declares one.
    fn output_classes(&self) -> Option<usize> {
        None
    }

    /// Where forward passes really run, when that can differ from the
    /// requested device (an accelerator session that fell back to CPU).
    fn device(&self) -> Option<Device> {
        None
    }
}

/// Turns a graph file on disk into a `Network`.
pub trait NetworkLoader {
    fn load(&self, graph: &Path) -> Result<Box<dyn Network>, CheckpointError>;
}
