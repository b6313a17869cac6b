// ============================================================================
// CHECKPOINTS - on-disk layout and metadata manifests
// ============================================================================
//
// Each model is an ONNX graph plus JSON metadata. Layout under the model
// directory:
//
//   brain/brain_tumor_classifier_v2_improved.{onnx,json}   current
//   brain/brain_tumor_classifier_v1.{onnx,json}            legacy
//   lungs/lung_cnn_checkpoint.{onnx,json} + lung_class_names.json
//   skin/skin_cnn_full_model.onnx + class_names.json
//
// The brain manifests carry their own class names and normalization. Lung
// and skin read class names from a sidecar list; skin has no manifest at
// all and uses fixed ImageNet statistics.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CheckpointError;

pub const BRAIN_V2_STEM: &str = "brain/brain_tumor_classifier_v2_improved";
pub const BRAIN_V1_STEM: &str = "brain/brain_tumor_classifier_v1";
pub const LUNG_STEM: &str = "lungs/lung_cnn_checkpoint";
pub const LUNG_CLASS_NAMES: &str = "lungs/lung_class_names.json";
pub const SKIN_GRAPH: &str = "skin/skin_cnn_full_model.onnx";
pub const SKIN_CLASS_NAMES: &str = "skin/class_names.json";
pub const SKIN_INPUT_SIZE: u32 = 128;
/// Largest square side a manifest may ask inputs to be resized to.
pub const MAX_INPUT_SIZE: u32 = 4096;

/// `<root>/<stem>.onnx`
pub fn graph_path(root: &Path, stem: &str) -> PathBuf {
    root.join(format!("{}.onnx", stem))
}

/// `<root>/<stem>.json`
pub fn manifest_path(root: &Path, stem: &str) -> PathBuf {
    root.join(format!("{}.json", stem))
}

// ============================================================================
// SHARED FIELDS
// ============================================================================

/// Expected input resolution: a single side or a `[h, w]` pair. Inputs are
/// always resized to a square of the first dimension.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputSize {
    Square(u32),
    Dims(Vec<u32>),
}

impl InputSize {
    pub fn resize_target(&self, default: u32) -> u32 {
        match self {
            InputSize::Square(side) => *side,
            InputSize::Dims(dims) => dims.first().copied().unwrap_or(default),
        }
    }

    /// `resize_target`, rejected unless it lies in `1..=MAX_INPUT_SIZE`.
    pub fn checked_target(&self, path: &Path, default: u32) -> Result<u32, CheckpointError> {
        let side = self.resize_target(default);
        if (1..=MAX_INPUT_SIZE).contains(&side) {
            Ok(side)
        } else {
            Err(CheckpointError::Malformed {
                path: path.to_path_buf(),
                reason: format!("input_size {} outside 1..={}", side, MAX_INPUT_SIZE),
            })
        }
    }
}

/// Per-channel (R, G, B) normalization applied after scaling to [0, 1].
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Normalization {
    pub const IMAGENET: Normalization = Normalization {
        mean: [0.485, 0.456, 0.406],
        std: [0.229, 0.224, 0.225],
    };

    /// Checked conversion from manifest vectors.
    pub fn from_vecs(path: &Path, mean: &[f32], std: &[f32]) -> Result<Self, CheckpointError> {
        let malformed = |reason: String| CheckpointError::Malformed {
            path: path.to_path_buf(),
            reason,
        };
        let mean: [f32; 3] = mean
            .try_into()
            .map_err(|_| malformed(format!("mean must have 3 channels, got {}", mean.len())))?;
        let std: [f32; 3] = std
            .try_into()
            .map_err(|_| malformed(format!("std must have 3 channels, got {}", std.len())))?;
        if mean.iter().any(|m| !m.is_finite()) || std.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(malformed(format!(
                "invalid normalization mean {:?} std {:?}",
                mean, std
            )));
        }
        Ok(Self { mean, std })
    }
}

// ============================================================================
// MANIFESTS
// ============================================================================

/// Metadata stored next to both brain graph versions.
#[derive(Clone, Debug, Deserialize)]
pub struct BrainManifest {
    pub model_config: BrainModelConfig,
    pub preprocessing: BrainPreprocessing,
    #[serde(default)]
    pub performance: Performance,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BrainModelConfig {
    pub class_names: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BrainPreprocessing {
    pub input_size: InputSize,
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

/// Training-time scores. The current schema reports test accuracy, the
/// legacy one validation accuracy; either may be absent.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Performance {
    #[serde(default)]
    pub best_test_accuracy: Option<f64>,
    #[serde(default)]
    pub best_val_accuracy: Option<f64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LungManifest {
    pub num_classes: usize,
    pub input_size: InputSize,
    pub normalize_mean: Vec<f32>,
    pub normalize_std: Vec<f32>,
}

// ============================================================================
// READERS
// ============================================================================

/// Read and parse a JSON file, mapping each failure to its checkpoint error.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, CheckpointError> {
    let text = fs::read_to_string(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => CheckpointError::Missing(path.to_path_buf()),
        _ => CheckpointError::Io {
            path: path.to_path_buf(),
            source: e,
        },
    })?;
    serde_json::from_str(&text).map_err(|e| CheckpointError::Malformed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Ordered class-name list, index-aligned with the network output.
pub fn read_class_names(path: &Path) -> Result<Vec<String>, CheckpointError> {
    let names: Vec<String> = read_json(path)?;
    check_class_names(path, &names)?;
    Ok(names)
}

/// Class names key the probability map, so they must be non-empty and
/// unique.
pub fn check_class_names(path: &Path, names: &[String]) -> Result<(), CheckpointError> {
    let malformed = |reason: String| CheckpointError::Malformed {
        path: path.to_path_buf(),
        reason,
    };
    if names.is_empty() {
        return Err(malformed("class name list is empty".to_string()));
    }
    let mut seen = HashSet::with_capacity(names.len());
    if let Some(dup) = names.iter().find(|name| !seen.insert(name.as_str())) {
        return Err(malformed(format!("duplicate class name '{}'", dup)));
    }
    Ok(())
}
