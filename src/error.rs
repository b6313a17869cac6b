// ============================================================================
// ERRORS - checkpoint loading, prediction, and preprocessing fallbacks
// ============================================================================

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::model::CancerKind;
use crate::onnx::OnnxError;

/// Why a cancer type's model could not be brought up at startup.
/// Recorded once per kind and never retried.
#[derive(Debug)]
pub enum CheckpointError {
    Missing(PathBuf),
    Malformed { path: PathBuf, reason: String },
    ArchitectureMismatch {
        path: PathBuf,
        expected: usize,
        found: usize,
    },
    Io { path: PathBuf, source: std::io::Error },
    Runtime(OnnxError),
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointError::Missing(p) => write!(f, "checkpoint not found: {}", p.display()),
            CheckpointError::Malformed { path, reason } => {
                write!(f, "malformed checkpoint {}: {}", path.display(), reason)
            }
            CheckpointError::ArchitectureMismatch { path, expected, found } => write!(
                f,
                "architecture mismatch in {}: expected {} classes, network has {}",
                path.display(),
                expected,
                found
            ),
            CheckpointError::Io { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            CheckpointError::Runtime(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CheckpointError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CheckpointError::Io { source, .. } => Some(source),
            CheckpointError::Runtime(e) => Some(e),
            _ => None,
        }
    }
}

impl From<OnnxError> for CheckpointError {
    fn from(e: OnnxError) -> Self {
        CheckpointError::Runtime(e)
    }
}

/// Errors surfaced to the caller of `predict`.
#[derive(Debug)]
pub enum ClassifyError {
    ModelUnavailable(CancerKind),
    InvalidImage(String),
    UnsupportedExtension(String),
    UploadTooLarge { size: usize, limit: usize },
    Inference(String),
    Io(std::io::Error),
}

impl fmt::Display for ClassifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassifyError::ModelUnavailable(kind) => {
                write!(f, "{} model not loaded", kind.display_name())
            }
            ClassifyError::InvalidImage(e) => write!(f, "could not decode image: {}", e),
            ClassifyError::UnsupportedExtension(ext) => write!(
                f,
                "invalid file type '{}'. Allowed: {}",
                ext,
                crate::io::ALLOWED_EXTENSIONS.join(", ")
            ),
            ClassifyError::UploadTooLarge { size, limit } => {
                write!(f, "upload is {} bytes, limit is {} bytes", size, limit)
            }
            ClassifyError::Inference(e) => write!(f, "inference failed: {}", e),
            ClassifyError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ClassifyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClassifyError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ClassifyError {
    fn from(e: std::io::Error) -> Self {
        ClassifyError::Io(e)
    }
}

impl From<image::ImageError> for ClassifyError {
    fn from(e: image::ImageError) -> Self {
        ClassifyError::InvalidImage(e.to_string())
    }
}

/// A preprocessing anomaly that was absorbed instead of failing the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Fallback {
    /// Min/max normalization had no range to stretch; the stage was a no-op.
    DegenerateImage { stage: &'static str },
    /// No foreground contour survived; an all-zero mask was used.
    EmptySegmentation,
}

impl fmt::Display for Fallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fallback::DegenerateImage { stage } => {
                write!(f, "constant image at '{}', normalization skipped", stage)
            }
            Fallback::EmptySegmentation => write!(f, "no foreground region, using empty mask"),
        }
    }
}
