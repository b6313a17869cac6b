// ============================================================================
// INFERENCE DISPATCH - image in, class distribution out
// ============================================================================
//
// The registry is read-only after startup and shared behind an `Arc`, so any
// number of threads can call `predict` at once. Forward passes on an
// accelerator are serialized per device through `DeviceGate`; CPU passes
// run concurrently.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use image::DynamicImage;
use serde::Serialize;

use crate::error::{ClassifyError, Fallback};
use crate::io::{self, ScopedUpload};
use crate::model::CancerKind;
use crate::model::checkpoint::MAX_INPUT_SIZE;
use crate::model::entry::ModelEntry;
use crate::model::registry::ModelRegistry;
use crate::model::tensor::{argmax, softmax, to_chw_tensor};
use crate::onnx::Device;
use crate::ops::brain::{BrainPipeline, Preprocessed};
use crate::{log_info, log_warn};

/// One classification result. Percentages are in `0..=100`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub predicted_class: String,
    pub confidence: f64,
    pub all_probabilities: BTreeMap<String, f64>,
    pub cancer_type: &'static str,
    /// Preprocessing anomalies absorbed on the way.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fallbacks: Vec<Fallback>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub status: &'static str,
    pub models_loaded: Vec<CancerKind>,
    pub device: String,
}

// ============================================================================
// DEVICE GATE
// ============================================================================

/// One lock per accelerator device. CPU work never takes a lock.
#[derive(Debug, Default)]
pub struct DeviceGate {
    locks: Mutex<HashMap<Device, Arc<Mutex<()>>>>,
}

impl DeviceGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding `device`'s lock (if it has one).
    pub fn run<T>(&self, device: Device, f: impl FnOnce() -> T) -> T {
        if !device.is_accelerator() {
            return f();
        }
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(device).or_default())
        };
        let _guard: MutexGuard<'_, ()> = lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }
}

// ============================================================================
// DISPATCHER
// ============================================================================

pub struct Dispatcher {
    registry: Arc<ModelRegistry>,
    device: Device,
    gate: DeviceGate,
    brain: BrainPipeline,
}

impl Dispatcher {
    /// `device` is the configured one; if a loaded session had to fall
    /// back to CPU the dispatcher reports CPU instead.
    pub fn new(registry: Arc<ModelRegistry>, device: Device) -> Self {
        let effective = effective_device(&registry, device);
        if effective != device {
            log_warn!("configured device {} unavailable, running on {}", device, effective);
        }
        Self {
            registry,
            device: effective,
            gate: DeviceGate::new(),
            brain: BrainPipeline::default(),
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn health(&self) -> Health {
        Health {
            status: "healthy",
            models_loaded: self.registry.loaded_kinds(),
            device: self.device.to_string(),
        }
    }

    /// Classify a decoded image with the model registered for `kind`.
    pub fn predict(
        &self,
        kind: CancerKind,
        img: &DynamicImage,
    ) -> Result<Prediction, ClassifyError> {
        let entry = self
            .registry
            .get(kind)
            .ok_or(ClassifyError::ModelUnavailable(kind))?;
        let size = entry.resize_target();
        if !(1..=MAX_INPUT_SIZE).contains(&size) {
            return Err(ClassifyError::Inference(format!(
                "{} model input size {} outside 1..={}",
                kind, size, MAX_INPUT_SIZE
            )));
        }

        let (rgb, fallbacks) = match kind {
            CancerKind::Brain => {
                let pre = self.brain.run(img);
                for fallback in &pre.fallbacks {
                    log_warn!("brain preprocessing fallback: {}", fallback);
                }
                (pre.image, pre.fallbacks)
            }
            CancerKind::Lung | CancerKind::Skin => (img.to_rgb8(), Vec::new()),
        };

        let tensor = to_chw_tensor(&rgb, size, &entry.normalization);
        let device = entry.network.device().unwrap_or(self.device);
        let logits = self
            .gate
            .run(device, || entry.network.forward(&tensor, size))
            .map_err(|e| ClassifyError::Inference(e.to_string()))?;

        let prediction = summarize(entry, &logits, fallbacks)?;
        log_info!(
            "{} prediction: {} ({:.2}%)",
            kind,
            prediction.predicted_class,
            prediction.confidence
        );
        Ok(prediction)
    }

    /// Decode `bytes` (any supported container) and classify.
    pub fn predict_bytes(
        &self,
        kind: CancerKind,
        bytes: &[u8],
    ) -> Result<Prediction, ClassifyError> {
        let img = io::decode_image(bytes)?;
        self.predict(kind, &img)
    }

    pub fn predict_file(&self, kind: CancerKind, path: &Path) -> Result<Prediction, ClassifyError> {
        let img = io::load_image(path)?;
        self.predict(kind, &img)
    }

    /// Validate an upload, park it in `upload_dir` for the duration of the
    /// prediction and remove it afterwards, whatever the outcome.
    pub fn predict_upload(
        &self,
        kind: CancerKind,
        filename: &str,
        bytes: &[u8],
        upload_dir: &Path,
    ) -> Result<Prediction, ClassifyError> {
        io::validate_upload(filename, bytes.len())?;
        if self.registry.get(kind).is_none() {
            return Err(ClassifyError::ModelUnavailable(kind));
        }
        let upload = ScopedUpload::write(upload_dir, filename, bytes)?;
        self.predict_file(kind, upload.path())
    }

    /// Run the brain pipeline alone, without a model.
    pub fn preprocess_brain(&self, img: &DynamicImage) -> Preprocessed {
        self.brain.run(img)
    }
}

/// CPU as soon as one loaded session reports a device other than the
/// configured one.
fn effective_device(registry: &ModelRegistry, configured: Device) -> Device {
    let downgraded = registry
        .entries()
        .filter_map(|entry| entry.network.device())
        .any(|actual| actual != configured);
    if downgraded { Device::Cpu } else { configured }
}

/// Softmax the logits and pair each probability with its class name.
fn summarize(
    entry: &ModelEntry,
    logits: &[f32],
    fallbacks: Vec<Fallback>,
) -> Result<Prediction, ClassifyError> {
    if logits.len() != entry.classes.len() {
        return Err(ClassifyError::Inference(format!(
            "network returned {} logits for {} classes",
            logits.len(),
            entry.classes.len()
        )));
    }
    if logits.iter().any(|v| !v.is_finite()) {
        return Err(ClassifyError::Inference(
            "network returned non-finite logits".to_string(),
        ));
    }

    let probs = softmax(logits);
    let best = argmax(&probs)
        .ok_or_else(|| ClassifyError::Inference("network returned no logits".to_string()))?;

    let all_probabilities = entry
        .classes
        .iter()
        .zip(&probs)
        .map(|(name, p)| (name.clone(), p * 100.0))
        .collect();

    Ok(Prediction {
        predicted_class: entry.classes[best].clone(),
        confidence: probs[best] * 100.0,
        all_probabilities,
        cancer_type: entry.kind.display_name(),
        fallbacks,
    })
}
