use serde::Serialize;

use crate::model::CancerKind;
use crate::model::checkpoint::{InputSize, Normalization};
use crate::model::network::Network;
use crate::ops::brain::PREPROCESSING_STAGES;

/// Which checkpoint family an entry came from, with the fields that family
/// actually carries.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(tag = "variant", rename_all = "camelCase")]
pub enum ModelVariant {
    #[serde(rename_all = "camelCase")]
    BrainV1 { val_accuracy: f64 },
    #[serde(rename_all = "camelCase")]
    BrainV2 { test_accuracy: f64 },
    Lung,
    Skin,
}

impl ModelVariant {
    pub fn version(&self) -> &'static str {
        match self {
            ModelVariant::BrainV1 { .. } => "v1_legacy",
            ModelVariant::BrainV2 { .. } => "v2_improved",
            ModelVariant::Lung | ModelVariant::Skin => "unknown",
        }
    }

    pub fn architecture(&self) -> &'static str {
        match self {
            ModelVariant::BrainV1 { .. } => "BrainTumorCNN (Legacy)",
            ModelVariant::BrainV2 { .. } => "ImprovedBrainTumorCNN",
            ModelVariant::Lung => "LungCNN",
            ModelVariant::Skin => "SkinCNN",
        }
    }

    /// Reported accuracy as a fraction. Legacy brain checkpoints only
    /// recorded validation accuracy, which stands in for it.
    pub fn accuracy(&self) -> Option<f64> {
        match self {
            ModelVariant::BrainV1 { val_accuracy } => Some(*val_accuracy),
            ModelVariant::BrainV2 { test_accuracy } => Some(*test_accuracy),
            ModelVariant::Lung | ModelVariant::Skin => None,
        }
    }
}

/// A loaded model with everything needed to feed it. Immutable once built.
pub struct ModelEntry {
    pub kind: CancerKind,
    pub variant: ModelVariant,
    pub network: Box<dyn Network>,
    /// Index-aligned with the network's output logits.
    pub classes: Vec<String>,
    pub input_size: InputSize,
    pub normalization: Normalization,
}

impl ModelEntry {
    pub fn new(
        kind: CancerKind,
        variant: ModelVariant,
        network: Box<dyn Network>,
        classes: Vec<String>,
        input_size: InputSize,
        normalization: Normalization,
    ) -> Self {
        Self {
            kind,
            variant,
            network,
            classes,
            input_size,
            normalization,
        }
    }

    /// Square side the input image is resized to.
    pub fn resize_target(&self) -> u32 {
        self.input_size.resize_target(self.kind.default_input_size())
    }

    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            classes: self.classes.clone(),
            num_classes: self.classes.len(),
            input_size: self.input_size.clone(),
            version: self.variant.version(),
            test_accuracy: self.variant.accuracy(),
        }
    }

    pub fn brain_info(&self) -> BrainInfo {
        BrainInfo {
            version: self.variant.version(),
            classes: self.classes.clone(),
            num_classes: self.classes.len(),
            input_size: self.input_size.clone(),
            test_accuracy: self.variant.accuracy(),
            normalization: self.normalization,
            architecture: self.variant.architecture(),
            preprocessing: PREPROCESSING_STAGES.to_vec(),
        }
    }
}

impl std::fmt::Debug for ModelEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelEntry")
            .field("kind", &self.kind)
            .field("variant", &self.variant)
            .field("classes", &self.classes)
            .field("input_size", &self.input_size)
            .finish_non_exhaustive()
    }
}

/// Summary row of the model listing.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub classes: Vec<String>,
    pub num_classes: usize,
    pub input_size: InputSize,
    pub version: &'static str,
    pub test_accuracy: Option<f64>,
}

/// Detailed record for the brain model.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrainInfo {
    pub version: &'static str,
    pub classes: Vec<String>,
    pub num_classes: usize,
    pub input_size: InputSize,
    pub test_accuracy: Option<f64>,
    pub normalization: Normalization,
    pub architecture: &'static str,
    pub preprocessing: Vec<&'static str>,
}
