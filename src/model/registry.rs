// ============================================================================
// MODEL REGISTRY - one entry per cancer type, loaded once at startup
// ============================================================================
//
// Every cancer type loads independently: a missing file, a bad manifest or
// a graph that disagrees with its class list marks that type unavailable
// for the life of the process and leaves the others alone.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::CheckpointError;
use crate::model::checkpoint::{
    self, BRAIN_V1_STEM, BRAIN_V2_STEM, BrainManifest, InputSize, LUNG_CLASS_NAMES, LUNG_STEM,
    LungManifest, Normalization, SKIN_CLASS_NAMES, SKIN_GRAPH, SKIN_INPUT_SIZE,
};
use crate::model::CancerKind;
use crate::model::entry::{BrainInfo, ModelEntry, ModelInfo, ModelVariant};
use crate::model::network::{Network, NetworkLoader};
use crate::{log_err, log_info, log_warn};

#[derive(Debug, Default)]
pub struct ModelRegistry {
    entries: BTreeMap<CancerKind, ModelEntry>,
    unavailable: BTreeMap<CancerKind, String>,
}

impl ModelRegistry {
    /// Load all three models from `root`. Never fails as a whole.
    ///
    /// `root` is canonicalized first so graph paths reach the loader
    /// absolute and free of `..`; a root that cannot be resolved is used
    /// as given.
    pub fn load(root: &Path, loader: &dyn NetworkLoader) -> Self {
        let root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        let root = root.as_path();
        log_info!("Loading models from {}", root.display());
        let mut registry = Self::default();
        for kind in CancerKind::ALL {
            match load_kind(root, kind, loader) {
                Ok(entry) => {
                    if let Some(acc) = entry.variant.accuracy() {
                        log_info!(
                            "{} model loaded ({}, accuracy {:.2}%)",
                            kind.display_name(),
                            entry.variant.version(),
                            acc * 100.0
                        );
                    } else {
                        log_info!("{} model loaded", kind.display_name());
                    }
                    registry.entries.insert(kind, entry);
                }
                Err(e) => {
                    log_err!("Error loading {} model: {}", kind, e);
                    registry.unavailable.insert(kind, e.to_string());
                }
            }
        }
        registry
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, kind: CancerKind) -> Option<&ModelEntry> {
        self.entries.get(&kind)
    }

    /// Why `kind` failed to load, if it did.
    pub fn unavailable_reason(&self, kind: CancerKind) -> Option<&str> {
        self.unavailable.get(&kind).map(String::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ModelEntry> {
        self.entries.values()
    }

    pub fn loaded_kinds(&self) -> Vec<CancerKind> {
        self.entries.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn list_models(&self) -> BTreeMap<CancerKind, ModelInfo> {
        self.entries
            .iter()
            .map(|(kind, entry)| (*kind, entry.info()))
            .collect()
    }

    pub fn brain_info(&self) -> Option<BrainInfo> {
        self.get(CancerKind::Brain).map(ModelEntry::brain_info)
    }
}

/// Assembles a registry from already-built entries.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    registry: ModelRegistry,
}

impl RegistryBuilder {
    pub fn entry(mut self, entry: ModelEntry) -> Self {
        self.registry.unavailable.remove(&entry.kind);
        self.registry.entries.insert(entry.kind, entry);
        self
    }

    pub fn unavailable(mut self, kind: CancerKind, reason: impl Into<String>) -> Self {
        self.registry.entries.remove(&kind);
        self.registry.unavailable.insert(kind, reason.into());
        self
    }

    pub fn build(self) -> ModelRegistry {
        self.registry
    }
}

// ============================================================================
// PER-KIND LOADERS
// ============================================================================

pub fn load_kind(
    root: &Path,
    kind: CancerKind,
    loader: &dyn NetworkLoader,
) -> Result<ModelEntry, CheckpointError> {
    match kind {
        CancerKind::Brain => load_brain(root, loader),
        CancerKind::Lung => load_lung(root, loader),
        CancerKind::Skin => load_skin(root, loader),
    }
}

/// Prefer the current checkpoint; fall back to the legacy one when the
/// current graph is absent or fails to load.
fn load_brain(root: &Path, loader: &dyn NetworkLoader) -> Result<ModelEntry, CheckpointError> {
    let v2_graph = checkpoint::graph_path(root, BRAIN_V2_STEM);
    if v2_graph.exists() {
        match load_brain_version(root, BRAIN_V2_STEM, loader, |perf| ModelVariant::BrainV2 {
            test_accuracy: perf.best_test_accuracy.unwrap_or(0.0),
        }) {
            Ok(entry) => return Ok(entry),
            Err(e) => {
                log_warn!("Brain v2 checkpoint unusable ({}), trying legacy v1", e);
            }
        }
    } else {
        log_info!("Brain v2 checkpoint not found, loading legacy v1");
    }

    let entry = load_brain_version(root, BRAIN_V1_STEM, loader, |perf| ModelVariant::BrainV1 {
        val_accuracy: perf.best_val_accuracy.unwrap_or(0.0),
    })?;
    log_warn!("Using legacy brain model; the improved v2 checkpoint is more accurate");
    Ok(entry)
}

fn load_brain_version(
    root: &Path,
    stem: &str,
    loader: &dyn NetworkLoader,
    variant: impl Fn(&checkpoint::Performance) -> ModelVariant,
) -> Result<ModelEntry, CheckpointError> {
    let manifest_path = checkpoint::manifest_path(root, stem);
    let manifest: BrainManifest = checkpoint::read_json(&manifest_path)?;
    let classes = manifest.model_config.class_names;
    checkpoint::check_class_names(&manifest_path, &classes)?;
    manifest
        .preprocessing
        .input_size
        .checked_target(&manifest_path, CancerKind::Brain.default_input_size())?;
    let normalization = Normalization::from_vecs(
        &manifest_path,
        &manifest.preprocessing.mean,
        &manifest.preprocessing.std,
    )?;

    let graph = checkpoint::graph_path(root, stem);
    let network = loader.load(&graph)?;
    check_output_classes(&graph, network.as_ref(), classes.len())?;

    Ok(ModelEntry::new(
        CancerKind::Brain,
        variant(&manifest.performance),
        network,
        classes,
        manifest.preprocessing.input_size,
        normalization,
    ))
}

fn load_lung(root: &Path, loader: &dyn NetworkLoader) -> Result<ModelEntry, CheckpointError> {
    let manifest_path = checkpoint::manifest_path(root, LUNG_STEM);
    let manifest: LungManifest = checkpoint::read_json(&manifest_path)?;
    manifest
        .input_size
        .checked_target(&manifest_path, CancerKind::Lung.default_input_size())?;
    let normalization = Normalization::from_vecs(
        &manifest_path,
        &manifest.normalize_mean,
        &manifest.normalize_std,
    )?;

    let names_path = root.join(LUNG_CLASS_NAMES);
    let classes = checkpoint::read_class_names(&names_path)?;
    if classes.len() != manifest.num_classes {
        return Err(CheckpointError::ArchitectureMismatch {
            path: names_path,
            expected: manifest.num_classes,
            found: classes.len(),
        });
    }

    let graph = checkpoint::graph_path(root, LUNG_STEM);
    let network = loader.load(&graph)?;
    check_output_classes(&graph, network.as_ref(), classes.len())?;

    Ok(ModelEntry::new(
        CancerKind::Lung,
        ModelVariant::Lung,
        network,
        classes,
        manifest.input_size,
        normalization,
    ))
}

fn load_skin(root: &Path, loader: &dyn NetworkLoader) -> Result<ModelEntry, CheckpointError> {
    let classes = checkpoint::read_class_names(&root.join(SKIN_CLASS_NAMES))?;
    let graph = root.join(SKIN_GRAPH);
    let network = loader.load(&graph)?;
    check_output_classes(&graph, network.as_ref(), classes.len())?;

    Ok(ModelEntry::new(
        CancerKind::Skin,
        ModelVariant::Skin,
        network,
        classes,
        InputSize::Square(SKIN_INPUT_SIZE),
        Normalization::IMAGENET,
    ))
}

/// The graph's declared output width must match the class list.
fn check_output_classes(
    graph: &Path,
    network: &dyn Network,
    expected: usize,
) -> Result<(), CheckpointError> {
    match network.output_classes() {
        Some(found) if found != expected => Err(CheckpointError::ArchitectureMismatch {
            path: graph.to_path_buf(),
            expected,
            found,
        }),
        _ => Ok(()),
    }
}
