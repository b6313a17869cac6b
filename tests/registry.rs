mod common;

use std::fs;
use std::path::Component;

use common::{MockLoader, RecordingLoader, brain_manifest, model_tree, write, write_json};
use medscan::model::{CancerKind, InputSize, ModelRegistry, ModelVariant};
use serde_json::json;

#[test]
fn full_tree_loads_every_kind() {
    let root = model_tree("full");
    let registry = ModelRegistry::load(&root, &MockLoader);

    assert_eq!(registry.loaded_kinds(), CancerKind::ALL.to_vec());
    let brain = registry.get(CancerKind::Brain).unwrap();
    assert_eq!(brain.variant, ModelVariant::BrainV2 { test_accuracy: 0.95 });
    assert_eq!(brain.classes.len(), 4);

    let skin = registry.get(CancerKind::Skin).unwrap();
    assert_eq!(skin.resize_target(), 128);
    assert_eq!(skin.normalization.mean, [0.485, 0.456, 0.406]);

    fs::remove_dir_all(root).unwrap();
}

#[test]
fn brain_falls_back_to_legacy_checkpoint() {
    let root = model_tree("legacy");
    fs::remove_file(root.join("brain/brain_tumor_classifier_v2_improved.onnx")).unwrap();

    let registry = ModelRegistry::load(&root, &MockLoader);
    let info = registry.brain_info().unwrap();
    assert_eq!(info.version, "v1_legacy");
    assert_eq!(info.architecture, "BrainTumorCNN (Legacy)");
    assert_eq!(info.test_accuracy, Some(0.88));
    assert_eq!(info.preprocessing.len(), 5);

    fs::remove_dir_all(root).unwrap();
}

#[test]
fn broken_v2_manifest_still_yields_legacy_brain() {
    let root = model_tree("brokenv2");
    write(&root, "brain/brain_tumor_classifier_v2_improved.json", "{ not json");

    let registry = ModelRegistry::load(&root, &MockLoader);
    let brain = registry.get(CancerKind::Brain).unwrap();
    assert!(matches!(brain.variant, ModelVariant::BrainV1 { .. }));

    fs::remove_dir_all(root).unwrap();
}

#[test]
fn one_failure_does_not_block_the_others() {
    let root = model_tree("isolation");
    write(&root, "lungs/lung_cnn_checkpoint.json", "{\"num_classes\": 3}");

    let registry = ModelRegistry::load(&root, &MockLoader);
    assert!(registry.get(CancerKind::Lung).is_none());
    assert!(registry.get(CancerKind::Brain).is_some());
    assert!(registry.get(CancerKind::Skin).is_some());
    assert!(
        registry
            .unavailable_reason(CancerKind::Lung)
            .unwrap()
            .contains("malformed")
    );

    fs::remove_dir_all(root).unwrap();
}

#[test]
fn missing_tree_marks_everything_unavailable() {
    let root = common::scratch_dir("empty");
    let registry = ModelRegistry::load(&root, &MockLoader);
    assert!(registry.is_empty());
    for kind in CancerKind::ALL {
        assert!(registry.unavailable_reason(kind).is_some());
    }
    fs::remove_dir_all(root).unwrap();
}

#[test]
fn class_count_mismatches_are_rejected() {
    let root = model_tree("mismatch");
    // Sidecar lists three names, manifest promises four.
    write_json(
        &root,
        "lungs/lung_cnn_checkpoint.json",
        &json!({
            "num_classes": 4,
            "input_size": [224, 224],
            "normalize_mean": [0.5, 0.5, 0.5],
            "normalize_std": [0.5, 0.5, 0.5]
        }),
    );
    // Graph declares three outputs for two skin classes.
    write(&root, "skin/skin_cnn_full_model.onnx", "3");

    let registry = ModelRegistry::load(&root, &MockLoader);
    assert_eq!(registry.loaded_kinds(), vec![CancerKind::Brain]);
    for kind in [CancerKind::Lung, CancerKind::Skin] {
        assert!(
            registry
                .unavailable_reason(kind)
                .unwrap()
                .contains("architecture mismatch")
        );
    }

    fs::remove_dir_all(root).unwrap();
}

#[test]
fn scalar_and_pair_input_sizes_resolve_alike() {
    let root = model_tree("inputsize");
    write_json(
        &root,
        "brain/brain_tumor_classifier_v2_improved.json",
        &brain_manifest(json!([224, 224]), json!({})),
    );
    let pair = ModelRegistry::load(&root, &MockLoader);
    let pair_entry = pair.get(CancerKind::Brain).unwrap();
    assert_eq!(pair_entry.input_size, InputSize::Dims(vec![224, 224]));
    assert_eq!(pair_entry.resize_target(), 224);
    // Missing performance block reads as zero accuracy.
    assert_eq!(pair_entry.variant, ModelVariant::BrainV2 { test_accuracy: 0.0 });

    write_json(
        &root,
        "brain/brain_tumor_classifier_v2_improved.json",
        &brain_manifest(json!(224), json!({})),
    );
    let scalar = ModelRegistry::load(&root, &MockLoader);
    assert_eq!(scalar.get(CancerKind::Brain).unwrap().resize_target(), 224);

    fs::remove_dir_all(root).unwrap();
}

#[test]
fn model_listing_serializes_like_the_service() {
    let root = model_tree("listing");
    let registry = ModelRegistry::load(&root, &MockLoader);
    let listing = serde_json::to_value(registry.list_models()).unwrap();

    assert_eq!(listing["brain"]["numClasses"], 4);
    assert_eq!(listing["brain"]["inputSize"], json!([32, 32]));
    assert_eq!(listing["brain"]["version"], "v2_improved");
    assert_eq!(listing["lung"]["inputSize"], 48);
    assert_eq!(listing["lung"]["version"], "unknown");
    assert!(listing["skin"]["testAccuracy"].is_null());

    fs::remove_dir_all(root).unwrap();
}

#[test]
fn duplicate_class_names_are_malformed() {
    let root = model_tree("dupnames");
    write_json(
        &root,
        "lungs/lung_class_names.json",
        &json!(["benign", "benign", "squamous_cell_carcinoma"]),
    );
    write_json(&root, "skin/class_names.json", &json!(["benign", "benign"]));

    let registry = ModelRegistry::load(&root, &MockLoader);
    assert_eq!(registry.loaded_kinds(), vec![CancerKind::Brain]);
    for kind in [CancerKind::Lung, CancerKind::Skin] {
        let reason = registry.unavailable_reason(kind).unwrap();
        assert!(reason.contains("duplicate class name 'benign'"), "{reason}");
    }

    fs::remove_dir_all(root).unwrap();
}

#[test]
fn duplicate_brain_classes_fall_back_then_fail() {
    let root = model_tree("dupbrain");
    let mut manifest = brain_manifest(json!(32), json!({}));
    manifest["model_config"]["class_names"] = json!(["glioma", "glioma", "notumor", "pituitary"]);
    write_json(&root, "brain/brain_tumor_classifier_v2_improved.json", &manifest);

    let registry = ModelRegistry::load(&root, &MockLoader);
    let brain = registry.get(CancerKind::Brain).unwrap();
    assert!(matches!(brain.variant, ModelVariant::BrainV1 { .. }));

    write_json(&root, "brain/brain_tumor_classifier_v1.json", &manifest);
    let registry = ModelRegistry::load(&root, &MockLoader);
    assert!(registry.get(CancerKind::Brain).is_none());
    assert!(
        registry
            .unavailable_reason(CancerKind::Brain)
            .unwrap()
            .contains("duplicate class name")
    );

    fs::remove_dir_all(root).unwrap();
}

#[test]
fn zero_or_huge_input_sizes_are_rejected() {
    let root = model_tree("badsize");
    write_json(
        &root,
        "lungs/lung_cnn_checkpoint.json",
        &json!({
            "num_classes": 3,
            "input_size": [0, 0],
            "normalize_mean": [0.5, 0.5, 0.5],
            "normalize_std": [0.5, 0.5, 0.5]
        }),
    );
    write_json(
        &root,
        "brain/brain_tumor_classifier_v2_improved.json",
        &brain_manifest(json!(4_000_000_000u32), json!({})),
    );

    let registry = ModelRegistry::load(&root, &MockLoader);
    assert!(registry.get(CancerKind::Lung).is_none());
    assert!(
        registry
            .unavailable_reason(CancerKind::Lung)
            .unwrap()
            .contains("input_size 0")
    );
    // v2 rejected, legacy v1 (input 32) takes over.
    let brain = registry.get(CancerKind::Brain).unwrap();
    assert!(matches!(brain.variant, ModelVariant::BrainV1 { .. }));
    assert_eq!(brain.resize_target(), 32);

    fs::remove_dir_all(root).unwrap();
}

#[test]
fn parent_relative_root_reaches_loader_resolved() {
    let root = model_tree("dotdot");
    let indirect = root.join("brain").join("..");
    let loader = RecordingLoader::default();

    let registry = ModelRegistry::load(&indirect, &loader);
    assert_eq!(registry.loaded_kinds(), CancerKind::ALL.to_vec());
    let seen = loader.seen.lock().unwrap();
    assert!(!seen.is_empty());
    for graph in seen.iter() {
        assert!(graph.is_absolute());
        assert!(
            graph.components().all(|c| c != Component::ParentDir),
            "{}",
            graph.display()
        );
    }
    drop(seen);

    fs::remove_dir_all(root).unwrap();
}
