mod common;

use std::fs;
use std::sync::Arc;

use common::{MockLoader, model_tree, png_bytes, sample_image, scratch_dir};
use medscan::ClassifyError;
use medscan::model::{CancerKind, Dispatcher, ModelRegistry};
use medscan::onnx::Device;
use rayon::prelude::*;

fn dispatcher(tag: &str) -> (Dispatcher, std::path::PathBuf) {
    let root = model_tree(tag);
    let registry = ModelRegistry::load(&root, &MockLoader);
    (Dispatcher::new(Arc::new(registry), Device::Cpu), root)
}

#[test]
fn brain_prediction_is_deterministic() {
    let (d, root) = dispatcher("determinism");
    let img = sample_image(64, 64);
    let first = d.predict(CancerKind::Brain, &img).unwrap();
    let second = d.predict(CancerKind::Brain, &img).unwrap();
    assert_eq!(first.all_probabilities, second.all_probabilities);
    assert_eq!(first.cancer_type, "Brain Tumor");
    fs::remove_dir_all(root).unwrap();
}

#[test]
fn probabilities_sum_to_one_hundred() {
    let (d, root) = dispatcher("sums");
    let img = sample_image(80, 60);
    for kind in CancerKind::ALL {
        let p = d.predict(kind, &img).unwrap();
        let total: f64 = p.all_probabilities.values().sum();
        assert!((total - 100.0).abs() < 0.01, "{} sums to {}", kind, total);
        assert_eq!(p.all_probabilities[&p.predicted_class], p.confidence);
        assert!(p.all_probabilities.values().all(|v| *v <= p.confidence));
    }
    fs::remove_dir_all(root).unwrap();
}

#[test]
fn probabilities_follow_the_class_list() {
    let (d, root) = dispatcher("classes");
    let p = d.predict(CancerKind::Lung, &sample_image(32, 32)).unwrap();
    let names: Vec<&str> = p.all_probabilities.keys().map(String::as_str).collect();
    assert_eq!(names, ["adenocarcinoma", "benign", "squamous_cell_carcinoma"]);
    assert_eq!(p.cancer_type, "Lung Cancer");
    fs::remove_dir_all(root).unwrap();
}

#[test]
fn unloaded_lung_does_not_affect_other_kinds() {
    let root = model_tree("lungless");
    fs::remove_dir_all(root.join("lungs")).unwrap();
    let registry = ModelRegistry::load(&root, &MockLoader);
    let d = Dispatcher::new(Arc::new(registry), Device::Cpu);
    let img = sample_image(40, 40);

    assert!(matches!(
        d.predict(CancerKind::Lung, &img),
        Err(ClassifyError::ModelUnavailable(CancerKind::Lung))
    ));
    assert!(d.predict(CancerKind::Brain, &img).is_ok());
    assert!(d.predict(CancerKind::Skin, &img).is_ok());
    assert_eq!(d.health().models_loaded, vec![CancerKind::Brain, CancerKind::Skin]);
    fs::remove_dir_all(root).unwrap();
}

#[test]
fn concurrent_predictions_agree() {
    let (d, root) = dispatcher("concurrent");
    let img = sample_image(48, 48);
    let expected = d.predict(CancerKind::Skin, &img).unwrap();
    let all: Vec<_> = (0..8)
        .into_par_iter()
        .map(|_| d.predict(CancerKind::Skin, &img).unwrap())
        .collect();
    assert!(all.iter().all(|p| *p == expected));
    fs::remove_dir_all(root).unwrap();
}

#[test]
fn bytes_are_decoded_before_prediction() {
    let (d, root) = dispatcher("bytes");
    let bytes = png_bytes(&sample_image(30, 30));
    assert!(d.predict_bytes(CancerKind::Skin, &bytes).is_ok());
    assert!(matches!(
        d.predict_bytes(CancerKind::Skin, b"garbage"),
        Err(ClassifyError::InvalidImage(_))
    ));
    fs::remove_dir_all(root).unwrap();
}

#[test]
fn uploads_are_removed_on_success_and_failure() {
    let (d, root) = dispatcher("uploads");
    let uploads = scratch_dir("upload-dir");
    let bytes = png_bytes(&sample_image(30, 30));

    let ok = d.predict_upload(CancerKind::Skin, "lesion.PNG", &bytes, &uploads);
    assert!(ok.is_ok());
    assert_eq!(fs::read_dir(&uploads).unwrap().count(), 0);

    let bad = d.predict_upload(CancerKind::Skin, "lesion.png", b"not a png", &uploads);
    assert!(matches!(bad, Err(ClassifyError::InvalidImage(_))));
    assert_eq!(fs::read_dir(&uploads).unwrap().count(), 0);

    let rejected = d.predict_upload(CancerKind::Skin, "lesion.gif", &bytes, &uploads);
    assert!(matches!(rejected, Err(ClassifyError::UnsupportedExtension(_))));
    assert_eq!(fs::read_dir(&uploads).unwrap().count(), 0);

    fs::remove_dir_all(uploads).unwrap();
    fs::remove_dir_all(root).unwrap();
}

#[test]
fn prediction_json_uses_service_field_names() {
    let (d, root) = dispatcher("json");
    let p = d.predict(CancerKind::Skin, &sample_image(20, 20)).unwrap();
    let json = serde_json::to_value(&p).unwrap();
    assert!(json["predictedClass"].is_string());
    assert!(json["confidence"].is_number());
    assert!(json["allProbabilities"]["benign"].is_number());
    assert_eq!(json["cancerType"], "Skin Cancer");
    assert!(json.get("fallbacks").is_none());
    fs::remove_dir_all(root).unwrap();
}
