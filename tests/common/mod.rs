#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use image::{DynamicImage, Rgb, RgbImage};
use medscan::CheckpointError;
use medscan::model::{Network, NetworkLoader};
use medscan::onnx::OnnxError;
use serde_json::{Value, json};
use uuid::Uuid;

/// Deterministic stand-in for an ONNX graph: each logit is a fixed
/// weighted sum of the input tensor.
pub struct MockNetwork {
    pub classes: usize,
}

impl Network for MockNetwork {
    fn forward(&self, input: &[f32], size: u32) -> Result<Vec<f32>, OnnxError> {
        let expected = 3 * (size as usize) * (size as usize);
        if input.len() != expected {
            return Err(OnnxError::InferenceFailed(format!(
                "expected {} values, got {}",
                expected,
                input.len()
            )));
        }
        let logits = (0..self.classes)
            .map(|c| {
                let sum: f32 = input
                    .iter()
                    .enumerate()
                    .map(|(j, v)| v * (((j * 31 + c * 17) % 11) as f32 / 11.0 - 0.5))
                    .sum();
                sum / input.len() as f32 + c as f32 * 0.1
            })
            .collect();
        Ok(logits)
    }

    fn output_classes(&self) -> Option<usize> {
        Some(self.classes)
    }
}

/// Reads a "graph" file whose only content is the declared class count.
pub struct MockLoader;

impl NetworkLoader for MockLoader {
    fn load(&self, graph: &Path) -> Result<Box<dyn Network>, CheckpointError> {
        let text = fs::read_to_string(graph)
            .map_err(|_| CheckpointError::Missing(graph.to_path_buf()))?;
        let classes = text.trim().parse().map_err(|_| CheckpointError::Malformed {
            path: graph.to_path_buf(),
            reason: format!("not a class count: {:?}", text),
        })?;
        Ok(Box::new(MockNetwork { classes }))
    }
}

/// `MockLoader` that remembers every graph path it was handed.
#[derive(Default)]
pub struct RecordingLoader {
    pub seen: Mutex<Vec<PathBuf>>,
}

impl NetworkLoader for RecordingLoader {
    fn load(&self, graph: &Path) -> Result<Box<dyn Network>, CheckpointError> {
        self.seen.lock().unwrap().push(graph.to_path_buf());
        MockLoader.load(graph)
    }
}

pub fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("medscan-{}-{}", tag, Uuid::new_v4()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

pub fn write_json(root: &Path, rel: &str, value: &Value) {
    write(root, rel, &value.to_string());
}

pub fn brain_manifest(input_size: Value, performance: Value) -> Value {
    json!({
        "model_config": {"class_names": ["glioma", "meningioma", "notumor", "pituitary"]},
        "preprocessing": {
            "input_size": input_size,
            "mean": [0.5, 0.5, 0.5],
            "std": [0.5, 0.5, 0.5]
        },
        "performance": performance
    })
}

/// A complete, valid checkpoint tree for all three kinds.
pub fn model_tree(tag: &str) -> PathBuf {
    let root = scratch_dir(tag);
    write(&root, "brain/brain_tumor_classifier_v2_improved.onnx", "4");
    write_json(
        &root,
        "brain/brain_tumor_classifier_v2_improved.json",
        &brain_manifest(json!([32, 32]), json!({"best_test_accuracy": 0.95})),
    );
    write(&root, "brain/brain_tumor_classifier_v1.onnx", "4");
    write_json(
        &root,
        "brain/brain_tumor_classifier_v1.json",
        &brain_manifest(json!(32), json!({"best_val_accuracy": 0.88})),
    );
    write(&root, "lungs/lung_cnn_checkpoint.onnx", "3");
    write_json(
        &root,
        "lungs/lung_cnn_checkpoint.json",
        &json!({
            "num_classes": 3,
            "input_size": 48,
            "normalize_mean": [0.485, 0.456, 0.406],
            "normalize_std": [0.229, 0.224, 0.225]
        }),
    );
    write_json(
        &root,
        "lungs/lung_class_names.json",
        &json!(["adenocarcinoma", "benign", "squamous_cell_carcinoma"]),
    );
    write(&root, "skin/skin_cnn_full_model.onnx", "2");
    write_json(&root, "skin/class_names.json", &json!(["benign", "malignant"]));
    root
}

pub fn sample_image(w: u32, h: u32) -> DynamicImage {
    let img = RgbImage::from_fn(w, h, |x, y| {
        Rgb([
            (x * 255 / w.max(1)) as u8,
            (y * 255 / h.max(1)) as u8,
            ((x + y) % 256) as u8,
        ])
    });
    DynamicImage::ImageRgb8(img)
}

pub fn png_bytes(img: &DynamicImage) -> Vec<u8> {
    let mut out = std::io::Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageOutputFormat::Png).unwrap();
    out.into_inner()
}
