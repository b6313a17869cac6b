// ============================================================================
// MedScan CLI - classify scans and inspect the model registry from a shell
// ============================================================================
//
// Usage examples:
//   medscan predict --kind brain -i scan.png
//   medscan predict -k skin -i "lesions/*.jpg" --json
//   medscan models --brain
//   medscan health --ort /opt/onnxruntime/lib/libonnxruntime.so
//   medscan preprocess -i "mri/*.png" --output-dir parity/ --save-mask
//
// Predictions and preprocessing fan out over inputs with rayon; the model
// registry is loaded once and shared read-only.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use rayon::prelude::*;
use serde_json::json;

use crate::io::{load_image, save_png};
use crate::model::{CancerKind, Dispatcher, ModelRegistry, Prediction};
use crate::onnx::{Device, OnnxLoader, OrtRuntime, resolve_path};
use crate::ops::brain::BrainPipeline;
use crate::settings::Settings;
use crate::{log_err, log_info};

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// MedScan cancer image classifier.
#[derive(Parser, Debug)]
#[command(
    name = "medscan",
    about = "Brain, lung and skin cancer image classification",
    long_about = "Classify medical images with the brain tumor, lung cancer and skin\n\
                  cancer models. Brain MRIs go through bias correction, CLAHE, gamma,\n\
                  denoising and skull stripping before inference.\n\n\
                  Example:\n  \
                  medscan predict --kind brain -i scan.png\n  \
                  medscan models"
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Checkpoint root containing brain/, lungs/ and skin/.
    #[arg(long, global = true, value_name = "DIR")]
    pub model_dir: Option<PathBuf>,

    /// ONNX Runtime shared library (onnxruntime.dll / libonnxruntime.so).
    #[arg(long, global = true, value_name = "LIB")]
    pub ort: Option<PathBuf>,

    /// Execution device: cpu, cuda or cuda:N.
    #[arg(long, global = true, value_name = "DEVICE")]
    pub device: Option<Device>,

    /// Mirror the session log to stderr.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Classify one or more images.
    Predict {
        /// brain, lung or skin
        #[arg(short, long)]
        kind: CancerKind,

        /// Input file(s). Glob patterns accepted (e.g. "scans/*.png").
        #[arg(short, long, required = true, num_args = 1..)]
        input: Vec<String>,

        /// Print results as a JSON array.
        #[arg(long)]
        json: bool,
    },
    /// List loaded models as JSON.
    Models {
        /// Print the detailed brain model record instead.
        #[arg(long)]
        brain: bool,
    },
    /// Print service health as JSON.
    Health,
    /// Run brain MRI preprocessing only and write the network input as PNG.
    Preprocess {
        #[arg(short, long, required = true, num_args = 1..)]
        input: Vec<String>,

        #[arg(long, value_name = "DIR")]
        output_dir: PathBuf,

        /// Also write the brain mask next to each output.
        #[arg(long)]
        save_mask: bool,
    },
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run the selected command and return an OS exit code.
/// `0` = everything succeeded, `1` = something failed.
pub fn run(args: CliArgs) -> ExitCode {
    crate::logger::set_echo(args.verbose);

    let mut settings = Settings::load();
    if let Some(dir) = args.model_dir {
        settings.model_dir = dir;
    }
    if let Some(ort) = args.ort {
        settings.onnx_runtime_path = ort.display().to_string();
    }
    if let Some(device) = args.device {
        settings.device = device;
    }

    match args.command {
        Command::Preprocess {
            input,
            output_dir,
            save_mask,
        } => run_preprocess(&input, &output_dir, save_mask),
        Command::Health => {
            let dispatcher = build_dispatcher(&settings);
            print_json(&dispatcher.health())
        }
        Command::Models { brain } => {
            let dispatcher = build_dispatcher(&settings);
            if brain {
                match dispatcher.registry().brain_info() {
                    Some(info) => print_json(&info),
                    None => {
                        eprintln!(
                            "error: {}",
                            dispatcher
                                .registry()
                                .unavailable_reason(CancerKind::Brain)
                                .unwrap_or("brain model not loaded")
                        );
                        ExitCode::FAILURE
                    }
                }
            } else {
                print_json(&dispatcher.registry().list_models())
            }
        }
        Command::Predict { kind, input, json } => {
            let dispatcher = build_dispatcher(&settings);
            run_predict(&dispatcher, kind, &input, json)
        }
    }
}

/// Bring up the ONNX runtime and load every model. A runtime that cannot
/// be loaded leaves all three kinds unavailable instead of aborting.
pub fn build_dispatcher(settings: &Settings) -> Dispatcher {
    let root = resolve_path(&settings.model_dir);
    let registry = if settings.onnx_runtime_path.is_empty() {
        unavailable_registry("ONNX Runtime library not configured (use --ort or MEDSCAN_ORT_PATH)")
    } else {
        match OrtRuntime::load(&resolve_path(Path::new(&settings.onnx_runtime_path))) {
            Ok(runtime) => {
                let loader = OnnxLoader::new(runtime, settings.device, settings.intra_op_threads);
                ModelRegistry::load(&root, &loader)
            }
            Err(e) => {
                log_err!("ONNX Runtime unavailable: {}", e);
                unavailable_registry(&e.to_string())
            }
        }
    };
    Dispatcher::new(Arc::new(registry), settings.device)
}

fn unavailable_registry(reason: &str) -> ModelRegistry {
    CancerKind::ALL
        .into_iter()
        .fold(ModelRegistry::builder(), |b, kind| b.unavailable(kind, reason))
        .build()
}

// ============================================================================
// Commands
// ============================================================================

fn run_predict(
    dispatcher: &Dispatcher,
    kind: CancerKind,
    patterns: &[String],
    json: bool,
) -> ExitCode {
    let inputs = resolve_inputs(patterns);
    if inputs.is_empty() {
        eprintln!("error: no input files matched the given pattern(s).");
        return ExitCode::FAILURE;
    }

    let start = Instant::now();
    let results: Vec<(PathBuf, Result<Prediction, String>)> = inputs
        .into_par_iter()
        .map(|path| {
            let outcome = dispatcher
                .predict_file(kind, &path)
                .map_err(|e| e.to_string());
            (path, outcome)
        })
        .collect();
    log_info!(
        "{} {} prediction(s) in {:.0}ms",
        results.len(),
        kind,
        start.elapsed().as_secs_f64() * 1000.0
    );

    let any_failure = results.iter().any(|(_, r)| r.is_err());
    if json {
        let rows: Vec<serde_json::Value> = results
            .iter()
            .map(|(path, outcome)| match outcome {
                Ok(p) => json!({ "file": path.display().to_string(), "prediction": p }),
                Err(e) => json!({ "file": path.display().to_string(), "error": e }),
            })
            .collect();
        let printed = print_json(&rows);
        if any_failure {
            return ExitCode::FAILURE;
        }
        return printed;
    } else {
        for (path, outcome) in &results {
            match outcome {
                Ok(p) => {
                    println!("{}: {} ({:.2}%)", path.display(), p.predicted_class, p.confidence);
                    for fallback in &p.fallbacks {
                        println!("  note: {}", fallback);
                    }
                }
                Err(e) => eprintln!("{}: error: {}", path.display(), e),
            }
        }
    }

    if any_failure { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}

fn run_preprocess(patterns: &[String], output_dir: &Path, save_mask: bool) -> ExitCode {
    let inputs = resolve_inputs(patterns);
    if inputs.is_empty() {
        eprintln!("error: no input files matched the given pattern(s).");
        return ExitCode::FAILURE;
    }
    if let Err(e) = std::fs::create_dir_all(output_dir) {
        eprintln!(
            "error: could not create output directory '{}': {}",
            output_dir.display(),
            e
        );
        return ExitCode::FAILURE;
    }

    let pipeline = BrainPipeline::default();
    let failures = inputs
        .par_iter()
        .filter(|path| {
            match preprocess_one(&pipeline, path, output_dir, save_mask) {
                Ok(out) => {
                    println!("{} → {}", path.display(), out.display());
                    false
                }
                Err(e) => {
                    eprintln!("{}: error: {}", path.display(), e);
                    true
                }
            }
        })
        .count();

    if failures > 0 { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}

fn preprocess_one(
    pipeline: &BrainPipeline,
    input: &Path,
    output_dir: &Path,
    save_mask: bool,
) -> Result<PathBuf, String> {
    let img = load_image(input).map_err(|e| format!("load failed: {}", e))?;
    let pre = pipeline.run(&img);
    for fallback in &pre.fallbacks {
        eprintln!("{}: note: {}", input.display(), fallback);
    }

    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| "input has no file name".to_string())?;
    let out = output_dir.join(format!("{}_preprocessed.png", stem));
    save_png(&image::DynamicImage::ImageRgb8(pre.image), &out)
        .map_err(|e| format!("save failed: {}", e))?;
    if save_mask {
        let mask_path = output_dir.join(format!("{}_mask.png", stem));
        save_png(&image::DynamicImage::ImageLuma8(pre.mask), &mask_path)
            .map_err(|e| format!("save failed: {}", e))?;
    }
    Ok(out)
}

// ============================================================================
// Helpers
// ============================================================================

fn print_json<T: serde::Serialize>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(text) => {
            println!("{}", text);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: could not serialize output: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Expand glob patterns and literal paths into a deduplicated, ordered list.
fn resolve_inputs(patterns: &[String]) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = Vec::new();

    for pattern in patterns {
        let as_path = Path::new(pattern);

        if as_path.exists() {
            if !result.iter().any(|p| p.as_path() == as_path) {
                result.push(as_path.to_path_buf());
            }
            continue;
        }

        match glob::glob(pattern) {
            Ok(entries) => {
                let mut matched = false;
                for entry in entries.flatten() {
                    if !result.contains(&entry) {
                        result.push(entry);
                    }
                    matched = true;
                }
                if !matched {
                    eprintln!("warning: pattern '{}' matched no files.", pattern);
                }
            }
            Err(e) => {
                eprintln!("warning: invalid glob '{}': {}", pattern, e);
            }
        }
    }

    result
}
