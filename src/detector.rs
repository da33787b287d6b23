//! Zero-shot plate detection.
//!
//! The production detector runs an OWLv2 ONNX export: text queries for the
//! candidate labels are scored against every image patch, and each patch
//! predicts one box.

use crate::error::PlateError;
use crate::types::{BoundingBox, Detection};
use image::imageops::FilterType;
use image::DynamicImage;
use log::{debug, info, warn};
use ndarray::{Array2, Array4, ArrayView2, Axis, Ix2};
use once_cell::sync::OnceCell;
use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{RunOptions, Session};
use ort::value::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokenizers::Tokenizer;

pub const CANDIDATE_LABELS: [&str; 2] = ["license plate", "vehicle registration plate"];
pub const DEFAULT_THRESHOLD: f32 = 0.1;

const INPUT_SIZE: u32 = 960;
const MAX_QUERY_TOKENS: usize = 16;
const PAD_TOKEN_ID: i64 = 0;
const PAD_VALUE: f32 = 0.5;
const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];
const ARENA_SHRINKAGE_KEY: &str = "memory.enable_memory_arena_shrinkage";

/// Open-vocabulary object detector. Implementations are loaded once and
/// shared read-only between requests.
pub trait ZeroShotDetector: Send + Sync {
    fn detect(&self, image: &DynamicImage, labels: &[&str]) -> Result<Vec<Detection>, PlateError>;

    /// Frees accelerator memory cached between inferences, if the backend keeps any.
    fn release_cache(&self) {}
}

struct OwlModel {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    on_gpu: bool,
}

pub struct OwlDetector {
    model_path: PathBuf,
    tokenizer_path: PathBuf,
    threshold: f32,
    model: OnceCell<OwlModel>,
    shrink_requested: AtomicBool,
}

impl OwlDetector {
    /// Checks that the model files exist; the session itself is built on first use.
    pub fn new(
        model_path: PathBuf,
        tokenizer_path: PathBuf,
        threshold: f32,
    ) -> Result<Self, failure::Error> {
        for path in [&model_path, &tokenizer_path] {
            if !path.exists() {
                return Err(format_err!("Detector file not found: {}", path.display()));
            }
        }
        Ok(OwlDetector {
            model_path,
            tokenizer_path,
            threshold: threshold.clamp(0.0, 1.0),
            model: OnceCell::new(),
            shrink_requested: AtomicBool::new(false),
        })
    }

    fn model(&self) -> Result<&OwlModel, PlateError> {
        self.model
            .get_or_try_init(|| load_model(&self.model_path, &self.tokenizer_path))
            .map_err(|e| PlateError::Detection(e.to_string()))
    }

    /// Consumes a pending cache release, so only the next inference carries it.
    fn take_shrink_request(&self) -> bool {
        self.shrink_requested.swap(false, Ordering::AcqRel)
    }

    fn encode_queries(
        tokenizer: &Tokenizer,
        labels: &[&str],
    ) -> Result<(Array2<i64>, Array2<i64>), PlateError> {
        let mut ids = Array2::from_elem((labels.len(), MAX_QUERY_TOKENS), PAD_TOKEN_ID);
        let mut mask = Array2::zeros((labels.len(), MAX_QUERY_TOKENS));
        for (row, label) in labels.iter().enumerate() {
            let encoding = tokenizer.encode(*label, true).map_err(|e| {
                PlateError::Detection(format!("Failed to tokenize {:?}: {}", label, e))
            })?;
            for (col, &id) in encoding.get_ids().iter().take(MAX_QUERY_TOKENS).enumerate() {
                ids[[row, col]] = id as i64;
                mask[[row, col]] = 1;
            }
        }
        Ok((ids, mask))
    }
}

impl ZeroShotDetector for OwlDetector {
    fn detect(&self, image: &DynamicImage, labels: &[&str]) -> Result<Vec<Detection>, PlateError> {
        let model = self.model()?;
        let (input_ids, attention_mask) = Self::encode_queries(&model.tokenizer, labels)?;
        let pixels = preprocess(image);
        let side = image.width().max(image.height()) as f32;
        debug!("Running detector on {}x{} image", image.width(), image.height());

        let input_ids = Value::from_array(input_ids).map_err(detection_error)?;
        let pixel_values = Value::from_array(pixels).map_err(detection_error)?;
        let attention_mask = Value::from_array(attention_mask).map_err(detection_error)?;

        let inputs = ort::inputs![
            "input_ids" => input_ids,
            "pixel_values" => pixel_values,
            "attention_mask" => attention_mask
        ];
        let run_options = if self.take_shrink_request() {
            let devices = arena_devices(model.on_gpu);
            debug!("Shrinking memory arenas {} after this inference", devices);
            Some(shrink_run_options(devices).map_err(detection_error)?)
        } else {
            None
        };

        let mut session = model
            .session
            .lock()
            .map_err(|_| PlateError::Detection("Detector session lock poisoned".to_string()))?;
        let outputs = match &run_options {
            Some(options) => session.run_with_options(inputs, options),
            None => session.run(inputs),
        }
        .map_err(|e| PlateError::Detection(format!("Inference failed: {}", e)))?;

        let output = |name: &str| {
            outputs.get(name).ok_or_else(|| {
                PlateError::Detection(format!("Detector produced no {} output", name))
            })
        };
        let logits = output("logits")?
            .try_extract_array::<f32>()
            .map_err(detection_error)?;
        let boxes = output("pred_boxes")?
            .try_extract_array::<f32>()
            .map_err(detection_error)?;
        let logits = logits
            .index_axis(Axis(0), 0)
            .into_dimensionality::<Ix2>()
            .map_err(|e| PlateError::Detection(format!("Unexpected logits shape: {}", e)))?;
        let boxes = boxes
            .index_axis(Axis(0), 0)
            .into_dimensionality::<Ix2>()
            .map_err(|e| PlateError::Detection(format!("Unexpected box shape: {}", e)))?;

        Ok(decode_predictions(logits, boxes, labels, side, self.threshold))
    }

    /// ONNX Runtime can only shrink its arenas at the end of a run, so the
    /// release is carried out by the next inference.
    fn release_cache(&self) {
        self.shrink_requested.store(true, Ordering::Release);
    }
}

/// Arena-backed devices the session allocates on.
fn arena_devices(on_gpu: bool) -> &'static str {
    if on_gpu {
        "cpu:0;gpu:0"
    } else {
        "cpu:0"
    }
}

fn shrink_run_options(devices: &str) -> ort::Result<RunOptions> {
    let mut options = RunOptions::new()?;
    options.add_config_entry(ARENA_SHRINKAGE_KEY, devices)?;
    Ok(options)
}

fn detection_error(e: impl std::fmt::Display) -> PlateError {
    PlateError::Detection(e.to_string())
}

fn load_model(model_path: &Path, tokenizer_path: &Path) -> Result<OwlModel, failure::Error> {
    info!("Loading detector from {}", model_path.display());
    let mut builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let on_gpu = match CUDAExecutionProvider::default().register(&mut builder) {
        Ok(()) => true,
        Err(e) => {
            info!("CUDA unavailable, detector runs on CPU: {}", e);
            false
        }
    };
    let session = builder.commit_from_file(model_path)?;
    let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(|e| {
        format_err!("Failed to load tokenizer {}: {}", tokenizer_path.display(), e)
    })?;
    for input in ["input_ids", "pixel_values", "attention_mask"] {
        if !session.inputs.iter().any(|i| i.name == input) {
            warn!("Detector model has no input named {}", input);
        }
    }
    info!("Detector loaded ({})", if on_gpu { "CUDA" } else { "CPU" });
    Ok(OwlModel {
        session: Mutex::new(session),
        tokenizer,
        on_gpu,
    })
}

/// Lays the image out as OWLv2 expects: padded to a square at the bottom and
/// right, scaled to `INPUT_SIZE`, CLIP-normalised, NCHW.
fn preprocess(image: &DynamicImage) -> Array4<f32> {
    let size = INPUT_SIZE as usize;
    let (width, height) = (image.width(), image.height());
    let scale = INPUT_SIZE as f32 / width.max(height).max(1) as f32;
    let scaled_w = ((width as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
    let scaled_h = ((height as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
    let resized = image
        .resize_exact(scaled_w, scaled_h, FilterType::Triangle)
        .to_rgb8();

    let mut tensor = Array4::zeros((1, 3, size, size));
    for c in 0..3 {
        let pad = (PAD_VALUE - CLIP_MEAN[c]) / CLIP_STD[c];
        tensor.index_axis_mut(Axis(1), c).fill(pad);
    }
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            let value = pixel.0[c] as f32 / 255.0;
            tensor[[0, c, y as usize, x as usize]] = (value - CLIP_MEAN[c]) / CLIP_STD[c];
        }
    }
    tensor
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Turns per-patch query logits (`patches x queries`) and `(cx, cy, w, h)`
/// boxes normalised to the padded square into pixel-space detections.
fn decode_predictions(
    logits: ArrayView2<f32>,
    boxes: ArrayView2<f32>,
    labels: &[&str],
    side: f32,
    threshold: f32,
) -> Vec<Detection> {
    let mut detections = Vec::new();
    for (patch, row) in logits.outer_iter().enumerate() {
        let best = row
            .iter()
            .enumerate()
            .filter(|(_, logit)| !logit.is_nan())
            .fold(None, |best: Option<(usize, f32)>, (q, &logit)| match best {
                Some((_, b)) if logit <= b => best,
                _ => Some((q, logit)),
            });
        let (query, logit) = match best {
            Some(b) => b,
            None => continue,
        };
        let score = sigmoid(logit);
        if score <= threshold {
            continue;
        }
        let b = boxes.row(patch);
        let (cx, cy, w, h) = (b[0], b[1], b[2], b[3]);
        detections.push(Detection {
            bbox: BoundingBox::from_corners(
                (cx - w / 2.0) * side,
                (cy - h / 2.0) * side,
                (cx + w / 2.0) * side,
                (cy + h / 2.0) * side,
            ),
            score,
            label: labels.get(query).unwrap_or(&"").to_string(),
        });
    }
    detections
}
