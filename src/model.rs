//! Model Contracts
//! Mission: Isolate the core from concrete ML runtimes behind narrow traits

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::al::training_config::TrainingConfig;

/// One class probability from the classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub confidence: f64,
}

/// Production image classifier. Implementations map an RGB image to a
/// probability distribution over the fixed label set, highest first.
pub trait Classifier: Send + Sync {
    fn predict(&self, image: &DynamicImage) -> Vec<Prediction>;
}

/// Image quality gate.
pub trait BlurScorer: Send + Sync {
    /// Sharpness score; higher is sharper.
    fn score(&self, image: &DynamicImage) -> f64;
}

/// Embedding function used by herding selection. Trained model up to its
/// penultimate layer in production; anything deterministic in tests.
pub trait EmbeddingExtractor: Send + Sync {
    fn embed(&self, image_path: &Path) -> Result<Vec<f32>>;
}

/// One labeled training sample.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TrainSample {
    pub image_path: PathBuf,
    pub class_index: usize,
}

/// Everything a training backend needs to run one job.
#[derive(Debug, Clone)]
pub struct TrainJob {
    pub architecture: String,
    pub config: TrainingConfig,
    pub device: String,
    pub train: Vec<TrainSample>,
    pub val: Vec<TrainSample>,
    /// Checkpoint to warm-start from; `None` means pretrained-from-scratch.
    pub base_weights: Option<PathBuf>,
    /// Where the backend must write the final weights.
    pub output_path: PathBuf,
}

/// Per-epoch training record, persisted verbatim in `training_log.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
}

/// Outcome of a completed training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainReport {
    pub epochs: Vec<EpochRecord>,
    pub best_val_accuracy: f64,
    pub best_val_loss: f64,
    pub weights_path: PathBuf,
}

/// Training backend lifecycle. The retrainer owns everything else: dataset
/// assembly, splitting, registration, and event logging.
pub trait TrainerBackend: Send + Sync {
    fn train(&self, job: &TrainJob) -> Result<TrainReport>;

    /// Whether an accelerator device can be used. `auto` device preference
    /// resolves through this.
    fn accelerator_available(&self) -> bool {
        false
    }
}

/// Inference wrapper. Runs in dummy mode when no classifier is wired in,
/// mirroring how the server behaves before any model has been deployed.
pub struct ModelService {
    classifier: Option<Arc<dyn Classifier>>,
}

impl ModelService {
    pub fn new(classifier: Option<Arc<dyn Classifier>>) -> Self {
        Self { classifier }
    }

    pub fn dummy() -> Self {
        Self { classifier: None }
    }

    pub fn is_loaded(&self) -> bool {
        self.classifier.is_some()
    }

    pub fn predict(&self, image: &DynamicImage) -> Vec<Prediction> {
        match &self.classifier {
            Some(classifier) => classifier.predict(image),
            None => vec![Prediction {
                label: "unavailable".to_string(),
                confidence: 0.0,
            }],
        }
    }
}

/// Variance-of-Laplacian sharpness score over the luma plane.
pub struct LaplacianBlurScorer;

impl BlurScorer for LaplacianBlurScorer {
    fn score(&self, image: &DynamicImage) -> f64 {
        let gray = image.to_luma8();
        let (w, h) = gray.dimensions();
        if w < 3 || h < 3 {
            return 0.0;
        }

        let px = |x: u32, y: u32| gray.get_pixel(x, y).0[0] as f64;

        let mut responses = Vec::with_capacity(((w - 2) * (h - 2)) as usize);
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let lap =
                    px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1) - 4.0 * px(x, y);
                responses.push(lap);
            }
        }

        let n = responses.len() as f64;
        let mean = responses.iter().sum::<f64>() / n;
        responses.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n
    }
}
