//! Retraining Orchestrator
//! Mission: Assemble datasets, drive the trainer backend, register the result

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::config::{label_index, Architecture, Settings};
use crate::fsio;
use crate::model::{EmbeddingExtractor, TrainJob, TrainSample, TrainerBackend};
use crate::al::events::EventLog;
use crate::al::labels::LabelPool;
use crate::al::registry::{ModelRegistry, ModelStatus};
use crate::al::replay::{self, ReplayConfig, ReplaySummary};
use crate::al::training_config::{TrainingConfig, TrainingConfigStore};
use crate::storage::CaseStore;

/// Caller-facing retrain request.
#[derive(Debug, Clone, Default)]
pub struct RetrainOptions {
    pub architecture: Option<String>,
    /// Partial training-config override; already validated at the boundary.
    pub config_patch: Option<Map<String, Value>>,
    pub output_dir: Option<PathBuf>,
    /// Pre-allocated version id, so an async trigger can return it before
    /// the round starts. Allocated here when absent.
    pub version_id: Option<String>,
}

/// Machine-readable failure reasons, mapped to HTTP kinds at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrainFailure {
    UnknownArchitecture,
    TrainerUnavailable,
    InsufficientLabels,
    TrainingFailed,
}

/// Structured retrain result.
#[derive(Debug, Clone, Serialize)]
pub struct RetrainOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RetrainFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Map<String, Value>>,
    pub samples_used: usize,
}

impl RetrainOutcome {
    fn failure(reason: RetrainFailure, message: impl Into<String>) -> Self {
        Self {
            success: false,
            version_id: None,
            reason: Some(reason),
            message: Some(message.into()),
            metrics: None,
            samples_used: 0,
        }
    }
}

/// Orchestrates one retraining round end to end. Training itself happens in
/// the injected backend; everything around it — dataset assembly, replay,
/// registration, label accounting, events — lives here.
pub struct Retrainer {
    settings: Arc<Settings>,
    case_store: Arc<CaseStore>,
    label_pool: Arc<LabelPool>,
    registry: Arc<ModelRegistry>,
    events: Arc<EventLog>,
    config_store: Arc<TrainingConfigStore>,
    trainer: Option<Arc<dyn TrainerBackend>>,
    embedder: Option<Arc<dyn EmbeddingExtractor>>,
}

impl Retrainer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<Settings>,
        case_store: Arc<CaseStore>,
        label_pool: Arc<LabelPool>,
        registry: Arc<ModelRegistry>,
        events: Arc<EventLog>,
        config_store: Arc<TrainingConfigStore>,
        trainer: Option<Arc<dyn TrainerBackend>>,
        embedder: Option<Arc<dyn EmbeddingExtractor>>,
    ) -> Self {
        Self {
            settings,
            case_store,
            label_pool,
            registry,
            events,
            config_store,
            trainer,
            embedder,
        }
    }

    pub fn trainer_available(&self) -> bool {
        self.trainer.is_some()
    }

    /// Run one retraining round. Failures before the training phase return a
    /// structured outcome without touching the registry; failures inside it
    /// leave a `failed` registry entry behind.
    pub fn retrain(&self, options: &RetrainOptions) -> Result<RetrainOutcome> {
        let arch_name = options
            .architecture
            .clone()
            .unwrap_or_else(|| self.settings.default_architecture.clone());
        let Some(architecture) = Architecture::from_str(&arch_name) else {
            return Ok(RetrainOutcome::failure(
                RetrainFailure::UnknownArchitecture,
                format!("unknown architecture '{arch_name}'"),
            ));
        };

        let Some(trainer) = self.trainer.clone() else {
            return Ok(RetrainOutcome::failure(
                RetrainFailure::TrainerUnavailable,
                "no training backend is configured",
            ));
        };

        // New labeled samples, with the cases they came from.
        let (new_samples, case_ids) = self.collect_new_samples();
        if new_samples.len() < self.settings.retrain_min_new_labels {
            return Ok(RetrainOutcome::failure(
                RetrainFailure::InsufficientLabels,
                format!(
                    "{} labeled samples available, {} required",
                    new_samples.len(),
                    self.settings.retrain_min_new_labels
                ),
            ));
        }

        let version_id = options
            .version_id
            .clone()
            .unwrap_or_else(|| self.registry.generate_version_id());
        let config = self.merged_config(options);
        let config_json = serde_json::to_value(&config).unwrap_or_else(|_| json!({}));

        let candidate_dir = options
            .output_dir
            .clone()
            .unwrap_or_else(|| self.settings.al_candidates_dir().join(&version_id));
        let weights_name = format!(
            "[{}] - {}.pt",
            Utc::now().format("%Y-%m-%d"),
            architecture.as_str()
        );
        let weights_path = candidate_dir.join(&weights_name);

        let (base_weights, base_ref) = self.resolve_base_model(architecture);
        self.registry.register_model(
            &version_id,
            base_ref.as_deref(),
            config_json.clone(),
            weights_path.clone(),
            ModelStatus::Training,
        )?;
        self.events.log_training_started(&version_id, &config_json)?;

        let device = self.resolve_device(trainer.as_ref());

        // Experience replay from the historical pool.
        let (replay_samples, replay_summary) = self.select_replay(&new_samples);

        let mut combined = new_samples.clone();
        combined.extend(replay_samples);
        let (train, val) = stratified_split(
            combined,
            self.settings.split_train_ratio,
            self.settings.split_seed,
        );
        let samples_used = new_samples.len();

        info!(
            "🧠 Training {version_id} ({}) on {} train / {} val samples (device: {device})",
            architecture.as_str(),
            train.len(),
            val.len()
        );

        let job = TrainJob {
            architecture: architecture.as_str().to_string(),
            config: config.clone(),
            device,
            train: train.clone(),
            val: val.clone(),
            base_weights,
            output_path: weights_path.clone(),
        };

        let report = match trainer.train(&job) {
            Ok(report) => report,
            Err(err) => {
                let message = format!("{err:#}");
                warn!("training failed for {version_id}: {message}");
                self.events.log_training_failed(&version_id, &message)?;
                self.registry.update_status(&version_id, ModelStatus::Failed)?;
                return Ok(RetrainOutcome {
                    version_id: Some(version_id),
                    ..RetrainOutcome::failure(RetrainFailure::TrainingFailed, message)
                });
            }
        };

        // Per-epoch log next to the weights.
        let training_log = json!({
            "version_id": &version_id,
            "architecture": architecture.as_str(),
            "config": &config_json,
            "epochs": &report.epochs,
            "replay": &replay_summary,
        });
        fsio::atomic_write(
            &candidate_dir.join("training_log.json"),
            serde_json::to_string_pretty(&training_log)
                .context("serialize training log")?
                .as_bytes(),
        )?;

        let mut metrics = Map::new();
        metrics.insert("val_accuracy".into(), json!(report.best_val_accuracy));
        metrics.insert("val_loss".into(), json!(report.best_val_loss));
        metrics.insert("samples_used".into(), json!(samples_used));
        metrics.insert("train_samples".into(), json!(train.len()));
        metrics.insert("val_samples".into(), json!(val.len()));
        metrics.insert("epochs_run".into(), json!(report.epochs.len()));
        metrics.insert(
            "replay".into(),
            serde_json::to_value(&replay_summary).unwrap_or_else(|_| json!({})),
        );

        self.registry.finish_training(
            &version_id,
            report.weights_path.clone(),
            metrics.clone(),
            architecture.as_str(),
            ModelStatus::Evaluating,
        )?;

        if !case_ids.is_empty() {
            self.label_pool.mark_used(&version_id, Some(&case_ids))?;
        }

        self.events
            .log_training_completed(&version_id, report.best_val_accuracy, samples_used)?;
        info!("✅ Training completed for {version_id}");

        Ok(RetrainOutcome {
            success: true,
            version_id: Some(version_id),
            reason: None,
            message: None,
            metrics: Some(metrics),
            samples_used,
        })
    }

    /// Labeled samples for this round: the label pool first, falling back to
    /// the legacy reject-entry ledger scan. Unknown labels and missing files
    /// are filtered out.
    fn collect_new_samples(&self) -> (Vec<TrainSample>, Vec<String>) {
        let mut samples = Vec::new();
        let mut case_ids = BTreeSet::new();

        let pool_labels = self.label_pool.get_labels_for_training();
        if !pool_labels.is_empty() {
            for label in pool_labels {
                let Some(class_index) = label_index(&label.label) else {
                    continue;
                };
                let path = self.settings.storage_root.join(&label.image_path);
                if !path.is_file() {
                    continue;
                }
                samples.push(TrainSample {
                    image_path: path,
                    class_index,
                });
                case_ids.insert(label.case_id);
            }
        } else {
            for (path, label) in self.case_store.collect_rejected_labeled_samples() {
                let Some(class_index) = label_index(&label) else {
                    continue;
                };
                if !path.is_file() {
                    continue;
                }
                samples.push(TrainSample {
                    image_path: path,
                    class_index,
                });
            }
        }

        (samples, case_ids.into_iter().collect())
    }

    fn merged_config(&self, options: &RetrainOptions) -> TrainingConfig {
        let persisted = self.config_store.load();
        let Some(patch) = &options.config_patch else {
            return persisted;
        };
        let mut merged = match serde_json::to_value(&persisted) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        for (key, value) in patch {
            merged.insert(key.clone(), value.clone());
        }
        serde_json::from_value(Value::Object(merged)).unwrap_or(persisted)
    }

    fn resolve_device(&self, trainer: &dyn TrainerBackend) -> String {
        match self.settings.retrain_device.as_str() {
            "cpu" => "cpu".to_string(),
            "auto" => {
                if trainer.accelerator_available() {
                    "accelerator".to_string()
                } else {
                    "cpu".to_string()
                }
            }
            _ => "accelerator".to_string(),
        }
    }

    /// Warm-start checkpoint selection. The default policy always starts from
    /// the architecture's base checkpoint; the warm-start policy prefers the
    /// production model when its architecture matches.
    fn resolve_base_model(&self, architecture: Architecture) -> (Option<PathBuf>, Option<String>) {
        let base = self
            .settings
            .base_model_path(architecture.as_str())
            .filter(|p| p.is_file())
            .map(Path::to_path_buf);

        if !self.settings.force_base_model_only {
            if let Some(prod) = self.registry.get_production_model() {
                if prod.entry.architecture.as_deref() == Some(architecture.as_str()) {
                    let path = prod
                        .entry
                        .production_path
                        .clone()
                        .unwrap_or_else(|| prod.entry.path.clone());
                    if path.is_file() {
                        return (Some(path), Some(prod.version_id));
                    }
                }
            }
        }

        match base {
            Some(path) => (Some(path), Some("base".to_string())),
            // Backend falls back to a freshly pretrained network.
            None => (None, None),
        }
    }

    fn select_replay(&self, _new_samples: &[TrainSample]) -> (Vec<TrainSample>, ReplaySummary) {
        if !self.settings.replay_enabled {
            return (Vec::new(), ReplaySummary::default());
        }
        let Some(embedder) = self.embedder.clone() else {
            return (Vec::new(), ReplaySummary::default());
        };

        let pool = self.load_historical_pool();
        if pool.is_empty() {
            return (Vec::new(), ReplaySummary::default());
        }

        let selection = replay::select_replay_samples(
            &pool,
            embedder.as_ref(),
            &ReplayConfig {
                quota: self.settings.replay_quota,
                herding_ratio: self.settings.replay_herding_ratio,
                random_ratio: self.settings.replay_random_ratio,
                seed: self.settings.replay_seed,
            },
        );
        (selection.samples, selection.summary)
    }

    /// Historical pool: CSV manifest rows resolved against the old dataset
    /// directory. Rows with unknown labels or missing image files are
    /// skipped.
    fn load_historical_pool(&self) -> Vec<TrainSample> {
        let csv_path = &self.settings.old_data_csv;
        if !csv_path.is_file() {
            return Vec::new();
        }
        let mut reader = match csv::Reader::from_path(csv_path) {
            Ok(reader) => reader,
            Err(err) => {
                warn!("failed to open replay manifest {}: {err}", csv_path.display());
                return Vec::new();
            }
        };

        let headers = match reader.headers() {
            Ok(headers) => headers.clone(),
            Err(_) => return Vec::new(),
        };
        let image_col = headers
            .iter()
            .position(|h| h == self.settings.old_data_csv_image_column);
        let label_col = headers
            .iter()
            .position(|h| h == self.settings.old_data_csv_label_column);
        let (Some(image_col), Some(label_col)) = (image_col, label_col) else {
            warn!("replay manifest is missing the image or label column");
            return Vec::new();
        };

        let mut pool = Vec::new();
        for record in reader.records().flatten() {
            let (Some(image_id), Some(label)) = (record.get(image_col), record.get(label_col))
            else {
                continue;
            };
            let Some(class_index) = label_index(label.trim()) else {
                continue;
            };
            let mut path = self.settings.old_dataset_dir.join(image_id.trim());
            if path.extension().is_none() {
                path.set_extension("jpg");
            }
            if path.is_file() {
                pool.push(TrainSample {
                    image_path: path,
                    class_index,
                });
            }
        }
        pool
    }
}

/// Stratified train/val split. Per class: shuffle (seeded), train takes the
/// configured share with a floor of one sample; single-sample classes stay
/// entirely in train. If the val side ends up empty while train holds at
/// least two samples, one moves over.
pub fn stratified_split(
    mut samples: Vec<TrainSample>,
    train_ratio: f64,
    seed: u64,
) -> (Vec<TrainSample>, Vec<TrainSample>) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    samples.shuffle(&mut rng);

    let mut by_class: std::collections::BTreeMap<usize, Vec<TrainSample>> =
        std::collections::BTreeMap::new();
    for sample in samples {
        by_class.entry(sample.class_index).or_default().push(sample);
    }

    let mut train = Vec::new();
    let mut val = Vec::new();
    for (_, members) in by_class {
        let n = members.len();
        if n == 1 {
            train.extend(members);
            continue;
        }
        let n_train = ((n as f64 * train_ratio).floor() as usize).clamp(1, n - 1);
        let mut members = members;
        let tail = members.split_off(n_train);
        train.extend(members);
        val.extend(tail);
    }

    if val.is_empty() && train.len() >= 2 {
        if let Some(moved) = train.pop() {
            val.push(moved);
        }
    }

    (train, val)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Crypto;
    use crate::model::{EpochRecord, TrainReport};
    use crate::al::events::EventType;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    struct MockTrainer {
        fail: AtomicBool,
        accuracy: f64,
    }

    impl MockTrainer {
        fn new(accuracy: f64) -> Self {
            Self {
                fail: AtomicBool::new(false),
                accuracy,
            }
        }
    }

    impl TrainerBackend for MockTrainer {
        fn train(&self, job: &TrainJob) -> Result<TrainReport> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("device lost");
            }
            std::fs::create_dir_all(job.output_path.parent().unwrap())?;
            std::fs::write(&job.output_path, b"weights")?;
            let epochs = (1..=job.config.epochs as usize)
                .map(|epoch| EpochRecord {
                    epoch,
                    train_loss: 1.0 / epoch as f64,
                    train_accuracy: self.accuracy - 0.05,
                    val_loss: 1.2 / epoch as f64,
                    val_accuracy: self.accuracy,
                })
                .collect();
            Ok(TrainReport {
                epochs,
                best_val_accuracy: self.accuracy,
                best_val_loss: 1.2 / job.config.epochs as f64,
                weights_path: job.output_path.clone(),
            })
        }
    }

    struct Harness {
        retrainer: Retrainer,
        pool: Arc<LabelPool>,
        registry: Arc<ModelRegistry>,
        events: Arc<EventLog>,
        settings: Arc<Settings>,
        _dir: TempDir,
    }

    fn harness(trainer: Option<Arc<dyn TrainerBackend>>, min_labels: usize) -> Harness {
        let dir = TempDir::new().unwrap();
        let mut settings =
            Settings::defaults_at(dir.path().join("storage"), dir.path().join("AL"));
        settings.retrain_min_new_labels = min_labels;
        settings.replay_enabled = false;
        let settings = Arc::new(settings);

        let crypto = Arc::new(Crypto::disabled());
        let case_store = Arc::new(CaseStore::new(settings.clone(), crypto));
        let pool = Arc::new(LabelPool::new(settings.labels_pool_file()));
        let registry = Arc::new(ModelRegistry::new(settings.clone()));
        let events = Arc::new(EventLog::new(settings.event_log_file()));
        let config_store = Arc::new(TrainingConfigStore::new(settings.active_config_file()));

        let retrainer = Retrainer::new(
            settings.clone(),
            case_store,
            pool.clone(),
            registry.clone(),
            events.clone(),
            config_store,
            trainer,
            None,
        );
        Harness {
            retrainer,
            pool,
            registry,
            events,
            settings,
            _dir: dir,
        }
    }

    fn seed_labels(h: &Harness, count: usize) {
        for i in 0..count {
            let rel = format!("alice/img_{i:03}.jpg");
            let abs = h.settings.storage_root.join(&rel);
            std::fs::create_dir_all(abs.parent().unwrap()).unwrap();
            std::fs::write(&abs, b"jpeg").unwrap();
            h.pool
                .add_label(
                    &format!("{}", 10_000 + i),
                    vec![rel],
                    if i % 2 == 0 { "mel" } else { "nv" },
                    "doc1",
                )
                .unwrap();
        }
    }

    #[test]
    fn test_unknown_architecture_fails_fast() {
        let h = harness(Some(Arc::new(MockTrainer::new(0.9))), 2);
        let outcome = h
            .retrainer
            .retrain(&RetrainOptions {
                architecture: Some("vgg16".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.reason, Some(RetrainFailure::UnknownArchitecture));
    }

    #[test]
    fn test_missing_trainer_is_unavailable() {
        let h = harness(None, 2);
        let outcome = h.retrainer.retrain(&RetrainOptions::default()).unwrap();
        assert_eq!(outcome.reason, Some(RetrainFailure::TrainerUnavailable));
    }

    #[test]
    fn test_insufficient_labels() {
        let h = harness(Some(Arc::new(MockTrainer::new(0.9))), 5);
        seed_labels(&h, 4);
        let outcome = h.retrainer.retrain(&RetrainOptions::default()).unwrap();
        assert_eq!(outcome.reason, Some(RetrainFailure::InsufficientLabels));
        // Nothing was registered.
        assert!(h.registry.list_models(None).is_empty());
    }

    #[test]
    fn test_exact_threshold_proceeds() {
        let h = harness(Some(Arc::new(MockTrainer::new(0.9))), 4);
        seed_labels(&h, 4);
        let outcome = h.retrainer.retrain(&RetrainOptions::default()).unwrap();
        assert!(outcome.success, "outcome: {outcome:?}");
    }

    #[test]
    fn test_successful_round_registers_and_marks_labels() {
        let h = harness(Some(Arc::new(MockTrainer::new(0.91))), 2);
        seed_labels(&h, 6);

        let outcome = h.retrainer.retrain(&RetrainOptions::default()).unwrap();
        assert!(outcome.success);
        let version_id = outcome.version_id.unwrap();

        let model = h.registry.get_model(&version_id).unwrap();
        assert_eq!(model.entry.status, ModelStatus::Evaluating);
        assert_eq!(
            model.entry.architecture.as_deref(),
            Some("efficientnet_v2_m")
        );
        assert_eq!(model.entry.metrics["val_accuracy"], 0.91);
        assert!(model.entry.path.exists());
        assert!(model
            .entry
            .path
            .parent()
            .unwrap()
            .join("training_log.json")
            .exists());

        // Every case that fed the round is marked used.
        assert_eq!(h.pool.unused_label_count(), 0);
        let record = h.pool.get_by_case("10000").unwrap();
        assert_eq!(record.used_in_models, vec![version_id.clone()]);

        let types: Vec<EventType> =
            h.events.recent(10).iter().map(|e| e.event_type).collect();
        assert!(types.contains(&EventType::TrainingStarted));
        assert!(types.contains(&EventType::TrainingCompleted));
    }

    #[test]
    fn test_training_failure_marks_registry_failed() {
        let trainer = Arc::new(MockTrainer::new(0.9));
        trainer.fail.store(true, Ordering::SeqCst);
        let h = harness(Some(trainer), 2);
        seed_labels(&h, 4);

        let outcome = h.retrainer.retrain(&RetrainOptions::default()).unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.reason, Some(RetrainFailure::TrainingFailed));

        let version_id = outcome.version_id.unwrap();
        let model = h.registry.get_model(&version_id).unwrap();
        assert_eq!(model.entry.status, ModelStatus::Failed);
        assert_eq!(h.events.by_type(EventType::TrainingFailed, 10).len(), 1);
        // Labels stay unused for the next attempt.
        assert_eq!(h.pool.unused_label_count(), 4);
    }

    #[test]
    fn test_config_patch_overrides_epochs() {
        let h = harness(Some(Arc::new(MockTrainer::new(0.9))), 2);
        seed_labels(&h, 4);

        let mut patch = Map::new();
        patch.insert("epochs".to_string(), json!(3));
        let outcome = h
            .retrainer
            .retrain(&RetrainOptions {
                config_patch: Some(patch),
                ..Default::default()
            })
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.metrics.unwrap()["epochs_run"], 3);
    }

    #[test]
    fn test_stratified_split_basic() {
        let samples: Vec<TrainSample> = (0..10)
            .map(|i| TrainSample {
                image_path: PathBuf::from(format!("{i}.jpg")),
                class_index: i % 2,
            })
            .collect();
        let (train, val) = stratified_split(samples, 0.8, 42);
        assert_eq!(train.len(), 8);
        assert_eq!(val.len(), 2);
        // Both classes are represented in both partitions.
        for class in 0..2 {
            assert!(train.iter().any(|s| s.class_index == class));
            assert!(val.iter().any(|s| s.class_index == class));
        }
    }

    #[test]
    fn test_stratified_split_single_sample_class_stays_in_train() {
        let mut samples: Vec<TrainSample> = (0..5)
            .map(|i| TrainSample {
                image_path: PathBuf::from(format!("{i}.jpg")),
                class_index: 0,
            })
            .collect();
        samples.push(TrainSample {
            image_path: PathBuf::from("only.jpg"),
            class_index: 1,
        });

        let (train, val) = stratified_split(samples, 0.8, 42);
        assert!(train
            .iter()
            .any(|s| s.image_path == PathBuf::from("only.jpg")));
        assert!(!val.iter().any(|s| s.class_index == 1));
    }

    #[test]
    fn test_stratified_split_never_leaves_val_empty() {
        let samples: Vec<TrainSample> = (0..2)
            .map(|i| TrainSample {
                image_path: PathBuf::from(format!("{i}.jpg")),
                class_index: 0,
            })
            .collect();
        let (train, val) = stratified_split(samples, 0.8, 42);
        assert_eq!(train.len(), 1);
        assert_eq!(val.len(), 1);
    }
}
