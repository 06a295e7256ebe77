//! Retrain Worker
//! Mission: Run training jobs off the request path, one at a time

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::al::promote::{AutoPromoter, DEFAULT_METRIC};
use crate::al::retrain::{RetrainOptions, Retrainer};

/// One queued retraining job.
#[derive(Debug, Clone, Default)]
pub struct RetrainJob {
    pub options: RetrainOptions,
    /// Evaluate the candidate against production when training succeeds.
    pub auto_promote: bool,
}

/// Worker state exposed to status polling.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_promotion: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl WorkerStatus {
    fn idle() -> Self {
        Self {
            state: "idle",
            started_at: None,
            finished_at: None,
            last_outcome: None,
            last_promotion: None,
            last_error: None,
        }
    }
}

/// Single-slot training worker. Requests enqueue through a bounded channel
/// and run sequentially on a blocking task, so at most one job owns the
/// training device at a time. Handlers return immediately and poll status.
pub struct RetrainWorker {
    tx: mpsc::Sender<RetrainJob>,
    status: Arc<RwLock<WorkerStatus>>,
}

impl RetrainWorker {
    pub fn spawn(retrainer: Arc<Retrainer>, promoter: Arc<AutoPromoter>) -> Self {
        let (tx, mut rx) = mpsc::channel::<RetrainJob>(1);
        let status = Arc::new(RwLock::new(WorkerStatus::idle()));

        let worker_status = status.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                {
                    let mut s = worker_status.write();
                    *s = WorkerStatus::idle();
                    s.state = "running";
                    s.started_at = Some(Utc::now().to_rfc3339());
                }
                info!("🛠️  Retrain worker picked up a job");

                let retrainer = retrainer.clone();
                let promoter = promoter.clone();
                let result = tokio::task::spawn_blocking(move || {
                    let outcome = retrainer.retrain(&job.options)?;
                    let promotion = match (&outcome.version_id, outcome.success, job.auto_promote)
                    {
                        (Some(version_id), true, true) => Some(promoter.evaluate_and_promote(
                            version_id,
                            DEFAULT_METRIC,
                            0.0,
                            true,
                        )?),
                        _ => None,
                    };
                    anyhow::Ok((outcome, promotion))
                })
                .await;

                let mut s = worker_status.write();
                s.state = "idle";
                s.finished_at = Some(Utc::now().to_rfc3339());
                match result {
                    Ok(Ok((outcome, promotion))) => {
                        s.last_outcome = serde_json::to_value(&outcome).ok();
                        s.last_promotion =
                            promotion.and_then(|p| serde_json::to_value(&p).ok());
                        s.last_error = None;
                    }
                    Ok(Err(err)) => {
                        error!("retrain job failed: {err:#}");
                        s.last_error = Some(format!("{err:#}"));
                    }
                    Err(join_err) => {
                        error!("retrain worker task aborted: {join_err}");
                        s.last_error = Some(join_err.to_string());
                    }
                }
            }
        });

        Self { tx, status }
    }

    /// Enqueue a job. Returns `false` when the slot is taken.
    pub fn try_enqueue(&self, job: RetrainJob) -> bool {
        self.tx.try_send(job).is_ok()
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.status.read().state == "running"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::al::events::EventLog;
    use crate::al::labels::LabelPool;
    use crate::al::registry::{ModelRegistry, ModelStatus};
    use crate::al::training_config::TrainingConfigStore;
    use crate::config::Settings;
    use crate::crypto::Crypto;
    use crate::model::{EpochRecord, TrainJob, TrainReport, TrainerBackend};
    use crate::storage::CaseStore;
    use anyhow::Result;
    use std::time::Duration;
    use tempfile::TempDir;

    struct InstantTrainer;

    impl TrainerBackend for InstantTrainer {
        fn train(&self, job: &TrainJob) -> Result<TrainReport> {
            std::fs::create_dir_all(job.output_path.parent().unwrap())?;
            std::fs::write(&job.output_path, b"weights")?;
            Ok(TrainReport {
                epochs: vec![EpochRecord {
                    epoch: 1,
                    train_loss: 0.4,
                    train_accuracy: 0.9,
                    val_loss: 0.5,
                    val_accuracy: 0.92,
                }],
                best_val_accuracy: 0.92,
                best_val_loss: 0.5,
                weights_path: job.output_path.clone(),
            })
        }
    }

    fn build(dir: &TempDir) -> (Arc<Retrainer>, Arc<AutoPromoter>, Arc<ModelRegistry>, Arc<Settings>, Arc<LabelPool>) {
        let mut settings =
            Settings::defaults_at(dir.path().join("storage"), dir.path().join("AL"));
        settings.retrain_min_new_labels = 2;
        settings.replay_enabled = false;
        let settings = Arc::new(settings);

        let crypto = Arc::new(Crypto::disabled());
        let case_store = Arc::new(CaseStore::new(settings.clone(), crypto));
        let pool = Arc::new(LabelPool::new(settings.labels_pool_file()));
        let registry = Arc::new(ModelRegistry::new(settings.clone()));
        let events = Arc::new(EventLog::new(settings.event_log_file()));
        let config_store = Arc::new(TrainingConfigStore::new(settings.active_config_file()));

        let retrainer = Arc::new(Retrainer::new(
            settings.clone(),
            case_store,
            pool.clone(),
            registry.clone(),
            events.clone(),
            config_store,
            Some(Arc::new(InstantTrainer)),
            None,
        ));
        let promoter = Arc::new(AutoPromoter::new(registry.clone(), events));
        (retrainer, promoter, registry, settings, pool)
    }

    async fn wait_for_idle_with_result(worker: &RetrainWorker) -> WorkerStatus {
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let status = worker.status();
            if status.state == "idle" && status.finished_at.is_some() {
                return status;
            }
        }
        panic!("worker did not finish in time");
    }

    #[tokio::test]
    async fn test_job_runs_and_auto_promotes() {
        let dir = TempDir::new().unwrap();
        let (retrainer, promoter, registry, settings, pool) = build(&dir);

        for i in 0..3 {
            let rel = format!("alice/img_{i}.jpg");
            let abs = settings.storage_root.join(&rel);
            std::fs::create_dir_all(abs.parent().unwrap()).unwrap();
            std::fs::write(&abs, b"jpeg").unwrap();
            pool.add_label(&format!("{}", 10_000 + i), vec![rel], "mel", "doc1")
                .unwrap();
        }

        let worker = RetrainWorker::spawn(retrainer, promoter);
        assert!(worker.try_enqueue(RetrainJob {
            options: RetrainOptions::default(),
            auto_promote: true,
        }));

        let status = wait_for_idle_with_result(&worker).await;
        assert!(status.last_error.is_none(), "error: {:?}", status.last_error);
        let outcome = status.last_outcome.unwrap();
        assert_eq!(outcome["success"], true);

        // The candidate was trained and then promoted to production.
        let prod = registry.get_production_model().unwrap();
        assert_eq!(prod.entry.status, ModelStatus::Production);
        let promotion = status.last_promotion.unwrap();
        assert_eq!(promotion["promoted"], true);
    }

    #[tokio::test]
    async fn test_failed_job_reports_reason_without_error() {
        let dir = TempDir::new().unwrap();
        let (retrainer, promoter, _registry, _settings, _pool) = build(&dir);
        // No labels seeded: the round fails with a structured reason.

        let worker = RetrainWorker::spawn(retrainer, promoter);
        assert!(worker.try_enqueue(RetrainJob::default()));

        let status = wait_for_idle_with_result(&worker).await;
        assert!(status.last_error.is_none());
        let outcome = status.last_outcome.unwrap();
        assert_eq!(outcome["success"], false);
        assert_eq!(outcome["reason"], "insufficient_labels");
    }
}
