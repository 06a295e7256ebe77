//! Auto-Promotion
//! Mission: Gate candidates against production and drive promotion/rollback

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::al::events::EventLog;
use crate::al::registry::{ModelInfo, ModelRegistry, ModelStatus};

pub const DEFAULT_METRIC: &str = "val_accuracy";

/// Result of a candidate-vs-production evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct PromotionOutcome {
    pub success: bool,
    pub version_id: String,
    pub metric: String,
    pub candidate_value: f64,
    pub production_value: f64,
    pub improvement: f64,
    pub meets_threshold: bool,
    pub promoted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_production: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a rollback request.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Production deployment health, from registry state alone (no probing).
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub production_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn metric_value(metrics: &Map<String, Value>, key: &str) -> f64 {
    metrics.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

/// Compares candidates against production and performs the resulting
/// transitions through the registry, logging every decision.
pub struct AutoPromoter {
    registry: Arc<ModelRegistry>,
    events: Arc<EventLog>,
}

impl AutoPromoter {
    pub fn new(registry: Arc<ModelRegistry>, events: Arc<EventLog>) -> Self {
        Self { registry, events }
    }

    /// `(should_promote, candidate_value, production_value)`. With no
    /// production model deployed, any candidate is promotable.
    pub fn compare(&self, candidate_id: &str, metric: &str, threshold: f64) -> (bool, f64, f64) {
        let Some(candidate) = self.registry.get_model(candidate_id) else {
            return (false, 0.0, 0.0);
        };
        let candidate_value = metric_value(&candidate.entry.metrics, metric);

        let Some(production) = self.registry.get_production_model() else {
            return (true, candidate_value, 0.0);
        };
        let production_value = metric_value(&production.entry.metrics, metric);

        (
            candidate_value > production_value + threshold,
            candidate_value,
            production_value,
        )
    }

    /// Evaluate a candidate and, when `auto` is set, promote it if it clears
    /// the improvement threshold or archive it if it does not.
    pub fn evaluate_and_promote(
        &self,
        version_id: &str,
        metric: &str,
        min_improvement: f64,
        auto: bool,
    ) -> Result<PromotionOutcome> {
        if self.registry.get_model(version_id).is_none() {
            return Ok(PromotionOutcome {
                success: false,
                version_id: version_id.to_string(),
                metric: metric.to_string(),
                candidate_value: 0.0,
                production_value: 0.0,
                improvement: 0.0,
                meets_threshold: false,
                promoted: false,
                previous_production: None,
                reason: None,
                error: Some(format!("Model {version_id} not found")),
            });
        }

        let (should_promote, candidate_value, production_value) =
            self.compare(version_id, metric, min_improvement);

        let mut outcome = PromotionOutcome {
            success: true,
            version_id: version_id.to_string(),
            metric: metric.to_string(),
            candidate_value,
            production_value,
            improvement: candidate_value - production_value,
            meets_threshold: should_promote,
            promoted: false,
            previous_production: None,
            reason: None,
            error: None,
        };

        if should_promote && auto {
            let previous = self.registry.current_production();
            if self.registry.promote(version_id)? {
                outcome.promoted = true;
                outcome.previous_production = previous;
                self.events.log_model_promoted(version_id, candidate_value)?;
            } else {
                outcome.success = false;
                outcome.error = Some("Promotion failed".to_string());
            }
        } else if !should_promote {
            // Not good enough; candidates do not linger in evaluating.
            self.registry.update_status(version_id, ModelStatus::Archived)?;
            outcome.reason = Some(format!(
                "Candidate ({candidate_value:.4}) did not improve over production \
                 ({production_value:.4}) by required threshold ({min_improvement})"
            ));
        }

        Ok(outcome)
    }

    /// Promote regardless of metrics (subject to registry invariants only).
    pub fn manual_promote(&self, version_id: &str, reason: &str) -> Result<PromotionOutcome> {
        let Some(model) = self.registry.get_model(version_id) else {
            return Ok(PromotionOutcome {
                success: false,
                version_id: version_id.to_string(),
                metric: DEFAULT_METRIC.to_string(),
                candidate_value: 0.0,
                production_value: 0.0,
                improvement: 0.0,
                meets_threshold: false,
                promoted: false,
                previous_production: None,
                reason: None,
                error: Some(format!("Model {version_id} not found")),
            });
        };

        let accuracy = metric_value(&model.entry.metrics, DEFAULT_METRIC);
        let previous = self.registry.current_production();
        let promoted = self.registry.promote(version_id)?;
        if promoted {
            self.events.log(
                crate::al::events::EventType::ModelPromoted,
                format!("Model {version_id} manually promoted: {reason}"),
                serde_json::from_value(serde_json::json!({
                    "version_id": version_id,
                    "accuracy": accuracy,
                    "reason": reason,
                }))
                .unwrap_or_default(),
            )?;
            info!("📦 Manual promotion of {version_id}: {reason}");
        }

        Ok(PromotionOutcome {
            success: promoted,
            version_id: version_id.to_string(),
            metric: DEFAULT_METRIC.to_string(),
            candidate_value: accuracy,
            production_value: 0.0,
            improvement: 0.0,
            meets_threshold: true,
            promoted,
            previous_production: previous,
            reason: Some(reason.to_string()),
            error: (!promoted).then(|| "Promotion failed".to_string()),
        })
    }

    /// Roll back to a given version, or to the most recently archived model
    /// when none is named. Refuses when nothing is in production.
    pub fn rollback(&self, to_version: Option<&str>, reason: &str) -> Result<RollbackOutcome> {
        let Some(current) = self.registry.get_production_model() else {
            return Ok(RollbackOutcome {
                success: false,
                from_version: None,
                to_version: None,
                reason: None,
                error: Some("No production model to rollback from".to_string()),
            });
        };
        let from_version = current.version_id;

        let target = match to_version {
            Some(version) => match self.registry.get_model(version) {
                Some(model) => model.version_id,
                None => {
                    return Ok(RollbackOutcome {
                        success: false,
                        from_version: Some(from_version),
                        to_version: None,
                        reason: None,
                        error: Some(format!("Target model {version} not found")),
                    })
                }
            },
            None => {
                let archived = self.registry.list_models(Some(ModelStatus::Archived));
                match archived.first() {
                    Some(model) => model.version_id.clone(),
                    None => {
                        return Ok(RollbackOutcome {
                            success: false,
                            from_version: Some(from_version),
                            to_version: None,
                            reason: None,
                            error: Some(
                                "No archived models available for rollback".to_string(),
                            ),
                        })
                    }
                }
            }
        };

        if self.registry.rollback_to(&target)? {
            self.events
                .log_model_rollback(&from_version, &target, reason)?;
            Ok(RollbackOutcome {
                success: true,
                from_version: Some(from_version),
                to_version: Some(target),
                reason: Some(reason.to_string()),
                error: None,
            })
        } else {
            Ok(RollbackOutcome {
                success: false,
                from_version: Some(from_version),
                to_version: Some(target),
                reason: None,
                error: Some("Rollback failed".to_string()),
            })
        }
    }

    /// Registry-only health view of the production deployment.
    pub fn health(&self) -> HealthReport {
        match self.registry.get_production_model() {
            Some(ModelInfo { version_id, entry }) => HealthReport {
                healthy: true,
                production_model: Some(version_id),
                architecture: entry.architecture.clone(),
                metrics: Some(entry.metrics),
                deployed_at: Some(entry.created_at),
                reason: None,
            },
            None => HealthReport {
                healthy: false,
                production_model: None,
                architecture: None,
                metrics: None,
                deployed_at: None,
                reason: Some("No production model deployed".to_string()),
            },
        }
    }

    /// Candidates awaiting evaluation.
    pub fn promotion_candidates(&self) -> Vec<ModelInfo> {
        self.registry.list_models(Some(ModelStatus::Evaluating))
    }

    /// Evaluate every candidate in `evaluating` state.
    pub fn auto_evaluate_candidates(
        &self,
        metric: &str,
        min_improvement: f64,
    ) -> Result<Vec<PromotionOutcome>> {
        let mut results = Vec::new();
        for candidate in self.promotion_candidates() {
            results.push(self.evaluate_and_promote(
                &candidate.version_id,
                metric,
                min_improvement,
                true,
            )?);
        }
        Ok(results)
    }
}
