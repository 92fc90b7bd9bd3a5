use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use common::clock::Clock;
use common::events::{Event, EventBus, EventKind};
use store::keys::KeySpace;
use store::{StateStore, StateStoreExt};

use crate::error::RetryError;
use crate::history::AttemptStore;
use crate::types::RetryFeatures;

const MIN_TRAINING_SAMPLES: usize = 100;
const MODEL_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

/// Bounded integer space for hashed string features.
const HASH_SPACE: u64 = 1_000;

/// Map string features into a bounded integer space; numerics pass through.
pub fn feature_vector(names: &[String], f: &RetryFeatures) -> Vec<f64> {
    names
        .iter()
        .map(|name| match name.as_str() {
            "attempt_number" => f.attempt_number as f64,
            "payload_size" => f.payload_size as f64,
            "time_of_day" => f.time_of_day as f64,
            "error_class" => hash_feature(f.error_class.as_deref().unwrap_or("")),
            "error_code" => hash_feature(f.error_code.as_deref().unwrap_or("")),
            "job_type" => hash_feature(&f.job_type),
            "queue" => hash_feature(&f.queue),
            "worker_version" => hash_feature(&f.worker_version),
            other => f.health_signals.get(other).copied().unwrap_or(0.0),
        })
        .collect()
}

fn hash_feature(s: &str) -> f64 {
    let mut h = DefaultHasher::new();
    s.hash(&mut h);
    (h.finish() % HASH_SPACE) as f64
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// Serialized scorer state. Scoring is deterministic given the blob.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelBlob {
    pub weights: Vec<f64>,
    pub bias: f64,
    /// Per-feature normalization divisors captured at training time.
    pub scale: Vec<f64>,
}

impl ModelBlob {
    pub fn predict(&self, x: &[f64]) -> f64 {
        let z: f64 = self
            .weights
            .iter()
            .zip(x.iter())
            .zip(self.scale.iter())
            .map(|((w, v), s)| w * (v / s))
            .sum::<f64>()
            + self.bias;
        sigmoid(z)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SupervisedModel {
    pub version: String,
    pub model_type: String,
    pub feature_names: Vec<String>,
    pub trained_at: DateTime<Utc>,
    pub accuracy: f64,
    pub f1: f64,
    pub enabled: bool,
    /// Fraction of requests scored by this model, in [0, 100].
    pub canary_percent: f64,
    pub blob: ModelBlob,
}

#[derive(Clone, Debug)]
pub struct Hyperparams {
    pub learning_rate: f64,
    pub epochs: u32,
}

impl Default for Hyperparams {
    fn default() -> Self {
        Self {
            learning_rate: 0.5,
            epochs: 400,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TrainingConfig {
    pub model_type: String,
    pub features: Vec<String>,
    pub training_period: Duration,
    /// Fraction of samples held out for validation, in [0, 1).
    pub validation_split: f64,
    pub hyperparams: Hyperparams,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            model_type: "logistic_regression".into(),
            features: vec![
                "error_class".into(),
                "job_type".into(),
                "attempt_number".into(),
                "payload_size".into(),
                "time_of_day".into(),
                "worker_version".into(),
            ],
            training_period: Duration::from_secs(30 * 24 * 3600),
            validation_split: 0.2,
            hyperparams: Hyperparams::default(),
        }
    }
}

#[derive(Default)]
struct DeployState {
    active: Option<SupervisedModel>,
    /// Retained for rollback.
    previous: Option<SupervisedModel>,
}

/// Trains, scores, and canary-deploys the supervised success predictor.
///
/// The active model lives in memory; scoring never touches the store, so a
/// store outage cannot take the supervised tier down mid-request.
pub struct Predictor {
    store: Arc<dyn StateStore>,
    attempts: Arc<AttemptStore>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    state: RwLock<DeployState>,
    rng: Mutex<StdRng>,
}

impl Predictor {
    pub fn new(
        store: Arc<dyn StateStore>,
        attempts: Arc<AttemptStore>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            attempts,
            bus,
            clock,
            state: RwLock::new(DeployState::default()),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic shuffling and canary draws for tests.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    /// Fit a logistic model on the attempt history within the training
    /// window. Returns the trained model without deploying it.
    #[instrument(skip(self, ks, config), target = "supervised")]
    pub async fn train(
        &self,
        ks: &KeySpace,
        config: &TrainingConfig,
    ) -> Result<SupervisedModel, RetryError> {
        if !(0.0..1.0).contains(&config.validation_split) {
            return Err(RetryError::Config(
                "validation_split must be in [0,1)".into(),
            ));
        }

        let records = self.attempts.scan_recent(ks, config.training_period).await?;
        if records.len() < MIN_TRAINING_SAMPLES {
            return Err(RetryError::InsufficientData {
                needed: MIN_TRAINING_SAMPLES,
                got: records.len(),
            });
        }

        let mut rows: Vec<(Vec<f64>, f64)> = records
            .iter()
            .map(|r| {
                let features = RetryFeatures::from(r);
                let y = if r.success { 1.0 } else { 0.0 };
                (feature_vector(&config.features, &features), y)
            })
            .collect();
        rows.shuffle(&mut *self.rng.lock());

        let holdout = ((rows.len() as f64) * config.validation_split).round() as usize;
        let split_at = rows.len() - holdout;
        let (train_rows, val_rows) = rows.split_at(split_at);

        let blob = fit_logistic(train_rows, &config.hyperparams);

        let eval_rows = if val_rows.is_empty() { train_rows } else { val_rows };
        let (accuracy, f1) = evaluate(&blob, eval_rows);

        let model = SupervisedModel {
            version: format!("v{}", self.clock.now_ms()),
            model_type: config.model_type.clone(),
            feature_names: config.features.clone(),
            trained_at: self.clock.now(),
            accuracy,
            f1,
            enabled: false,
            canary_percent: 0.0,
            blob,
        };

        self.bus.publish(
            Event::new(EventKind::MlModelTrained, "supervised model trained", self.clock.now())
                .with("version", &model.version)
                .with("samples", records.len())
                .with("accuracy", accuracy)
                .with("f1", f1),
        );

        info!(
            version = %model.version,
            samples = records.len(),
            accuracy,
            f1,
            "supervised model trained"
        );
        Ok(model)
    }

    /// Atomically replace the active model, retaining the previous one for
    /// rollback, and persist the blob.
    #[instrument(skip(self, ks, model), target = "supervised", fields(version = %model.version))]
    pub async fn deploy(
        &self,
        ks: &KeySpace,
        mut model: SupervisedModel,
        canary_percent: f64,
    ) -> Result<(), RetryError> {
        if !(0.0..=100.0).contains(&canary_percent) {
            return Err(RetryError::DeployFailed(format!(
                "canary_percent must be in [0,100], got {canary_percent}"
            )));
        }

        model.enabled = true;
        model.canary_percent = canary_percent;

        self.store
            .set_json(&ks.ml_model(), &model, Some(MODEL_TTL))
            .await?;

        {
            let mut state = self.state.write();
            state.previous = state.active.take();
            state.active = Some(model.clone());
        }

        self.bus.publish(
            Event::new(EventKind::MlModelDeployed, "supervised model deployed", self.clock.now())
                .with("version", &model.version)
                .with("canary_percent", canary_percent),
        );
        Ok(())
    }

    /// Disable the active model and zero its canary. Re-enabling requires an
    /// explicit re-deploy.
    pub async fn rollback(&self, ks: &KeySpace) -> Result<(), RetryError> {
        let disabled = {
            let mut state = self.state.write();
            let Some(active) = state.active.as_mut() else {
                return Err(RetryError::ModelNotFound("no active model".into()));
            };
            active.enabled = false;
            active.canary_percent = 0.0;
            active.clone()
        };

        self.store
            .set_json(&ks.ml_model(), &disabled, Some(MODEL_TTL))
            .await?;

        self.bus.publish(
            Event::new(EventKind::Rollback, "supervised model rolled back", self.clock.now())
                .with("version", &disabled.version),
        );
        warn!(version = %disabled.version, "supervised model disabled by rollback");
        Ok(())
    }

    /// Load the persisted active model on startup. Returns whether one exists.
    pub async fn load(&self, ks: &KeySpace) -> Result<bool, RetryError> {
        match self.store.get_json::<SupervisedModel>(&ks.ml_model()).await? {
            Some(model) => {
                debug!(version = %model.version, "supervised model loaded");
                self.state.write().active = Some(model);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn active_version(&self) -> Option<String> {
        self.state.read().active.as_ref().map(|m| m.version.clone())
    }

    pub fn is_enabled(&self) -> bool {
        self.state
            .read()
            .active
            .as_ref()
            .is_some_and(|m| m.enabled)
    }

    /// Per-request canary decision: uniform draw against `canary_percent`.
    pub fn canary_gate(&self) -> bool {
        let canary = {
            let state = self.state.read();
            match state.active.as_ref() {
                Some(m) if m.enabled => m.canary_percent,
                _ => return false,
            }
        };
        if canary <= 0.0 {
            return false;
        }
        let draw: f64 = self.rng.lock().r#gen();
        draw < canary / 100.0
    }

    /// Score a live request with the active model.
    /// Deterministic given the deployed blob.
    pub fn score(&self, features: &RetryFeatures) -> Result<(f64, f64), RetryError> {
        let state = self.state.read();
        let model = state
            .active
            .as_ref()
            .ok_or_else(|| RetryError::ModelNotFound("no active model".into()))?;
        if !model.enabled {
            return Err(RetryError::MlDisabled);
        }

        let x = feature_vector(&model.feature_names, features);
        let p = model.blob.predict(&x);
        Ok((p.clamp(0.0, 1.0), model.accuracy.clamp(0.0, 1.0)))
    }
}

/// Full-batch gradient descent on the logistic loss.
fn fit_logistic(rows: &[(Vec<f64>, f64)], hp: &Hyperparams) -> ModelBlob {
    let dims = rows.first().map(|(x, _)| x.len()).unwrap_or(0);

    // Normalize by the max magnitude seen per dimension so hashed features
    // and raw numerics share a scale.
    let mut scale = vec![1.0_f64; dims];
    for (x, _) in rows {
        for (s, v) in scale.iter_mut().zip(x.iter()) {
            *s = s.max(v.abs());
        }
    }

    let mut weights = vec![0.0_f64; dims];
    let mut bias = 0.0_f64;
    let n = rows.len() as f64;

    for _ in 0..hp.epochs {
        let mut grad_w = vec![0.0_f64; dims];
        let mut grad_b = 0.0_f64;

        for (x, y) in rows {
            let z: f64 = weights
                .iter()
                .zip(x.iter())
                .zip(scale.iter())
                .map(|((w, v), s)| w * (v / s))
                .sum::<f64>()
                + bias;
            let err = sigmoid(z) - y;
            for ((g, v), s) in grad_w.iter_mut().zip(x.iter()).zip(scale.iter()) {
                *g += err * (v / s);
            }
            grad_b += err;
        }

        for (w, g) in weights.iter_mut().zip(grad_w.iter()) {
            *w -= hp.learning_rate * g / n;
        }
        bias -= hp.learning_rate * grad_b / n;
    }

    ModelBlob {
        weights,
        bias,
        scale,
    }
}

/// Accuracy and F1 at the 0.5 threshold.
fn evaluate(blob: &ModelBlob, rows: &[(Vec<f64>, f64)]) -> (f64, f64) {
    if rows.is_empty() {
        return (0.0, 0.0);
    }

    let (mut tp, mut fp, mut tn, mut fne) = (0u64, 0u64, 0u64, 0u64);
    for (x, y) in rows {
        let predicted = blob.predict(x) >= 0.5;
        let actual = *y >= 0.5;
        match (predicted, actual) {
            (true, true) => tp += 1,
            (true, false) => fp += 1,
            (false, false) => tn += 1,
            (false, true) => fne += 1,
        }
    }

    let accuracy = (tp + tn) as f64 / rows.len() as f64;
    let precision = if tp + fp > 0 { tp as f64 / (tp + fp) as f64 } else { 0.0 };
    let recall = if tp + fne > 0 { tp as f64 / (tp + fne) as f64 } else { 0.0 };
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };
    (accuracy, f1)
}
