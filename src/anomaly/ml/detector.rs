//! ML Anomaly Detector
//!
//! ウォームアップ（未学習）とアクティブ（学習済み）の2フェーズを持つオンライン外れ値検知器。
//!
//! - ウォームアップ: クリーンなイベントをベースラインに溜め、規定数に達したら学習する。
//!   この間は常に正常と判定する。
//! - アクティブ: 現在のモデル（またはフォールバック）でスコアを計算し、しきい値を超えたら
//!   `ml_outlier` として検知する。クリーンなイベントは再学習用に引き続き溜める。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::buffer::{BaselineBuffer, BaselineSample};
use super::features::{quantile_of, to_vector, total_variance, FeatureVec, RPS_INDEX};
use super::holder::{ActiveModel, ModelHolder};
use super::models::PcaModel;
use super::persistence::{ModelStore, PersistedModel};
use crate::anomaly::clock::SharedClock;
use crate::anomaly::config::{AnomalyDetectionSettings, OutlierAlgorithm};
use crate::anomaly::types::{AnomalyReason, FeatureEvent, Verdict};
use crate::anomaly::AnomalyDetector;
use crate::error::{Error, Result};

/// 検知器のフェーズ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelPhase {
    WarmUp,
    Fallback,
    Model,
}

/// 検知器の状態
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStatus {
    pub phase: ModelPhase,
    pub threshold: Option<f64>,
    pub baseline_len: usize,
    pub trained_samples: usize,
    pub version: u64,
    pub trained_at: Option<DateTime<Utc>>,
}

/// モデルが有効化された経緯
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingKind {
    /// ウォームアップ完了時の初回学習
    Baseline,
    /// 定期再学習によるモデル再学習
    Retrain,
    /// フォールバックしきい値の再較正
    Recalibrate,
    /// 永続化からの復元
    Restore,
}

impl TrainingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrainingKind::Baseline => "baseline",
            TrainingKind::Retrain => "retrain",
            TrainingKind::Recalibrate => "recalibrate",
            TrainingKind::Restore => "restore",
        }
    }
}

impl fmt::Display for TrainingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 再学習をスキップした理由
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// 他の学習が実行中
    InProgress,
    /// まだウォームアップ中
    NotTrained,
    /// サンプル不足
    InsufficientSamples { available: usize, required: usize },
    /// モデル使用中に分散がガードを下回った
    DegenerateData { variance: f64 },
    /// 学習に失敗
    FitFailed(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::InProgress => write!(f, "training already in progress"),
            SkipReason::NotTrained => write!(f, "detector is still warming up"),
            SkipReason::InsufficientSamples {
                available,
                required,
            } => write!(f, "only {} of {} samples available", available, required),
            SkipReason::DegenerateData { variance } => {
                write!(f, "variance {:e} below guard", variance)
            }
            SkipReason::FitFailed(msg) => write!(f, "fit failed: {}", msg),
        }
    }
}

/// 再学習の結果
#[derive(Debug, Clone, PartialEq)]
pub enum RetrainOutcome {
    /// モデルを再学習して差し替えた
    Retrained { threshold: f64, samples: usize },
    /// フォールバックのしきい値のみ再較正した
    Recalibrated { threshold: f64, samples: usize },
    /// 現在のモデルを維持
    Skipped(SkipReason),
}

impl RetrainOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, RetrainOutcome::Skipped(_))
    }
}

/// モデル有効化の通知先（メトリクス等）
pub trait TrainingListener: Send + Sync + fmt::Debug {
    fn on_model_activated(&self, kind: TrainingKind, threshold: f64);
}

/// 学習結果（有効化前）
enum Calibration {
    Fallback { threshold: f64 },
    Model { model: Arc<PcaModel>, threshold: f64 },
}

/// 学習中フラグのガード（drop で解放）
pub(crate) struct TrainingGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> TrainingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for TrainingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// ML異常検知器
pub struct MlAnomalyDetector {
    settings: AnomalyDetectionSettings,
    clock: SharedClock,
    holder: ModelHolder,
    buffer: BaselineBuffer,
    store: Option<ModelStore>,
    training: AtomicBool,
    listener: Option<Arc<dyn TrainingListener>>,
}

impl fmt::Debug for MlAnomalyDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MlAnomalyDetector")
            .field("status", &self.status())
            .field("persistence", &self.store.is_some())
            .finish()
    }
}

impl MlAnomalyDetector {
    /// 新しい検知器を作成（永続化されたモデルがあれば復元）
    pub fn new(settings: AnomalyDetectionSettings, clock: SharedClock) -> Result<Self> {
        Self::with_listener(settings, clock, None)
    }

    /// 通知先付きで検知器を作成
    pub fn with_listener(
        settings: AnomalyDetectionSettings,
        clock: SharedClock,
        listener: Option<Arc<dyn TrainingListener>>,
    ) -> Result<Self> {
        settings.validate()?;
        if settings.algorithm == OutlierAlgorithm::IsolationForest {
            return Err(Error::NotSupported(
                "isolation_forest outlier algorithm is not available; use pca".to_string(),
            ));
        }

        let detector = Self {
            buffer: BaselineBuffer::new(settings.baseline_hard_cap),
            store: settings.persistence.clone().map(ModelStore::new),
            holder: ModelHolder::new(),
            training: AtomicBool::new(false),
            settings,
            clock,
            listener,
        };
        detector.restore();
        Ok(detector)
    }

    fn restore(&self) {
        let Some(store) = &self.store else {
            return;
        };
        match store.load() {
            Ok(Some(persisted)) => {
                let now = self.clock.now();
                let active = match persisted {
                    PersistedModel::Fallback { threshold } => {
                        ActiveModel::fallback(threshold, 0, now)
                    }
                    PersistedModel::Model { model, threshold } => ActiveModel::model(
                        Arc::new(model),
                        self.settings.scorer_pool_size,
                        threshold,
                        0,
                        now,
                    ),
                };
                info!(
                    "Restored anomaly model from {} (fallback={}, threshold={})",
                    store.settings().threshold_path.display(),
                    active.is_fallback(),
                    active.threshold
                );
                let (active, _) = self.holder.swap(active);
                self.notify(TrainingKind::Restore, active.threshold);
            }
            Ok(None) => debug!("No persisted anomaly model, starting warm-up"),
            Err(e) => warn!("Ignoring persisted anomaly model, starting warm-up: {}", e),
        }
    }

    /// イベントを観測して判定
    pub fn observe(&self, event: &FeatureEvent) -> Verdict {
        let vector = to_vector(event);

        let Some(active) = self.holder.load() else {
            if event.is_clean() {
                self.remember(vector);
                if self.buffer.len() >= self.settings.baseline_sample_size {
                    self.train_baseline();
                }
            }
            return Verdict::Normal;
        };

        let (flagged, score) = active.evaluate(&vector);
        if event.is_clean() {
            self.remember(vector);
        }

        if flagged {
            debug!(
                "ML outlier for {}{} (score={:.4}, threshold={:.4})",
                event.client_key(),
                event.route_key,
                score,
                active.threshold
            );
            Verdict::Anomaly(AnomalyReason::MlOutlier)
        } else {
            Verdict::Normal
        }
    }

    fn remember(&self, vector: FeatureVec) {
        self.buffer.push(BaselineSample {
            observed_at: self.clock.now(),
            vector,
        });
    }

    fn train_baseline(&self) {
        let Some(_guard) = TrainingGuard::acquire(&self.training) else {
            return;
        };
        // ガード取得前に他のスレッドが学習を終えている場合がある
        if self.holder.is_active() {
            return;
        }
        let samples = self.buffer.vectors();
        if samples.len() < self.settings.baseline_sample_size {
            return;
        }

        match self.calibrate(&samples) {
            Ok(calibration) => {
                let kind = TrainingKind::Baseline;
                self.activate(calibration, samples.len(), kind);
            }
            Err(e) => warn!("Baseline training failed, staying in warm-up: {}", e),
        }
    }

    /// 学習サンプルからモデルまたはフォールバックのしきい値を求める
    fn calibrate(&self, samples: &[FeatureVec]) -> Result<Calibration> {
        let variance = total_variance(samples);
        if variance < self.settings.min_variance_guard {
            return self.calibrate_fallback(samples, variance);
        }

        let model = PcaModel::fit(samples, self.settings.pca_rank)?;
        let mut buffer = Vec::with_capacity(model.dimension());
        let scores: Vec<f64> = samples
            .iter()
            .map(|s| model.score_with(s, &mut buffer))
            .collect();
        let threshold = quantile_of(scores, self.settings.score_quantile)
            .ok_or_else(|| Error::Model("no training scores".to_string()))?;
        if !threshold.is_finite() {
            return Err(Error::Model(format!("non-finite threshold {}", threshold)));
        }
        Ok(Calibration::Model {
            model: Arc::new(model),
            threshold,
        })
    }

    fn calibrate_fallback(&self, samples: &[FeatureVec], variance: f64) -> Result<Calibration> {
        let rps: Vec<f64> = samples.iter().map(|s| s[RPS_INDEX]).collect();
        let threshold = quantile_of(rps, self.settings.score_quantile)
            .ok_or_else(|| Error::Model("no training samples".to_string()))?;
        debug!(
            "Variance {:e} below guard {:e}, using fallback scoring",
            variance, self.settings.min_variance_guard
        );
        Ok(Calibration::Fallback { threshold })
    }

    /// ホルダーを差し替えて永続化（永続化の失敗は無視）
    fn activate(&self, calibration: Calibration, samples: usize, kind: TrainingKind) -> f64 {
        let now = self.clock.now();
        let (active, persisted) = match calibration {
            Calibration::Fallback { threshold } => {
                let persisted = self.store.as_ref().map(|s| s.save_fallback(threshold));
                (ActiveModel::fallback(threshold, samples, now), persisted)
            }
            Calibration::Model { model, threshold } => {
                let persisted = self.store.as_ref().map(|s| s.save_model(&model, threshold));
                let active = ActiveModel::model(
                    model,
                    self.settings.scorer_pool_size,
                    threshold,
                    samples,
                    now,
                );
                (active, persisted)
            }
        };

        let (active, _) = self.holder.swap(active);
        info!(
            "Anomaly model activated ({}): fallback={}, threshold={:.4}, samples={}, version={}",
            kind,
            active.is_fallback(),
            active.threshold,
            samples,
            active.version
        );
        if let Some(Err(e)) = persisted {
            warn!("Failed to persist anomaly model: {}", e);
        }
        self.notify(kind, active.threshold);
        active.threshold
    }

    fn notify(&self, kind: TrainingKind, threshold: f64) {
        if let Some(listener) = &self.listener {
            listener.on_model_activated(kind, threshold);
        }
    }

    /// 定期再学習
    ///
    /// 学習期間より古いサンプルを捨ててから、現在の状態とデータの分散に応じて
    /// 再学習・再較正・スキップのいずれかを行う。
    pub fn retrain(&self) -> RetrainOutcome {
        let Some(_guard) = TrainingGuard::acquire(&self.training) else {
            return RetrainOutcome::Skipped(SkipReason::InProgress);
        };
        let Some(active) = self.holder.load() else {
            return RetrainOutcome::Skipped(SkipReason::NotTrained);
        };

        let cutoff = self.clock.now() - self.settings.training_window();
        let pruned = self.buffer.prune_older_than(cutoff);
        if pruned > 0 {
            debug!("Pruned {} baseline samples older than {}", pruned, cutoff);
        }

        let samples = self.buffer.vectors();
        if samples.len() < self.settings.min_samples_guard {
            warn!(
                "Skipping retrain: {} samples, need {}",
                samples.len(),
                self.settings.min_samples_guard
            );
            return RetrainOutcome::Skipped(SkipReason::InsufficientSamples {
                available: samples.len(),
                required: self.settings.min_samples_guard,
            });
        }

        let variance = total_variance(&samples);
        let degenerate = variance < self.settings.min_variance_guard;
        if degenerate && !active.is_fallback() {
            warn!(
                "Skipping retrain: variance {:e} below guard, keeping current model",
                variance
            );
            return RetrainOutcome::Skipped(SkipReason::DegenerateData { variance });
        }

        let calibration = if degenerate {
            self.calibrate_fallback(&samples, variance)
        } else {
            self.calibrate(&samples)
        };
        match calibration {
            Ok(calibration @ Calibration::Fallback { .. }) => {
                let threshold = self.activate(calibration, samples.len(), TrainingKind::Recalibrate);
                RetrainOutcome::Recalibrated {
                    threshold,
                    samples: samples.len(),
                }
            }
            Ok(calibration) => {
                let threshold = self.activate(calibration, samples.len(), TrainingKind::Retrain);
                RetrainOutcome::Retrained {
                    threshold,
                    samples: samples.len(),
                }
            }
            Err(e) => {
                warn!("Retrain failed, keeping current model: {}", e);
                RetrainOutcome::Skipped(SkipReason::FitFailed(e.to_string()))
            }
        }
    }

    /// 学習中フラグを外部から保持する（重複実行のテスト用）
    #[cfg(test)]
    pub(crate) fn begin_training(&self) -> Option<TrainingGuard<'_>> {
        TrainingGuard::acquire(&self.training)
    }

    /// 現在の状態
    pub fn status(&self) -> ModelStatus {
        let active = self.holder.load();
        let phase = match &active {
            None => ModelPhase::WarmUp,
            Some(m) if m.is_fallback() => ModelPhase::Fallback,
            Some(_) => ModelPhase::Model,
        };
        ModelStatus {
            phase,
            threshold: active.as_ref().map(|m| m.threshold),
            baseline_len: self.buffer.len(),
            trained_samples: active.as_ref().map_or(0, |m| m.training_samples),
            version: active.as_ref().map_or(0, |m| m.version),
            trained_at: active.as_ref().map(|m| m.trained_at),
        }
    }

    pub fn threshold(&self) -> Option<f64> {
        self.holder.threshold()
    }

    pub fn is_trained(&self) -> bool {
        self.holder.is_active()
    }

    pub fn baseline_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn settings(&self) -> &AnomalyDetectionSettings {
        &self.settings
    }
}

impl AnomalyDetector for MlAnomalyDetector {
    fn observe(&self, event: &FeatureEvent) -> Verdict {
        MlAnomalyDetector::observe(self, event)
    }

    fn name(&self) -> &'static str {
        "ml"
    }
}
