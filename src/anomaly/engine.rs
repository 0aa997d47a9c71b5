//! Detection Engine
//!
//! 設定に応じて検知器を1回だけ構築し、特徴ストリーム・検知ループ・再学習タスクを
//! 1つのキャンセルトークンの下で起動・停止する。

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::clock::{SharedClock, SystemClock};
use super::config::{AnomalyDetectionSettings, DetectionMode};
use super::consumer::{AnomalyConsumer, AnomalySink};
use super::hybrid::HybridDetector;
#[cfg(feature = "prometheus")]
use super::metrics::DetectionMetrics;
use super::ml::{MlAnomalyDetector, RetrainReport, RetrainScheduler, TrainingListener};
use super::rules::RollingRuleDetector;
use super::stream::FeatureStream;
use super::types::FeatureEvent;
use super::AnomalyDetector;
use crate::error::{Error, Result};

/// 構築済みの検知器一式
#[derive(Clone)]
pub struct DetectorSet {
    /// 判定に使う検知器（モードに応じた実装）
    pub detector: Arc<dyn AnomalyDetector>,
    pub rules: Option<Arc<RollingRuleDetector>>,
    /// 再学習のスケジュールに使う
    pub ml: Option<Arc<MlAnomalyDetector>>,
}

impl std::fmt::Debug for DetectorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorSet")
            .field("detector", &self.detector.name())
            .field("rules", &self.rules.is_some())
            .field("ml", &self.ml.is_some())
            .finish()
    }
}

/// 設定のモードに応じて検知器を構築
pub fn build_detectors(
    settings: &AnomalyDetectionSettings,
    clock: SharedClock,
) -> Result<DetectorSet> {
    build_detectors_with(settings, clock, None)
}

/// 学習通知先付きで検知器を構築
pub fn build_detectors_with(
    settings: &AnomalyDetectionSettings,
    clock: SharedClock,
    listener: Option<Arc<dyn TrainingListener>>,
) -> Result<DetectorSet> {
    settings.validate()?;

    let set = match settings.mode {
        DetectionMode::Rules => {
            let rules = Arc::new(RollingRuleDetector::new(settings.clone(), clock));
            DetectorSet {
                detector: rules.clone(),
                rules: Some(rules),
                ml: None,
            }
        }
        DetectionMode::Ml => {
            let ml = Arc::new(MlAnomalyDetector::with_listener(
                settings.clone(),
                clock,
                listener,
            )?);
            DetectorSet {
                detector: ml.clone(),
                rules: None,
                ml: Some(ml),
            }
        }
        DetectionMode::Hybrid => {
            let rules = Arc::new(RollingRuleDetector::new(settings.clone(), clock.clone()));
            let ml = Arc::new(MlAnomalyDetector::with_listener(
                settings.clone(),
                clock,
                listener,
            )?);
            DetectorSet {
                detector: Arc::new(HybridDetector::new(rules.clone(), ml.clone())),
                rules: Some(rules),
                ml: Some(ml),
            }
        }
    };

    info!("Anomaly detection mode: {:?} ({})", settings.mode, set.detector.name());
    Ok(set)
}

/// 検知エンジン
pub struct DetectionEngine {
    settings: AnomalyDetectionSettings,
    stream: Arc<FeatureStream>,
    sink: Arc<AnomalySink>,
    detectors: DetectorSet,
    #[cfg(feature = "prometheus")]
    metrics: Arc<DetectionMetrics>,
    cancel: CancellationToken,
    consumer: JoinHandle<u64>,
    retrain: Option<RetrainScheduler>,
}

impl DetectionEngine {
    /// システム時計でエンジンを起動（tokioランタイム内で呼ぶこと）
    pub fn start(settings: AnomalyDetectionSettings) -> Result<Self> {
        Self::start_with_clock(settings, Arc::new(SystemClock))
    }

    /// 時計を指定してエンジンを起動
    pub fn start_with_clock(settings: AnomalyDetectionSettings, clock: SharedClock) -> Result<Self> {
        #[cfg(feature = "prometheus")]
        let metrics = Arc::new(DetectionMetrics::new()?);
        #[cfg(feature = "prometheus")]
        let listener: Option<Arc<dyn TrainingListener>> = Some(metrics.clone());
        #[cfg(not(feature = "prometheus"))]
        let listener: Option<Arc<dyn TrainingListener>> = None;

        let detectors = build_detectors_with(&settings, clock.clone(), listener)?;
        let stream = Arc::new(FeatureStream::new(settings.feature_queue_capacity));
        let sink = Arc::new(AnomalySink::new());
        let cancel = CancellationToken::new();

        let consumer = AnomalyConsumer::new(
            stream.clone(),
            detectors.detector.clone(),
            sink.clone(),
            clock,
        );
        #[cfg(feature = "prometheus")]
        let consumer = consumer.with_metrics(metrics.clone());
        let consumer = tokio::spawn(consumer.run(cancel.child_token()));

        let retrain = detectors.ml.as_ref().map(|ml| {
            RetrainScheduler::spawn(
                ml.clone(),
                settings.retrain_interval(),
                cancel.child_token(),
            )
        });

        info!(
            "Detection engine started (queue capacity: {}, retrain: {})",
            stream.capacity(),
            retrain.is_some()
        );

        Ok(Self {
            settings,
            stream,
            sink,
            detectors,
            #[cfg(feature = "prometheus")]
            metrics,
            cancel,
            consumer,
            retrain,
        })
    }

    /// 特徴イベントを投入（ブロックしない）
    pub fn enqueue(&self, event: FeatureEvent) -> bool {
        self.stream.enqueue(event)
    }

    pub fn stream(&self) -> &Arc<FeatureStream> {
        &self.stream
    }

    pub fn sink(&self) -> &Arc<AnomalySink> {
        &self.sink
    }

    pub fn detectors(&self) -> &DetectorSet {
        &self.detectors
    }

    pub fn ml(&self) -> Option<&Arc<MlAnomalyDetector>> {
        self.detectors.ml.as_ref()
    }

    #[cfg(feature = "prometheus")]
    pub fn metrics(&self) -> &Arc<DetectionMetrics> {
        &self.metrics
    }

    /// 再学習サイクルの結果を購読（MLを使わないモードでは None）
    pub fn retrain_reports(&self) -> Option<watch::Receiver<Option<RetrainReport>>> {
        self.retrain.as_ref().map(RetrainScheduler::reports)
    }

    pub fn settings(&self) -> &AnomalyDetectionSettings {
        &self.settings
    }

    /// 停止して、検知ループが処理したイベント数を返す
    ///
    /// 再学習タスクには設定の猶予時間だけ完了を待ち、超えた場合は中断する。
    pub async fn shutdown(self) -> Result<u64> {
        info!("Shutting down detection engine");
        self.cancel.cancel();

        let processed = self
            .consumer
            .await
            .map_err(|e| Error::Internal(format!("consumer task failed: {}", e)))?;

        if let Some(retrain) = self.retrain {
            retrain
                .shutdown(self.settings.retrain_shutdown_grace())
                .await;
        }

        info!("Detection engine stopped ({} events processed)", processed);
        Ok(processed)
    }
}
