//! Detection Metrics
//!
//! Prometheusメトリクスの収集とエクスポート

use prometheus::{Gauge, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

use super::ml::{TrainingKind, TrainingListener};
use super::types::AnomalyReason;

/// 検知メトリクス
#[derive(Debug, Clone)]
pub struct DetectionMetrics {
    /// 検知した異常の総数（理由・検知器別）
    anomalies_total: IntCounterVec,
    /// 処理した特徴イベントの総数
    events_observed_total: IntCounter,
    /// 特徴ストリームで破棄されたイベントの総数
    feature_events_dropped_total: IntCounter,
    /// モデル有効化の総数（経緯別）
    model_trainings_total: IntCounterVec,
    /// 現在のしきい値
    model_threshold: Gauge,
    /// Prometheusレジストリ
    registry: Arc<Registry>,
}

impl DetectionMetrics {
    /// 新しいメトリクスインスタンスを作成
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Arc::new(Registry::new());

        let anomalies_total = IntCounterVec::new(
            Opts::new("aegis_anomalies_total", "Total number of detected anomalies"),
            &["reason", "detector"],
        )?;
        registry.register(Box::new(anomalies_total.clone()))?;

        let events_observed_total = IntCounter::new(
            "aegis_feature_events_observed_total",
            "Total number of feature events evaluated by the detector",
        )?;
        registry.register(Box::new(events_observed_total.clone()))?;

        let feature_events_dropped_total = IntCounter::new(
            "aegis_feature_events_dropped_total",
            "Total number of feature events dropped because the stream was full",
        )?;
        registry.register(Box::new(feature_events_dropped_total.clone()))?;

        let model_trainings_total = IntCounterVec::new(
            Opts::new(
                "aegis_model_trainings_total",
                "Total number of anomaly model activations",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(model_trainings_total.clone()))?;

        let model_threshold = Gauge::new(
            "aegis_model_threshold",
            "Decision threshold of the active anomaly model",
        )?;
        registry.register(Box::new(model_threshold.clone()))?;

        Ok(Self {
            anomalies_total,
            events_observed_total,
            feature_events_dropped_total,
            model_trainings_total,
            model_threshold,
            registry,
        })
    }

    /// 異常をカウント
    pub fn record_anomaly(&self, reason: AnomalyReason) {
        self.anomalies_total
            .with_label_values(&[reason.as_str(), reason.detector_tag()])
            .inc();
    }

    pub fn record_observed(&self) {
        self.events_observed_total.inc();
    }

    /// ストリームの破棄数の累計に追従させる
    pub fn sync_dropped(&self, total: u64) {
        let current = self.feature_events_dropped_total.get();
        if total > current {
            self.feature_events_dropped_total.inc_by(total - current);
        }
    }

    pub fn anomaly_count(&self, reason: AnomalyReason) -> u64 {
        self.anomalies_total
            .with_label_values(&[reason.as_str(), reason.detector_tag()])
            .get()
    }

    pub fn dropped_count(&self) -> u64 {
        self.feature_events_dropped_total.get()
    }

    pub fn training_count(&self, kind: TrainingKind) -> u64 {
        self.model_trainings_total
            .with_label_values(&[kind.as_str()])
            .get()
    }

    pub fn threshold(&self) -> f64 {
        self.model_threshold.get()
    }

    /// Prometheusレジストリを取得
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// メトリクスをテキスト形式でエクスポート
    pub fn export_text(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer).unwrap_or_default())
    }
}

impl TrainingListener for DetectionMetrics {
    fn on_model_activated(&self, kind: TrainingKind, threshold: f64) {
        self.model_trainings_total
            .with_label_values(&[kind.as_str()])
            .inc();
        self.model_threshold.set(threshold);
    }
}
