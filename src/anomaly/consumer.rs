//! Feature Consumer
//!
//! 特徴ストリームからイベントを到着順に取り出し、構成済みの検知器で判定するループ。
//! 検知した異常はシンクに溜め、インシデント集約側が `drain` で回収する。

use chrono::{DateTime, Utc};
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::clock::SharedClock;
#[cfg(feature = "prometheus")]
use super::metrics::DetectionMetrics;
use super::stream::FeatureStream;
use super::types::{AnomalyReason, FeatureEvent, Verdict};
use super::AnomalyDetector;

/// 検知された異常
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlaggedAnomaly {
    pub event: FeatureEvent,
    pub reason: AnomalyReason,
    pub detected_at: DateTime<Utc>,
}

/// 検知統計
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyStats {
    pub total_observed: u64,
    pub total_anomalies: u64,
    pub by_reason: HashMap<String, u64>,
    pub last_detection: Option<DateTime<Utc>>,
}

/// 異常シンク
#[derive(Debug, Default)]
pub struct AnomalySink {
    pending: SegQueue<FlaggedAnomaly>,
    observed: AtomicU64,
    anomalies: AtomicU64,
    by_reason: DashMap<AnomalyReason, u64>,
    last_detection: Mutex<Option<DateTime<Utc>>>,
}

impl AnomalySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_observed(&self) {
        self.observed.fetch_add(1, Ordering::Relaxed);
    }

    /// 異常を追加
    pub fn push(&self, anomaly: FlaggedAnomaly) {
        self.anomalies.fetch_add(1, Ordering::Relaxed);
        *self.by_reason.entry(anomaly.reason).or_insert(0) += 1;
        {
            let mut last = self.last_detection.lock();
            if last.map_or(true, |at| anomaly.detected_at > at) {
                *last = Some(anomaly.detected_at);
            }
        }
        self.pending.push(anomaly);
    }

    /// 溜まっている異常をすべて取り出す（検知順）
    pub fn drain(&self) -> Vec<FlaggedAnomaly> {
        let mut drained = Vec::with_capacity(self.pending.len());
        while let Some(anomaly) = self.pending.pop() {
            drained.push(anomaly);
        }
        drained
    }

    /// 未回収の異常数
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// 累計の統計
    pub fn stats(&self) -> AnomalyStats {
        AnomalyStats {
            total_observed: self.observed.load(Ordering::Relaxed),
            total_anomalies: self.anomalies.load(Ordering::Relaxed),
            by_reason: self
                .by_reason
                .iter()
                .map(|entry| (entry.key().as_str().to_string(), *entry.value()))
                .collect(),
            last_detection: *self.last_detection.lock(),
        }
    }
}

/// 検知ループ
pub struct AnomalyConsumer {
    stream: Arc<FeatureStream>,
    detector: Arc<dyn AnomalyDetector>,
    sink: Arc<AnomalySink>,
    clock: SharedClock,
    #[cfg(feature = "prometheus")]
    metrics: Option<Arc<DetectionMetrics>>,
}

impl AnomalyConsumer {
    pub fn new(
        stream: Arc<FeatureStream>,
        detector: Arc<dyn AnomalyDetector>,
        sink: Arc<AnomalySink>,
        clock: SharedClock,
    ) -> Self {
        Self {
            stream,
            detector,
            sink,
            clock,
            #[cfg(feature = "prometheus")]
            metrics: None,
        }
    }

    #[cfg(feature = "prometheus")]
    pub fn with_metrics(mut self, metrics: Arc<DetectionMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// 1イベントを判定してシンクに反映
    pub fn process(&self, event: FeatureEvent) -> Verdict {
        let verdict = self.detector.observe(&event);
        self.sink.record_observed();

        #[cfg(feature = "prometheus")]
        if let Some(metrics) = &self.metrics {
            metrics.record_observed();
            metrics.sync_dropped(self.stream.dropped_count());
        }

        if let Verdict::Anomaly(reason) = verdict {
            warn!("Anomaly {} for {}", reason, event.route_key);

            #[cfg(feature = "prometheus")]
            if let Some(metrics) = &self.metrics {
                metrics.record_anomaly(reason);
            }

            self.sink.push(FlaggedAnomaly {
                event,
                reason,
                detected_at: self.clock.now(),
            });
        }
        verdict
    }

    /// キャンセルされるまでストリームを処理し、処理件数を返す
    pub async fn run(self, cancel: CancellationToken) -> u64 {
        info!("Anomaly consumer started (detector: {})", self.detector.name());
        let mut events = Box::pin(self.stream.dequeue_all(cancel));
        let mut processed = 0u64;
        while let Some(event) = events.next().await {
            self.process(event);
            processed += 1;
        }
        info!("Anomaly consumer stopped after {} events", processed);
        processed
    }
}
