//! Anomaly Detection Engine
//!
//! ゲートウェイのリアルタイム異常検知。
//!
//! - 特徴ストリーム: リクエストパスから検知ループへの有界・非ブロッキングなキュー
//! - ローリングルール検知: (クライアント, ルート) ごとのスライディングウィンドウ
//! - オンラインML検知: ベースライン学習、分位点しきい値、定期再学習、永続化
//! - ハイブリッド: ルール → ML の順で判定

pub mod clock;
pub mod config;
pub mod consumer;
pub mod engine;
pub mod hybrid;
#[cfg(feature = "prometheus")]
pub mod metrics;
pub mod ml;
pub mod rules;
pub mod stream;
pub mod types;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{AnomalyDetectionSettings, DetectionMode, OutlierAlgorithm, PersistenceSettings};
pub use consumer::{AnomalyConsumer, AnomalySink, AnomalyStats, FlaggedAnomaly};
pub use engine::{build_detectors, build_detectors_with, DetectionEngine, DetectorSet};
pub use hybrid::HybridDetector;
#[cfg(feature = "prometheus")]
pub use metrics::DetectionMetrics;
pub use ml::{MlAnomalyDetector, ModelPhase, ModelStatus, RetrainOutcome, SkipReason};
pub use rules::RollingRuleDetector;
pub use stream::FeatureStream;
pub use types::{
    normalize_route, user_agent_entropy, AnomalyReason, FeatureEvent, RequestSignal, Verdict,
};

/// 異常検知器
///
/// 構築後は読み取り専用で、複数スレッドから同時に `observe` できること。
pub trait AnomalyDetector: Send + Sync {
    /// 1イベントを観測して判定する
    fn observe(&self, event: &FeatureEvent) -> Verdict;

    /// ログ・メトリクス用の名前
    fn name(&self) -> &'static str;
}
