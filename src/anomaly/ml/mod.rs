//! Online ML Anomaly Detection
//!
//! ベースライン収集、PCAによる外れ値スコアリング、分位点によるしきい値較正、
//! 定期再学習、モデルの永続化を提供します。

pub mod buffer;
pub mod detector;
pub mod features;
pub mod holder;
pub mod models;
pub mod persistence;
pub mod pool;
pub mod retrain;

pub use buffer::{BaselineBuffer, BaselineSample};
pub use detector::{
    MlAnomalyDetector, ModelPhase, ModelStatus, RetrainOutcome, SkipReason, TrainingKind,
    TrainingListener,
};
pub use features::{FeatureVec, FEATURE_DIM, FEATURE_NAMES};
pub use holder::{ActiveModel, ModelHolder};
pub use models::PcaModel;
pub use persistence::{ModelStore, PersistedModel};
pub use pool::ScorerPool;
pub use retrain::{RetrainReport, RetrainScheduler};
