//! Anomaly Detection Configuration
//!
//! 起動時に1回だけ読み込まれ、以後は読み取り専用となる検知設定

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// 期間系の設定値の上限（365日）
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// 上限でクランプした秒数
fn clamped_secs(secs: u64) -> u64 {
    secs.min(MAX_DURATION_SECS)
}

/// 分を秒に換算して上限でクランプ
fn clamped_minutes(minutes: u64) -> u64 {
    clamped_secs(minutes.saturating_mul(60))
}

/// 検知モード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    /// ローリングウィンドウのルールのみ
    #[default]
    Rules,
    /// オンラインML検知のみ
    Ml,
    /// ルール → ML の順で判定
    Hybrid,
}

/// 外れ値スコアリングのアルゴリズム
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierAlgorithm {
    /// PCA（T² + 再構成誤差）
    #[default]
    Pca,
    /// Isolation Forest（未対応、構築時にエラー）
    IsolationForest,
}

/// モデル・しきい値の永続化先
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceSettings {
    /// モデル成果物（JSON）
    pub model_path: PathBuf,
    /// しきい値テキストファイル
    pub threshold_path: PathBuf,
    /// フォールバックモードを示すマーカーファイル
    pub fallback_marker_path: PathBuf,
}

impl PersistenceSettings {
    /// ディレクトリ配下に標準のファイル名で配置
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            model_path: dir.join("anomaly_model.json"),
            threshold_path: dir.join("anomaly_threshold.txt"),
            fallback_marker_path: dir.join("anomaly_fallback.marker"),
        }
    }
}

/// 異常検知設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyDetectionSettings {
    /// 検知モード
    pub mode: DetectionMode,
    /// RPSしきい値
    pub rps_threshold: f64,
    /// ウィンドウ内の4xx件数しきい値
    pub four_xx_threshold: u32,
    /// ウィンドウ内の5xx件数しきい値
    pub five_xx_threshold: u32,
    /// ウィンドウ内のWAFヒット件数しきい値
    pub waf_threshold: u32,
    /// User-Agentエントロピーの下限（bit）
    pub ua_entropy_threshold: f64,
    /// RPSウィンドウ（秒）
    pub rps_window_secs: u64,
    /// エラー系ウィンドウ（秒）
    pub error_window_secs: u64,
    /// アイドル状態のウィンドウを破棄するまでの時間（秒）
    pub window_ttl_secs: u64,
    /// アイドルウィンドウ掃除の最小間隔（秒）
    pub prune_interval_secs: u64,
    /// 特徴ストリームの容量
    pub feature_queue_capacity: usize,
    /// 外れ値アルゴリズム
    pub algorithm: OutlierAlgorithm,
    /// PCAのランク（特徴量次元数でクランプ）
    pub pca_rank: usize,
    /// 学習開始に必要なクリーンサンプル数
    pub baseline_sample_size: usize,
    /// ベースラインバッファの上限
    pub baseline_hard_cap: usize,
    /// 再学習に使うサンプルの期間（分）
    pub training_window_minutes: u64,
    /// 再学習間隔（分）
    pub retrain_interval_minutes: u64,
    /// しきい値に使うスコア分位点
    pub score_quantile: f64,
    /// 再学習に必要な最小サンプル数
    pub min_samples_guard: usize,
    /// これ未満の分散ではフォールバックスコアリングを使う
    pub min_variance_guard: f64,
    /// スコアラープールのサイズ
    pub scorer_pool_size: usize,
    /// シャットダウン時に再学習タスクを待つ時間（秒）
    pub retrain_shutdown_grace_secs: u64,
    /// 永続化設定（None の場合はメモリのみ）
    pub persistence: Option<PersistenceSettings>,
}

impl Default for AnomalyDetectionSettings {
    fn default() -> Self {
        Self {
            mode: DetectionMode::Rules,
            rps_threshold: 100.0,
            four_xx_threshold: 20,
            five_xx_threshold: 5,
            waf_threshold: 0,
            ua_entropy_threshold: 1.0,
            rps_window_secs: 1,
            error_window_secs: 60,
            window_ttl_secs: 600, // 10分
            prune_interval_secs: 60,
            feature_queue_capacity: 1000,
            algorithm: OutlierAlgorithm::Pca,
            pca_rank: 20,
            baseline_sample_size: 500,
            baseline_hard_cap: 10_000,
            training_window_minutes: 60,
            retrain_interval_minutes: 10,
            score_quantile: 0.995,
            min_samples_guard: 100,
            min_variance_guard: 1e-6,
            scorer_pool_size: num_cpus::get().max(1) * 2,
            retrain_shutdown_grace_secs: 5,
            persistence: None,
        }
    }
}

impl AnomalyDetectionSettings {
    /// 設定値の整合性を検証
    pub fn validate(&self) -> Result<()> {
        if self.feature_queue_capacity == 0 {
            return Err(Error::InvalidConfiguration(
                "feature_queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.rps_window_secs == 0 || self.error_window_secs == 0 {
            return Err(Error::InvalidConfiguration(
                "rule windows must be at least 1 second".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.score_quantile) {
            return Err(Error::InvalidConfiguration(format!(
                "score_quantile must be within [0, 1], got {}",
                self.score_quantile
            )));
        }
        if self.baseline_sample_size == 0 {
            return Err(Error::InvalidConfiguration(
                "baseline_sample_size must be greater than 0".to_string(),
            ));
        }
        if self.baseline_hard_cap < self.baseline_sample_size {
            return Err(Error::InvalidConfiguration(format!(
                "baseline_hard_cap ({}) is smaller than baseline_sample_size ({})",
                self.baseline_hard_cap, self.baseline_sample_size
            )));
        }
        if self.pca_rank == 0 {
            return Err(Error::InvalidConfiguration(
                "pca_rank must be greater than 0".to_string(),
            ));
        }
        if self.scorer_pool_size == 0 {
            return Err(Error::InvalidConfiguration(
                "scorer_pool_size must be greater than 0".to_string(),
            ));
        }
        if self.retrain_interval_minutes == 0 {
            return Err(Error::InvalidConfiguration(
                "retrain_interval_minutes must be greater than 0".to_string(),
            ));
        }
        for (name, secs) in [
            ("rps_window_secs", self.rps_window_secs),
            ("error_window_secs", self.error_window_secs),
            ("window_ttl_secs", self.window_ttl_secs),
            ("prune_interval_secs", self.prune_interval_secs),
            (
                "training_window_minutes",
                self.training_window_minutes.saturating_mul(60),
            ),
            (
                "retrain_interval_minutes",
                self.retrain_interval_minutes.saturating_mul(60),
            ),
            (
                "retrain_shutdown_grace_secs",
                self.retrain_shutdown_grace_secs,
            ),
        ] {
            if secs > MAX_DURATION_SECS {
                return Err(Error::InvalidConfiguration(format!(
                    "{} exceeds the maximum of {} seconds",
                    name, MAX_DURATION_SECS
                )));
            }
        }
        if !self.min_variance_guard.is_finite() || self.min_variance_guard < 0.0 {
            return Err(Error::InvalidConfiguration(
                "min_variance_guard must be a non-negative number".to_string(),
            ));
        }
        Ok(())
    }

    // アクセサは検証前の値でもパニックしないよう上限でクランプする

    pub fn rps_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(clamped_secs(self.rps_window_secs) as i64)
    }

    pub fn error_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(clamped_secs(self.error_window_secs) as i64)
    }

    pub fn window_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(clamped_secs(self.window_ttl_secs) as i64)
    }

    pub fn prune_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(clamped_secs(self.prune_interval_secs) as i64)
    }

    pub fn training_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(clamped_minutes(self.training_window_minutes) as i64)
    }

    pub fn retrain_interval(&self) -> Duration {
        Duration::from_secs(clamped_minutes(self.retrain_interval_minutes))
    }

    pub fn retrain_shutdown_grace(&self) -> Duration {
        Duration::from_secs(clamped_secs(self.retrain_shutdown_grace_secs))
    }
}
