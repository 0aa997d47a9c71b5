//! Gateway Configuration
//!
//! 組み込みのデフォルト → TOMLファイル → 環境変数（`AEGIS_` 接頭辞、`__` 区切り）の順に
//! 重ねて読み込む。起動時に1回だけ読み込み、以後は読み取り専用。

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::anomaly::config::{AnomalyDetectionSettings, DetectionMode, PersistenceSettings};
use crate::error::Result;
use crate::logging::LogRotation;

/// ログ設定（設定ファイル用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub dir: PathBuf,
    pub rotation: LogRotation,
    pub console: bool,
    pub file: bool,
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: PathBuf::from("logs"),
            rotation: LogRotation::Daily,
            console: true,
            file: false,
            json: false,
        }
    }
}

/// ゲートウェイ設定
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub log: LogSettings,
    pub detection: AnomalyDetectionSettings,
}

impl GatewayConfig {
    /// 標準の場所から読み込む（`path` 指定時はそのファイルが必須）
    pub fn load(path: Option<&Path>) -> Result<Self> {
        ConfigLoader::new().load_from_file(path).load_from_env().build()
    }

    /// 設定値の検証
    pub fn validate(&self) -> Result<()> {
        self.detection.validate()
    }

    /// 説明付きのサンプル設定ファイルを生成
    pub fn sample_toml() -> Result<String> {
        let sample = GatewayConfig {
            log: LogSettings::default(),
            detection: AnomalyDetectionSettings {
                mode: DetectionMode::Hybrid,
                persistence: Some(PersistenceSettings::in_dir("data")),
                ..Default::default()
            },
        };
        let body = toml::to_string_pretty(&sample)
            .map_err(|e| crate::error::Error::Config(e.to_string()))?;

        Ok(format!(
            r#"# Aegis Gateway Configuration File
#
# このファイルは aegis.toml として保存してください
# 環境変数での上書きも可能です (例: AEGIS_DETECTION__MODE=ml, AEGIS_LOG__LEVEL=debug)

{}
# 設定説明:
#
# [detection]
# mode = rules | ml | hybrid
# rps_threshold / four_xx_threshold / five_xx_threshold / waf_threshold = ウィンドウ内のしきい値（超過で検知）
# ua_entropy_threshold = User-Agent エントロピーの下限（bit）
# algorithm = pca（isolation_forest は未対応で起動時エラー）
# baseline_sample_size = 学習開始に必要なクリーンサンプル数
# score_quantile = しきい値に使う学習スコアの分位点
# min_variance_guard = これ未満の分散ではRPSによるフォールバック判定を使う
#
# [detection.persistence]
# model_path / threshold_path / fallback_marker_path = 学習結果の保存先（省略時はメモリのみ）
"#,
            body
        ))
    }
}

/// 設定ローダー
#[derive(Debug, Default)]
pub struct ConfigLoader {
    config_file: Option<PathBuf>,
    load_env: bool,
    env_source: Option<HashMap<String, String>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// 設定ファイルを指定（None の場合は標準の場所を探す）
    pub fn load_from_file(mut self, path: Option<&Path>) -> Self {
        self.config_file = path.map(Path::to_path_buf);
        self
    }

    /// 環境変数から読み込む
    pub fn load_from_env(mut self) -> Self {
        self.load_env = true;
        self
    }

    /// プロセス環境の代わりに使う変数（テスト用）
    pub fn with_env_source(mut self, vars: HashMap<String, String>) -> Self {
        self.load_env = true;
        self.env_source = Some(vars);
        self
    }

    pub fn build(self) -> Result<GatewayConfig> {
        let mut builder = Config::builder().add_source(Config::try_from(&GatewayConfig::default())?);

        if let Some(path) = &self.config_file {
            builder = builder.add_source(File::from(path.as_path()).required(true));
        } else {
            builder = builder
                .add_source(File::with_name("aegis").required(false))
                .add_source(File::with_name("config/aegis").required(false));
        }

        if self.load_env {
            builder = builder.add_source(
                Environment::with_prefix("AEGIS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(self.env_source),
            );
        }

        let config: GatewayConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}
