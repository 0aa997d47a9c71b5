//! Model Persistence
//!
//! モデル成果物（JSON）としきい値テキストファイル、フォールバックマーカーの読み書き。
//! 書き込みは一時ファイル経由で置き換える。
//!
//! しきい値ファイルは `<kind> <threshold>`（kind は `model` / `fallback`）の形式で、
//! どちらのスコアに対するしきい値かを自身で持つ。途中で中断された保存でも、
//! 読み込み時にスコアとしきい値の組み合わせが食い違うことはない。

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::models::PcaModel;
use crate::anomaly::config::PersistenceSettings;
use crate::error::{Error, Result};

const FALLBACK_MARKER: &str = "fallback\n";
const MODEL_KIND: &str = "model";
const FALLBACK_KIND: &str = "fallback";

/// 永続化から復元した状態
#[derive(Debug, Clone, PartialEq)]
pub enum PersistedModel {
    /// フォールバックモード（スコア = RPS）
    Fallback { threshold: f64 },
    /// 学習済みモデル
    Model { model: PcaModel, threshold: f64 },
}

impl PersistedModel {
    pub fn threshold(&self) -> f64 {
        match self {
            PersistedModel::Fallback { threshold } | PersistedModel::Model { threshold, .. } => {
                *threshold
            }
        }
    }
}

/// モデルストア
#[derive(Debug, Clone)]
pub struct ModelStore {
    settings: PersistenceSettings,
}

impl ModelStore {
    pub fn new(settings: PersistenceSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &PersistenceSettings {
        &self.settings
    }

    /// 学習済みモデルとしきい値を保存（フォールバックマーカーは削除）
    ///
    /// モデルを書き換える前に古いしきい値を消すため、中断時は読み込みエラー（ウォームアップ）になる。
    pub fn save_model(&self, model: &PcaModel, threshold: f64) -> Result<()> {
        let json = serde_json::to_vec_pretty(model)?;
        remove_if_exists(&self.settings.threshold_path)?;
        write_atomic(&self.settings.model_path, &json)?;
        write_atomic(
            &self.settings.threshold_path,
            threshold_line(MODEL_KIND, threshold).as_bytes(),
        )?;
        remove_if_exists(&self.settings.fallback_marker_path)?;
        debug!(
            "Saved anomaly model to {}",
            self.settings.model_path.display()
        );
        Ok(())
    }

    /// フォールバックマーカーとしきい値を保存
    pub fn save_fallback(&self, threshold: f64) -> Result<()> {
        write_atomic(
            &self.settings.threshold_path,
            threshold_line(FALLBACK_KIND, threshold).as_bytes(),
        )?;
        write_atomic(
            &self.settings.fallback_marker_path,
            FALLBACK_MARKER.as_bytes(),
        )?;
        debug!(
            "Saved fallback marker to {}",
            self.settings.fallback_marker_path.display()
        );
        Ok(())
    }

    /// 保存済みの状態を読み込む
    ///
    /// 何も保存されていなければ `Ok(None)`。ファイルが壊れている場合はエラー。
    /// 種別はしきい値ファイルの記録に従い、記録の無い旧形式ではマーカーの有無で決める。
    pub fn load(&self) -> Result<Option<PersistedModel>> {
        let marker = self.settings.fallback_marker_path.exists();
        let model_exists = self.settings.model_path.exists();
        if !marker && !model_exists {
            return Ok(None);
        }
        if !self.settings.threshold_path.exists() {
            return Err(Error::Persistence(format!(
                "threshold file missing: {}",
                self.settings.threshold_path.display()
            )));
        }

        let (kind, threshold) = self.load_threshold()?;
        let fallback = match kind.as_deref() {
            Some(FALLBACK_KIND) => true,
            Some(_) => false,
            None => marker,
        };
        if fallback != marker {
            debug!(
                "Fallback marker disagrees with threshold file, using {}",
                if fallback { FALLBACK_KIND } else { MODEL_KIND }
            );
        }
        if fallback {
            return Ok(Some(PersistedModel::Fallback { threshold }));
        }
        if !model_exists {
            return Err(Error::Persistence(format!(
                "model file missing: {}",
                self.settings.model_path.display()
            )));
        }

        let bytes = fs::read(&self.settings.model_path)?;
        let model: PcaModel = serde_json::from_slice(&bytes)?;
        model.validate()?;
        Ok(Some(PersistedModel::Model { model, threshold }))
    }

    fn load_threshold(&self) -> Result<(Option<String>, f64)> {
        let text = fs::read_to_string(&self.settings.threshold_path)?;
        let text = text.trim();
        let (kind, value) = match text.split_once(char::is_whitespace) {
            Some((kind, value)) => match kind {
                MODEL_KIND | FALLBACK_KIND => (Some(kind.to_string()), value.trim()),
                _ => {
                    return Err(Error::Persistence(format!(
                        "unknown threshold kind: {:?}",
                        kind
                    )))
                }
            },
            None => (None, text),
        };
        let threshold: f64 = value
            .parse()
            .map_err(|_| Error::Persistence(format!("unparsable threshold: {:?}", text)))?;
        if !threshold.is_finite() {
            return Err(Error::Persistence(format!(
                "non-finite threshold: {}",
                threshold
            )));
        }
        Ok((kind, threshold))
    }
}

fn threshold_line(kind: &str, threshold: f64) -> String {
    format!("{} {}\n", kind, threshold)
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = temp_path(path);
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
