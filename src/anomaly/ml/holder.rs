//! Model Holder
//!
//! 現在有効な (スコアラー, しきい値) の組を保持するセル。
//! 組は1つの `Arc<ActiveModel>` として丸ごと差し替えられ、読み手は古い組か新しい組の
//! どちらかしか観測しない。

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::features::{FeatureVec, RPS_INDEX};
use super::models::PcaModel;
use super::pool::ScorerPool;

/// スコアリング方式
#[derive(Debug)]
pub enum Scoring {
    /// 縮退データ用: スコア = RPS成分
    Fallback,
    /// 学習済みPCAモデル
    Model(ScorerPool),
}

/// 有効なモデルとそのしきい値
#[derive(Debug)]
pub struct ActiveModel {
    pub scoring: Scoring,
    /// このスコアリングで較正したしきい値
    pub threshold: f64,
    /// 学習に使ったサンプル数（永続化から復元した場合は0）
    pub training_samples: usize,
    pub trained_at: DateTime<Utc>,
    /// ホルダー内で単調増加するバージョン
    pub version: u64,
}

impl ActiveModel {
    pub fn fallback(threshold: f64, training_samples: usize, trained_at: DateTime<Utc>) -> Self {
        Self {
            scoring: Scoring::Fallback,
            threshold,
            training_samples,
            trained_at,
            version: 0,
        }
    }

    pub fn model(
        model: Arc<PcaModel>,
        pool_size: usize,
        threshold: f64,
        training_samples: usize,
        trained_at: DateTime<Utc>,
    ) -> Self {
        Self {
            scoring: Scoring::Model(ScorerPool::new(model, pool_size)),
            threshold,
            training_samples,
            trained_at,
            version: 0,
        }
    }

    /// スコアを計算（大きいほど異常）
    pub fn score(&self, vector: &FeatureVec) -> f64 {
        match &self.scoring {
            Scoring::Fallback => vector[RPS_INDEX],
            Scoring::Model(pool) => pool.score(vector),
        }
    }

    /// スコアと判定を返す（スコアはこの組のしきい値とだけ比較される）
    pub fn evaluate(&self, vector: &FeatureVec) -> (bool, f64) {
        let score = self.score(vector);
        (score > self.threshold, score)
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self.scoring, Scoring::Fallback)
    }

    pub fn pca_model(&self) -> Option<&Arc<PcaModel>> {
        match &self.scoring {
            Scoring::Fallback => None,
            Scoring::Model(pool) => Some(pool.model()),
        }
    }
}

/// モデルホルダー
#[derive(Debug, Default)]
pub struct ModelHolder {
    current: RwLock<Option<Arc<ActiveModel>>>,
    versions: AtomicU64,
}

impl ModelHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 現在のスナップショット（未学習なら None）
    pub fn load(&self) -> Option<Arc<ActiveModel>> {
        self.current.read().clone()
    }

    /// 丸ごと差し替え、以前のスナップショットを返す
    pub fn swap(&self, mut next: ActiveModel) -> (Arc<ActiveModel>, Option<Arc<ActiveModel>>) {
        next.version = self.versions.fetch_add(1, Ordering::AcqRel) + 1;
        let next = Arc::new(next);
        let previous = self.current.write().replace(Arc::clone(&next));
        (next, previous)
    }

    pub fn is_active(&self) -> bool {
        self.current.read().is_some()
    }

    pub fn threshold(&self) -> Option<f64> {
        self.current.read().as_ref().map(|m| m.threshold)
    }
}
