//! Scorer Pool
//!
//! 1つの不変なモデルスナップショットに紐づくスコアリングハンドルのプール。
//! モデル差し替え時はプールごと差し替え、プールの中身を書き換えることはない。

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::features::FeatureVec;
use super::models::PcaModel;

/// スコアリング用の作業バッファ
#[derive(Debug)]
pub struct Scorer {
    normalized: Vec<f64>,
}

impl Scorer {
    fn new(dimension: usize) -> Self {
        Self {
            normalized: Vec::with_capacity(dimension),
        }
    }
}

/// スコアラープール
#[derive(Debug)]
pub struct ScorerPool {
    model: Arc<PcaModel>,
    idle: ArrayQueue<Scorer>,
    created: AtomicUsize,
}

impl ScorerPool {
    pub fn new(model: Arc<PcaModel>, capacity: usize) -> Self {
        Self {
            model,
            idle: ArrayQueue::new(capacity.max(1)),
            created: AtomicUsize::new(0),
        }
    }

    /// スコアラーを借りる（空なら新規作成）
    pub fn get(&self) -> PooledScorer<'_> {
        let scorer = self.idle.pop().unwrap_or_else(|| {
            self.created.fetch_add(1, Ordering::Relaxed);
            Scorer::new(self.model.dimension())
        });
        PooledScorer {
            pool: self,
            scorer: Some(scorer),
        }
    }

    /// 借りて1回スコアを計算して返す
    pub fn score(&self, vector: &FeatureVec) -> f64 {
        self.get().score(vector)
    }

    fn give_back(&self, scorer: Scorer) {
        // 満杯なら捨てる
        let _ = self.idle.push(scorer);
    }

    pub fn model(&self) -> &Arc<PcaModel> {
        &self.model
    }

    /// 待機中のスコアラー数
    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    /// これまでに作成したスコアラー数
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.idle.capacity()
    }
}

/// 借用中のスコアラー（drop でプールに戻る）
#[derive(Debug)]
pub struct PooledScorer<'a> {
    pool: &'a ScorerPool,
    scorer: Option<Scorer>,
}

impl PooledScorer<'_> {
    pub fn score(&mut self, vector: &FeatureVec) -> f64 {
        match self.scorer.as_mut() {
            Some(scorer) => self.pool.model.score_with(vector, &mut scorer.normalized),
            None => self.pool.model.score(vector),
        }
    }
}

impl Drop for PooledScorer<'_> {
    fn drop(&mut self) {
        if let Some(scorer) = self.scorer.take() {
            self.pool.give_back(scorer);
        }
    }
}
