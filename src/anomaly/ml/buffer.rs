//! Baseline Buffer
//!
//! 「クリーン」なトラフィックの特徴量ベクトルを保持する有界キュー。
//! 上限を超えると時刻に関係なく最古のエントリから捨てる。
//! 追加・読み出し・期限切れの除去はすべて短い排他区間で行い、到着順を保つ。

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;

use super::features::FeatureVec;

/// ベースラインのサンプル
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BaselineSample {
    pub observed_at: DateTime<Utc>,
    pub vector: FeatureVec,
}

/// ベースラインバッファ
#[derive(Debug)]
pub struct BaselineBuffer {
    samples: Mutex<VecDeque<BaselineSample>>,
    hard_cap: usize,
}

impl BaselineBuffer {
    pub fn new(hard_cap: usize) -> Self {
        let hard_cap = hard_cap.max(1);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(hard_cap.min(4096))),
            hard_cap,
        }
    }

    /// サンプルを追加（上限超過で最古を破棄した場合は true）
    pub fn push(&self, sample: BaselineSample) -> bool {
        let mut samples = self.samples.lock();
        let shed = if samples.len() >= self.hard_cap {
            samples.pop_front();
            true
        } else {
            false
        };
        samples.push_back(sample);
        shed
    }

    /// `cutoff` より古いサンプルを取り除き、除去数を返す
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut samples = self.samples.lock();
        let before = samples.len();
        samples.retain(|sample| sample.observed_at >= cutoff);
        before - samples.len()
    }

    /// 現在のサンプルのコピー（古い順）
    pub fn snapshot(&self) -> Vec<BaselineSample> {
        self.samples.lock().iter().copied().collect()
    }

    /// 現在の特徴量ベクトル（古い順）
    pub fn vectors(&self) -> Vec<FeatureVec> {
        self.samples.lock().iter().map(|s| s.vector).collect()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.hard_cap
    }
}
