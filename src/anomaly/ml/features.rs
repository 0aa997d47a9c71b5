//! Feature Extraction
//!
//! 特徴イベントから固定次元の数値ベクトルを生成し、学習用の統計量を計算します。

use crate::anomaly::types::FeatureEvent;

/// 特徴量の次元数
pub const FEATURE_DIM: usize = 6;

/// 特徴量名（ベクトルの並び順）
pub const FEATURE_NAMES: [&str; FEATURE_DIM] = [
    "rps_estimate",
    "is_4xx",
    "is_5xx",
    "is_waf",
    "ua_entropy",
    "is_post",
];

/// RPS成分のインデックス（フォールバックスコア）
pub const RPS_INDEX: usize = 0;

/// 特徴量ベクトル
pub type FeatureVec = [f64; FEATURE_DIM];

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

/// イベントを特徴量ベクトルに変換
pub fn to_vector(event: &FeatureEvent) -> FeatureVec {
    [
        event.rps_estimate,
        flag(event.is_4xx()),
        flag(event.is_5xx()),
        flag(event.waf_hit),
        event.ua_entropy,
        flag(event.is_post()),
    ]
}

/// 次元ごとの平均
pub fn means(samples: &[FeatureVec]) -> FeatureVec {
    let mut means = [0.0; FEATURE_DIM];
    if samples.is_empty() {
        return means;
    }
    for sample in samples {
        for (mean, value) in means.iter_mut().zip(sample) {
            *mean += value;
        }
    }
    for mean in &mut means {
        *mean /= samples.len() as f64;
    }
    means
}

/// 次元ごとの母分散
pub fn variances(samples: &[FeatureVec]) -> FeatureVec {
    let mut variances = [0.0; FEATURE_DIM];
    if samples.is_empty() {
        return variances;
    }
    let means = means(samples);
    for sample in samples {
        for i in 0..FEATURE_DIM {
            let diff = sample[i] - means[i];
            variances[i] += diff * diff;
        }
    }
    for variance in &mut variances {
        *variance /= samples.len() as f64;
    }
    variances
}

/// 次元ごとの分散の合計（縮退判定に使う）
pub fn total_variance(samples: &[FeatureVec]) -> f64 {
    variances(samples).iter().sum()
}

/// ソート済み配列から分位点の値を取り出す
///
/// インデックスは `floor(q * (n - 1))` を `[0, n-1]` にクランプしたもの。
/// 配列外への外挿は行わない。
pub fn quantile_floor(sorted: &[f64], quantile: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let last = sorted.len() - 1;
    let q = if quantile.is_nan() {
        0.0
    } else {
        quantile.clamp(0.0, 1.0)
    };
    let index = ((q * last as f64).floor() as usize).min(last);
    Some(sorted[index])
}

/// 値をソートして分位点を計算
pub fn quantile_of(mut values: Vec<f64>, quantile: f64) -> Option<f64> {
    values.sort_by(|a, b| a.total_cmp(b));
    quantile_floor(&values, quantile)
}
