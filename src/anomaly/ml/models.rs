//! Anomaly Detection Models
//!
//! 正規化済み特徴量に対するPCAベースの外れ値スコアリングモデル。
//!
//! スコア = 保持した主成分上の Hotelling T²（固有値で正規化した射影の二乗和）
//!        + 主成分で説明できない残差の二乗（再構成誤差）
//!
//! スコアが大きいほど異常。分散がほぼ0の主成分は捨て、その方向のずれは再構成誤差に現れる。

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::features::{FeatureVec, FEATURE_DIM};
use crate::error::{Error, Result};

/// これ未満の標準偏差の次元はスケーリングせず中心化のみ行う
const SCALE_EPSILON: f64 = 1e-9;
/// 最大固有値に対してこれ以下の固有値の成分は捨てる
const RELATIVE_EIGEN_EPSILON: f64 = 1e-9;
const ABSOLUTE_EIGEN_EPSILON: f64 = 1e-12;
const MAX_JACOBI_SWEEPS: usize = 100;

/// PCAモデル
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PcaModel {
    /// 各特徴量の平均
    pub means: Vec<f64>,
    /// 各特徴量のスケール（標準偏差、縮退次元は1.0）
    pub scales: Vec<f64>,
    /// 主成分（単位ベクトル、固有値の降順）
    pub components: Vec<Vec<f64>>,
    /// 主成分ごとの固有値
    pub eigenvalues: Vec<f64>,
    /// 学習サンプル数
    pub sample_count: usize,
}

impl PcaModel {
    /// 学習サンプルからモデルを学習
    ///
    /// `rank` は特徴量次元数にクランプされる。
    pub fn fit(samples: &[FeatureVec], rank: usize) -> Result<Self> {
        if samples.len() < 2 {
            return Err(Error::Model(format!(
                "PCA needs at least 2 samples, got {}",
                samples.len()
            )));
        }

        let n = samples.len();
        let mut data = Array2::<f64>::zeros((n, FEATURE_DIM));
        for (mut row, sample) in data.axis_iter_mut(Axis(0)).zip(samples) {
            for (cell, value) in row.iter_mut().zip(sample) {
                *cell = *value;
            }
        }

        let means = data
            .mean_axis(Axis(0))
            .ok_or_else(|| Error::Model("empty training matrix".to_string()))?;
        let centered = &data - &means;
        let std_devs = centered
            .mapv(|v| v * v)
            .mean_axis(Axis(0))
            .ok_or_else(|| Error::Model("empty training matrix".to_string()))?
            .mapv(f64::sqrt);
        let scales = std_devs.mapv(|s| if s > SCALE_EPSILON { s } else { 1.0 });
        let normalized = &centered / &scales;

        let covariance = normalized.t().dot(&normalized) / n as f64;
        let (eigenvalues, eigenvectors) = symmetric_eigen(covariance)?;

        let mut order: Vec<usize> = (0..FEATURE_DIM).collect();
        order.sort_by(|&a, &b| eigenvalues[b].total_cmp(&eigenvalues[a]));

        let max_eigen = eigenvalues.iter().cloned().fold(0.0, f64::max);
        let cutoff = (max_eigen * RELATIVE_EIGEN_EPSILON).max(ABSOLUTE_EIGEN_EPSILON);
        let rank = rank.clamp(1, FEATURE_DIM);

        let mut components = Vec::with_capacity(rank);
        let mut kept_eigenvalues = Vec::with_capacity(rank);
        for &index in order.iter().take(rank) {
            if eigenvalues[index] > cutoff {
                components.push(eigenvectors.column(index).to_vec());
                kept_eigenvalues.push(eigenvalues[index]);
            }
        }

        let model = Self {
            means: means.to_vec(),
            scales: scales.to_vec(),
            components,
            eigenvalues: kept_eigenvalues,
            sample_count: n,
        };
        model.validate()?;

        debug!(
            "PCA fitted on {} samples: {} components, eigenvalues={:?}",
            n,
            model.components.len(),
            model.eigenvalues
        );
        Ok(model)
    }

    /// 構造と数値の整合性を検証（永続化からの読み込み時にも使う）
    pub fn validate(&self) -> Result<()> {
        if self.means.len() != FEATURE_DIM || self.scales.len() != FEATURE_DIM {
            return Err(Error::Model(format!(
                "expected {} dimensions, got means={} scales={}",
                FEATURE_DIM,
                self.means.len(),
                self.scales.len()
            )));
        }
        if self.components.len() != self.eigenvalues.len() {
            return Err(Error::Model(
                "component and eigenvalue counts differ".to_string(),
            ));
        }
        if self.components.len() > FEATURE_DIM {
            return Err(Error::Model("rank exceeds feature dimension".to_string()));
        }
        if self.components.iter().any(|c| c.len() != FEATURE_DIM) {
            return Err(Error::Model("component has wrong dimension".to_string()));
        }
        let all_finite = self
            .means
            .iter()
            .chain(&self.scales)
            .chain(&self.eigenvalues)
            .chain(self.components.iter().flatten())
            .all(|v| v.is_finite());
        if !all_finite {
            return Err(Error::Model("model contains non-finite values".to_string()));
        }
        if self.scales.iter().any(|s| *s <= 0.0) || self.eigenvalues.iter().any(|e| *e <= 0.0) {
            return Err(Error::Model(
                "scales and eigenvalues must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn dimension(&self) -> usize {
        self.means.len()
    }

    pub fn rank(&self) -> usize {
        self.components.len()
    }

    /// 作業バッファを再利用してスコアを計算
    pub fn score_with(&self, vector: &FeatureVec, normalized: &mut Vec<f64>) -> f64 {
        normalized.clear();
        normalized.extend(
            vector
                .iter()
                .zip(&self.means)
                .zip(&self.scales)
                .map(|((value, mean), scale)| (value - mean) / scale),
        );

        let total: f64 = normalized.iter().map(|v| v * v).sum();
        let mut t_squared = 0.0;
        let mut explained = 0.0;
        for (component, eigenvalue) in self.components.iter().zip(&self.eigenvalues) {
            let projection: f64 = component
                .iter()
                .zip(normalized.iter())
                .map(|(c, z)| c * z)
                .sum();
            let squared = projection * projection;
            t_squared += squared / eigenvalue;
            explained += squared;
        }
        let residual = (total - explained).max(0.0);

        t_squared + residual
    }

    /// スコアを計算（作業バッファを都度確保）
    pub fn score(&self, vector: &FeatureVec) -> f64 {
        let mut buffer = Vec::with_capacity(self.dimension());
        self.score_with(vector, &mut buffer)
    }
}

/// 対称行列の固有値分解（巡回Jacobi法）
///
/// 固有値と、列が固有ベクトルの行列を返す。
fn symmetric_eigen(mut a: Array2<f64>) -> Result<(Array1<f64>, Array2<f64>)> {
    let n = a.nrows();
    if n != a.ncols() {
        return Err(Error::Model("covariance matrix is not square".to_string()));
    }
    let mut v = Array2::<f64>::eye(n);

    for _ in 0..MAX_JACOBI_SWEEPS {
        let mut off_diagonal = 0.0;
        let mut diagonal = 0.0;
        for p in 0..n {
            diagonal += a[[p, p]] * a[[p, p]];
            for q in (p + 1)..n {
                off_diagonal += a[[p, q]] * a[[p, q]];
            }
        }
        if off_diagonal <= f64::EPSILON * f64::EPSILON * diagonal.max(f64::MIN_POSITIVE) {
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a[[p, q]];
                if apq == 0.0 {
                    continue;
                }
                let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..n {
                    let akp = a[[k, p]];
                    let akq = a[[k, q]];
                    a[[k, p]] = c * akp - s * akq;
                    a[[k, q]] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[[p, k]];
                    let aqk = a[[q, k]];
                    a[[p, k]] = c * apk - s * aqk;
                    a[[q, k]] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let vkp = v[[k, p]];
                    let vkq = v[[k, q]];
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }

    let eigenvalues = a.diag().to_owned();
    if eigenvalues.iter().any(|e| !e.is_finite()) {
        return Err(Error::Model("eigen decomposition diverged".to_string()));
    }
    Ok((eigenvalues, v))
}
