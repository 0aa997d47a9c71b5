//! Anomaly Detection Types
//!
//! 検知パイプラインを流れるイベントと判定結果の型定義

use serde::{Deserialize, Serialize};
use std::fmt;

/// クライアントIDが無い場合のキー
pub const UNKNOWN_CLIENT: &str = "unknown";

/// 完了した1リクエスト分のシグナル
///
/// リクエストミドルウェアがレスポンス完了後に1回だけ生成し、以降は変更されない。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureEvent {
    /// クライアント識別子（未認証の場合は None）
    pub client_id: Option<String>,
    /// 観測時点でのプラン別RPS推定値
    pub rps_estimate: f64,
    /// HTTPステータスコード
    pub status: u16,
    /// JSONスキーマ検証に失敗したか
    pub schema_error: bool,
    /// WAFでブロックされたか
    pub waf_hit: bool,
    /// HTTPメソッド
    pub method: String,
    /// 正規化済みルートキー（先頭2セグメント）
    pub route_key: String,
    /// User-Agent のシャノンエントロピー（bit）
    pub ua_entropy: f64,
}

/// ミドルウェアが把握している生のリクエスト情報
#[derive(Debug, Clone, Default)]
pub struct RequestSignal {
    pub client_id: Option<String>,
    pub rps_estimate: f64,
    pub status: u16,
    pub schema_error: bool,
    pub waf_hit: bool,
    pub method: String,
    pub path: String,
    pub user_agent: String,
}

impl FeatureEvent {
    /// 生のリクエスト情報から特徴イベントを作成
    pub fn from_request(signal: RequestSignal) -> Self {
        Self {
            route_key: normalize_route(&signal.path),
            ua_entropy: user_agent_entropy(&signal.user_agent),
            client_id: signal.client_id,
            rps_estimate: signal.rps_estimate,
            status: signal.status,
            schema_error: signal.schema_error,
            waf_hit: signal.waf_hit,
            method: signal.method,
        }
    }

    /// ウィンドウキー用のクライアントID
    pub fn client_key(&self) -> &str {
        self.client_id.as_deref().unwrap_or(UNKNOWN_CLIENT)
    }

    pub fn is_4xx(&self) -> bool {
        (400..500).contains(&self.status)
    }

    pub fn is_5xx(&self) -> bool {
        self.status >= 500
    }

    pub fn is_post(&self) -> bool {
        self.method.eq_ignore_ascii_case("POST")
    }

    /// ベースライン学習に使える「クリーン」なイベントか
    ///
    /// WAFヒットやスキーマエラーを含むイベントはベースラインを汚染するため除外する。
    pub fn is_clean(&self) -> bool {
        !self.waf_hit && !self.schema_error
    }
}

/// User-Agent文字列のシャノンエントロピー（bit/文字）
pub fn user_agent_entropy(user_agent: &str) -> f64 {
    let total = user_agent.chars().count();
    if total == 0 {
        return 0.0;
    }

    let mut counts: std::collections::HashMap<char, usize> = std::collections::HashMap::new();
    for c in user_agent.chars() {
        *counts.entry(c).or_insert(0) += 1;
    }

    counts
        .values()
        .map(|&count| {
            let p = count as f64 / total as f64;
            -p * p.log2()
        })
        .sum()
}

/// パスを先頭2セグメントのルートキーに正規化
pub fn normalize_route(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).take(2).collect();
    if segments.is_empty() {
        return "/".to_string();
    }
    format!("/{}", segments.join("/"))
}

/// 異常の理由
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnomalyReason {
    /// RPSがしきい値を超過
    #[serde(rename = "rps_spike")]
    RpsSpike,
    /// 4xxエラーの急増
    #[serde(rename = "4xx_spike")]
    FourXxSpike,
    /// 5xxエラーの急増
    #[serde(rename = "5xx_spike")]
    FiveXxSpike,
    /// WAFヒットの急増
    #[serde(rename = "waf_spike")]
    WafSpike,
    /// User-Agentのエントロピーが低すぎる
    #[serde(rename = "ua_low_entropy")]
    UaLowEntropy,
    /// MLモデルによる外れ値
    #[serde(rename = "ml_outlier")]
    MlOutlier,
}

impl AnomalyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyReason::RpsSpike => "rps_spike",
            AnomalyReason::FourXxSpike => "4xx_spike",
            AnomalyReason::FiveXxSpike => "5xx_spike",
            AnomalyReason::WafSpike => "waf_spike",
            AnomalyReason::UaLowEntropy => "ua_low_entropy",
            AnomalyReason::MlOutlier => "ml_outlier",
        }
    }

    /// メトリクス用の検知器タグ
    pub fn detector_tag(&self) -> &'static str {
        match self {
            AnomalyReason::MlOutlier => "ml",
            _ => "rules",
        }
    }
}

impl fmt::Display for AnomalyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 1イベントに対する判定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Normal,
    Anomaly(AnomalyReason),
}

impl Verdict {
    pub fn is_anomaly(&self) -> bool {
        matches!(self, Verdict::Anomaly(_))
    }

    pub fn reason(&self) -> Option<AnomalyReason> {
        match self {
            Verdict::Normal => None,
            Verdict::Anomaly(reason) => Some(*reason),
        }
    }

    /// 理由の文字列（正常時は空文字列）
    pub fn reason_str(&self) -> &'static str {
        self.reason().map(|r| r.as_str()).unwrap_or("")
    }
}
