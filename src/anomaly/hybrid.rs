//! Hybrid Detector
//!
//! ルール検知器とML検知器を順に評価する。両方が毎回イベントを観測し
//! （MLのベースライン蓄積を途切れさせないため）、判定はルールの結果を優先する。

use std::sync::Arc;

use super::ml::MlAnomalyDetector;
use super::rules::RollingRuleDetector;
use super::types::{FeatureEvent, Verdict};
use super::AnomalyDetector;

/// ハイブリッド検知器
#[derive(Debug)]
pub struct HybridDetector {
    rules: Arc<RollingRuleDetector>,
    ml: Arc<MlAnomalyDetector>,
}

impl HybridDetector {
    pub fn new(rules: Arc<RollingRuleDetector>, ml: Arc<MlAnomalyDetector>) -> Self {
        Self { rules, ml }
    }

    pub fn observe(&self, event: &FeatureEvent) -> Verdict {
        let rule_verdict = self.rules.observe(event);
        let ml_verdict = self.ml.observe(event);
        if rule_verdict.is_anomaly() {
            rule_verdict
        } else {
            ml_verdict
        }
    }

    pub fn rules(&self) -> &Arc<RollingRuleDetector> {
        &self.rules
    }

    pub fn ml(&self) -> &Arc<MlAnomalyDetector> {
        &self.ml
    }
}

impl AnomalyDetector for HybridDetector {
    fn observe(&self, event: &FeatureEvent) -> Verdict {
        HybridDetector::observe(self, event)
    }

    fn name(&self) -> &'static str {
        "hybrid"
    }
}
