//! Anomaly Detection Integration Tests
//!
//! ルール検知・ML検知・ハイブリッド構成を公開APIから統合的にテストします。

use aegis_gateway::anomaly::ml::ModelStore;
use aegis_gateway::anomaly::{
    build_detectors, AnomalyDetectionSettings, AnomalyDetector, AnomalyReason, DetectionMode, FeatureEvent,
    HybridDetector, ManualClock, MlAnomalyDetector, ModelPhase, OutlierAlgorithm,
    PersistenceSettings, RetrainOutcome, RollingRuleDetector, Verdict,
};
use aegis_gateway::Error;
use chrono::Duration;
use std::fs;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

/// テスト用の特徴イベントを作成
fn feature(client: &str, rps: f64, entropy: f64, route: &str, status: u16) -> FeatureEvent {
    FeatureEvent {
        client_id: Some(client.to_string()),
        rps_estimate: rps,
        status,
        schema_error: false,
        waf_hit: false,
        method: "GET".to_string(),
        route_key: route.to_string(),
        ua_entropy: entropy,
    }
}

fn waf(mut event: FeatureEvent) -> FeatureEvent {
    event.waf_hit = true;
    event
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::starting_now())
}

fn ml_settings(baseline: usize) -> AnomalyDetectionSettings {
    AnomalyDetectionSettings {
        mode: DetectionMode::Ml,
        baseline_sample_size: baseline,
        training_window_minutes: 60,
        retrain_interval_minutes: 60,
        ..Default::default()
    }
}

fn persisted_in(dir: &TempDir, settings: AnomalyDetectionSettings) -> AnomalyDetectionSettings {
    AnomalyDetectionSettings {
        persistence: Some(PersistenceSettings::in_dir(dir.path())),
        ..settings
    }
}

// ---------------------------------------------------------------------------
// ルール検知
// ---------------------------------------------------------------------------

#[test]
fn test_rules_detector_detects_spikes() {
    let settings = AnomalyDetectionSettings {
        rps_threshold: 5.0,
        four_xx_threshold: 1,
        five_xx_threshold: 0,
        waf_threshold: 0,
        ua_entropy_threshold: 1.0,
        ..Default::default()
    };
    let detector = RollingRuleDetector::new(settings, clock());

    // 1秒ウィンドウで5件を超えるとRPSスパイク
    for i in 0..6 {
        let verdict = detector.observe(&feature("c1", 0.0, 5.0, "/r1", 200));
        if i < 5 {
            assert_eq!(verdict, Verdict::Normal, "event {} should be normal", i + 1);
        }
    }
    assert_eq!(
        detector.observe(&feature("c1", 0.0, 5.0, "/r1", 200)),
        Verdict::Anomaly(AnomalyReason::RpsSpike)
    );

    // 別のクライアント/ルートで4xxしきい値超過
    detector.observe(&feature("c2", 0.0, 5.0, "/r2", 404));
    assert_eq!(
        detector.observe(&feature("c2", 0.0, 5.0, "/r2", 404)),
        Verdict::Anomaly(AnomalyReason::FourXxSpike)
    );

    // しきい値0なら5xxは1件で検知
    assert_eq!(
        detector.observe(&feature("c3", 0.0, 5.0, "/r3", 500)),
        Verdict::Anomaly(AnomalyReason::FiveXxSpike)
    );

    // WAFヒットは初回で検知
    assert_eq!(
        detector.observe(&waf(feature("c4", 0.0, 5.0, "/r4", 200))),
        Verdict::Anomaly(AnomalyReason::WafSpike)
    );

    // User-Agentエントロピーが低い
    let verdict = detector.observe(&feature("c5", 0.0, 0.0, "/r5", 200));
    assert_eq!(verdict, Verdict::Anomaly(AnomalyReason::UaLowEntropy));
    assert_eq!(verdict.reason_str(), "ua_low_entropy");
}

#[test]
fn test_rules_detector_isolates_routes_per_client() {
    let settings = AnomalyDetectionSettings {
        rps_threshold: 1.0,
        ..Default::default()
    };
    let detector = RollingRuleDetector::new(settings, clock());

    detector.observe(&feature("c", 0.0, 5.0, "/r1", 200));
    assert_eq!(
        detector.observe(&feature("c", 0.0, 5.0, "/r1", 200)),
        Verdict::Anomaly(AnomalyReason::RpsSpike)
    );

    // 同じクライアントでも別ルートには影響しない
    assert_eq!(
        detector.observe(&feature("c", 0.0, 5.0, "/r2", 200)),
        Verdict::Normal
    );
    assert_eq!(detector.window_count(), 2);
}

#[test]
fn test_rules_report_first_violated_check() {
    let settings = AnomalyDetectionSettings {
        rps_threshold: 1.0,
        four_xx_threshold: 0,
        waf_threshold: 0,
        ..Default::default()
    };
    let detector = RollingRuleDetector::new(settings, clock());

    // 4xx と WAF の両方に該当する最初のイベントは 4xx が優先
    let event = waf(feature("c", 0.0, 0.0, "/r", 404));
    assert_eq!(
        detector.observe(&event),
        Verdict::Anomaly(AnomalyReason::FourXxSpike)
    );
    // 2件目はRPSが最優先
    assert_eq!(
        detector.observe(&event),
        Verdict::Anomaly(AnomalyReason::RpsSpike)
    );
}

#[test]
fn test_rules_window_expires() {
    let settings = AnomalyDetectionSettings {
        rps_threshold: 2.0,
        five_xx_threshold: 1,
        error_window_secs: 60,
        ..Default::default()
    };
    let clock = clock();
    let detector = RollingRuleDetector::new(settings, clock.clone());

    detector.observe(&feature("c", 0.0, 5.0, "/r", 503));
    detector.observe(&feature("c", 0.0, 5.0, "/r", 503));
    clock.advance(Duration::seconds(61));

    // 古い5xxはウィンドウ外
    assert_eq!(
        detector.observe(&feature("c", 0.0, 5.0, "/r", 503)),
        Verdict::Normal
    );
}

// ---------------------------------------------------------------------------
// ML検知
// ---------------------------------------------------------------------------

#[test]
fn test_ml_detector_warms_up_and_scores() {
    let ml = MlAnomalyDetector::new(ml_settings(3), clock()).unwrap();

    for _ in 0..3 {
        assert_eq!(ml.observe(&feature("c", 1.0, 5.0, "/r", 200)), Verdict::Normal);
    }
    assert!(ml.is_trained());

    let verdict = ml.observe(&feature("c", 50.0, 5.0, "/r", 200));
    assert_eq!(verdict, Verdict::Anomaly(AnomalyReason::MlOutlier));
    assert_eq!(verdict.reason_str(), "ml_outlier");
}

#[test]
fn test_ml_detector_isolation_forest_fails_fast() {
    let settings = AnomalyDetectionSettings {
        algorithm: OutlierAlgorithm::IsolationForest,
        ..ml_settings(3)
    };

    let result = MlAnomalyDetector::new(settings.clone(), clock());
    assert!(matches!(result, Err(Error::NotSupported(_))));

    let result = build_detectors(&settings, clock());
    assert!(matches!(result, Err(Error::NotSupported(_))));
}

#[test]
fn test_ml_detector_detects_labeled_dataset() {
    let ml = MlAnomalyDetector::new(ml_settings(80), clock()).unwrap();

    for _ in 0..80 {
        ml.observe(&feature("c", 1.0, 5.0, "/r", 200));
    }

    let false_positives = (0..80)
        .filter(|_| ml.observe(&feature("c", 1.0, 5.0, "/r", 200)).is_anomaly())
        .count();
    let true_positives = (0..20)
        .filter(|_| ml.observe(&feature("c", 50.0, 5.0, "/r", 200)).is_anomaly())
        .count();

    assert!(true_positives >= 15, "tp = {}", true_positives);
    assert!(false_positives <= 1, "fp = {}", false_positives);
}

#[test]
fn test_ml_detector_excludes_dirty_samples_from_baseline() {
    let dir = TempDir::new().unwrap();
    let settings = persisted_in(
        &dir,
        AnomalyDetectionSettings {
            score_quantile: 0.99,
            min_variance_guard: 999.0,
            ..ml_settings(10)
        },
    );
    let ml = MlAnomalyDetector::new(settings, clock()).unwrap();

    // スキーマエラー・WAFヒットのみではベースラインが完成しない
    for i in 0..10 {
        let mut event = feature("c", 1.0, 5.0, "/r", 200);
        if i % 2 == 0 {
            event.schema_error = true;
        } else {
            event.waf_hit = true;
        }
        ml.observe(&event);
    }
    assert_eq!(ml.baseline_len(), 0);
    assert_eq!(
        ml.observe(&feature("c", 50.0, 5.0, "/r", 200)),
        Verdict::Normal
    );

    // 上の1件を含めてクリーンなサンプルで規定数に到達させる
    for _ in 0..9 {
        ml.observe(&feature("c", 1.0, 5.0, "/r", 200));
    }
    assert!(ml.is_trained());
    assert_eq!(
        ml.observe(&feature("c", 50.0, 5.0, "/r", 200)),
        Verdict::Anomaly(AnomalyReason::MlOutlier)
    );
}

#[test]
fn test_ml_detector_constant_feature_does_not_nan() {
    let settings = AnomalyDetectionSettings {
        min_samples_guard: 5,
        min_variance_guard: 1e-6,
        ..ml_settings(10)
    };
    let ml = MlAnomalyDetector::new(settings, clock()).unwrap();

    // UAエントロピーは一定、RPSとメソッドが変化
    for i in 0..10 {
        let mut event = feature("c", 1.0 + (i % 2) as f64, 7.0, "/r", 200);
        event.method = if i % 2 == 0 { "GET" } else { "POST" }.to_string();
        ml.observe(&event);
    }

    let status = ml.status();
    assert_eq!(status.phase, ModelPhase::Model);
    assert!(status.threshold.unwrap().is_finite());
    assert_eq!(
        ml.observe(&feature("c", 50.0, 7.0, "/r", 200)),
        Verdict::Anomaly(AnomalyReason::MlOutlier)
    );
}

#[test]
fn test_ml_quantile_controls_false_positives_with_fallback_scoring() {
    let settings = AnomalyDetectionSettings {
        score_quantile: 0.90,
        min_variance_guard: 999.0,
        ..ml_settings(100)
    };
    let ml = MlAnomalyDetector::new(settings, clock()).unwrap();

    // RPS 1 と 2 を交互に投入 → 90パーセンタイル（floor index 89）は 2
    for i in 0..100 {
        let rps = if i % 2 == 0 { 1.0 } else { 2.0 };
        ml.observe(&feature("c", rps, 5.0, "/r", 200));
    }
    assert_eq!(ml.status().phase, ModelPhase::Fallback);
    assert_eq!(ml.threshold(), Some(2.0));

    let false_positives = (0..100)
        .filter(|_| ml.observe(&feature("c", 1.5, 5.0, "/r", 200)).is_anomaly())
        .count();
    let true_positives = (0..20)
        .filter(|_| ml.observe(&feature("c", 3.0, 5.0, "/r", 200)).is_anomaly())
        .count();

    assert_eq!(false_positives, 0);
    assert_eq!(true_positives, 20);
}

#[test]
fn test_ml_detector_persists_and_reloads_fallback() {
    let dir = TempDir::new().unwrap();
    let settings = persisted_in(
        &dir,
        AnomalyDetectionSettings {
            min_samples_guard: 5,
            training_window_minutes: 1,
            score_quantile: 0.99,
            min_variance_guard: 999.0,
            ..ml_settings(10)
        },
    );

    let ml1 = MlAnomalyDetector::new(settings.clone(), clock()).unwrap();
    for _ in 0..10 {
        ml1.observe(&feature("c", 1.0, 5.0, "/r", 200));
    }
    assert!(!ml1.observe(&feature("c", 1.0, 5.0, "/r", 200)).is_anomaly());
    assert!(ml1.observe(&feature("c", 50.0, 5.0, "/r", 200)).is_anomaly());

    // 新しいインスタンスはウォームアップなしで有効
    let ml2 = MlAnomalyDetector::new(settings, clock()).unwrap();
    assert_eq!(ml2.status().phase, ModelPhase::Fallback);
    assert!(ml2.observe(&feature("c", 50.0, 5.0, "/r", 200)).is_anomaly());
    assert!(!ml2.observe(&feature("c", 1.0, 5.0, "/r", 200)).is_anomaly());
}

#[test]
fn test_ml_detector_persists_and_reloads_model() {
    let dir = TempDir::new().unwrap();
    let settings = persisted_in(
        &dir,
        AnomalyDetectionSettings {
            score_quantile: 0.99,
            ..ml_settings(30)
        },
    );

    let ml1 = MlAnomalyDetector::new(settings.clone(), clock()).unwrap();
    for i in 0..30 {
        let mut event = feature("c", 1.0 + (i % 3) as f64, 4.0, "/r", 200);
        if i % 5 == 0 {
            event.method = "POST".to_string();
        }
        ml1.observe(&event);
    }
    assert_eq!(ml1.status().phase, ModelPhase::Model);

    let ml2 = MlAnomalyDetector::new(settings, clock()).unwrap();
    assert_eq!(ml2.status().phase, ModelPhase::Model);
    assert_eq!(ml2.threshold(), ml1.threshold());

    let checks = [
        feature("c", 2.0, 4.0, "/r", 200),
        feature("c", 50.0, 4.0, "/r", 200),
        feature("c", 1.0, 0.5, "/r", 200),
        feature("c", 3.0, 4.0, "/r", 404),
    ];
    for check in &checks {
        assert_eq!(ml1.observe(check), ml2.observe(check), "event {:?}", check);
    }
    assert!(ml2.observe(&checks[1]).is_anomaly());
}

#[test]
fn test_ml_detector_corrupt_persistence_falls_back_to_warm_up() {
    let dir = TempDir::new().unwrap();
    let settings = persisted_in(
        &dir,
        AnomalyDetectionSettings {
            min_variance_guard: 999.0,
            ..ml_settings(5)
        },
    );
    let paths = settings.persistence.clone().unwrap();
    fs::write(&paths.model_path, "not-a-valid-model").unwrap();
    fs::write(&paths.threshold_path, "NaN").unwrap();

    let ml = MlAnomalyDetector::new(settings.clone(), clock()).unwrap();
    assert_eq!(ml.status().phase, ModelPhase::WarmUp);
    assert_eq!(
        ml.observe(&feature("c", 50.0, 5.0, "/r", 200)),
        Verdict::Normal
    );

    for _ in 0..4 {
        ml.observe(&feature("c", 1.0, 5.0, "/r", 200));
    }
    assert!(ml.is_trained());

    // 学習結果で壊れたファイルが置き換えられている
    let store = ModelStore::new(paths);
    assert!(store.load().unwrap().is_some());
    let reloaded = MlAnomalyDetector::new(settings, clock()).unwrap();
    assert!(reloaded.is_trained());
}

#[test]
fn test_ml_retrain_recalibrates_threshold_upward() {
    let dir = TempDir::new().unwrap();
    let settings = persisted_in(
        &dir,
        AnomalyDetectionSettings {
            min_samples_guard: 10,
            min_variance_guard: 1e-6,
            score_quantile: 0.95,
            ..ml_settings(30)
        },
    );
    let ml = MlAnomalyDetector::new(settings, clock()).unwrap();

    for i in 0..30 {
        ml.observe(&feature("c", 1.0 + (i % 2) as f64, 3.0, "/r", 200));
    }
    let before = ml.threshold().unwrap();

    // 正常トラフィックがより高いRPSへドリフト
    for i in 0..50 {
        ml.observe(&feature("c", 3.0 + (i % 2) as f64, 3.0, "/r", 200));
    }
    let outcome = ml.retrain();
    assert!(matches!(outcome, RetrainOutcome::Retrained { samples: 80, .. }));

    let after = ml.threshold().unwrap();
    assert!(after > before, "expected {} > {}", after, before);
}

#[test]
fn test_ml_retrain_excludes_samples_outside_training_window() {
    let settings = AnomalyDetectionSettings {
        training_window_minutes: 60,
        min_samples_guard: 10,
        score_quantile: 0.5,
        min_variance_guard: 999.0,
        ..ml_settings(10)
    };
    let clock = clock();
    let ml = MlAnomalyDetector::new(settings, clock.clone()).unwrap();

    for _ in 0..10 {
        ml.observe(&feature("c", 1.0, 5.0, "/r", 200));
    }
    assert_eq!(ml.threshold(), Some(1.0));

    clock.advance(Duration::minutes(120));
    for _ in 0..10 {
        ml.observe(&feature("c", 5.0, 5.0, "/r", 200));
    }
    assert_eq!(ml.baseline_len(), 20);

    // 古いサンプルが残っていれば中央値は 1.0 になる
    assert_eq!(
        ml.retrain(),
        RetrainOutcome::Recalibrated {
            threshold: 5.0,
            samples: 10
        }
    );
    assert_eq!(ml.baseline_len(), 10);
}

#[test]
fn test_ml_retrain_without_fresh_samples_keeps_model() {
    let settings = AnomalyDetectionSettings {
        training_window_minutes: 1,
        min_samples_guard: 5,
        ..ml_settings(20)
    };
    let clock = clock();
    let ml = MlAnomalyDetector::new(settings, clock.clone()).unwrap();
    for i in 0..20 {
        ml.observe(&feature("c", 1.0 + (i % 4) as f64, 5.0, "/r", 200));
    }
    let status = ml.status();

    clock.advance(Duration::minutes(10));
    assert!(ml.retrain().is_skipped());

    let after = ml.status();
    assert_eq!(after.phase, status.phase);
    assert_eq!(after.threshold, status.threshold);
    assert_eq!(after.version, status.version);
}

#[test]
fn test_concurrent_observe_against_trained_model() {
    let settings = AnomalyDetectionSettings {
        score_quantile: 0.99,
        scorer_pool_size: 4,
        ..ml_settings(30)
    };
    let ml = Arc::new(MlAnomalyDetector::new(settings, clock()).unwrap());
    for i in 0..30 {
        ml.observe(&feature("c", 1.0 + (i % 3) as f64, 4.0, "/r", 200));
    }
    assert!(ml.is_trained());

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let ml = Arc::clone(&ml);
            thread::spawn(move || {
                for i in 0..625 {
                    let spike = (t + i) % 10 == 0;
                    let rps = if spike { 50.0 } else { 2.0 };
                    let verdict = ml.observe(&feature("c", rps, 4.0, "/r", 200));
                    assert_eq!(verdict.is_anomaly(), spike);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_concurrent_observe_during_retrain() {
    let settings = AnomalyDetectionSettings {
        min_samples_guard: 10,
        scorer_pool_size: 2,
        ..ml_settings(30)
    };
    let ml = Arc::new(MlAnomalyDetector::new(settings, clock()).unwrap());
    for i in 0..30 {
        ml.observe(&feature("c", 1.0 + (i % 3) as f64, 4.0, "/r", 200));
    }
    let version = ml.status().version;

    let observers: Vec<_> = (0..4)
        .map(|t| {
            let ml = Arc::clone(&ml);
            thread::spawn(move || {
                for i in 0..1000 {
                    let rps = 1.0 + ((t + i) % 5) as f64;
                    ml.observe(&feature("c", rps, 4.0, "/r", 200));
                }
            })
        })
        .collect();
    let retrainer = {
        let ml = Arc::clone(&ml);
        thread::spawn(move || {
            for _ in 0..20 {
                ml.retrain();
            }
        })
    };

    for handle in observers {
        handle.join().unwrap();
    }
    retrainer.join().unwrap();

    let status = ml.status();
    assert!(status.version > version);
    assert!(status.threshold.unwrap().is_finite());
}

// ---------------------------------------------------------------------------
// ハイブリッド
// ---------------------------------------------------------------------------

#[test]
fn test_hybrid_applies_rules_first() {
    let settings = AnomalyDetectionSettings {
        mode: DetectionMode::Hybrid,
        waf_threshold: 0,
        ua_entropy_threshold: 0.0,
        ..ml_settings(3)
    };
    let clock = clock();
    let rules = Arc::new(RollingRuleDetector::new(settings.clone(), clock.clone()));
    let ml = Arc::new(MlAnomalyDetector::new(settings, clock).unwrap());
    let hybrid = HybridDetector::new(rules, ml.clone());

    for _ in 0..3 {
        hybrid.observe(&feature("c", 1.0, 5.0, "/r", 200));
    }
    assert!(ml.is_trained());

    // ルールとMLの両方が該当するイベントはルールの理由で報告される
    let event = waf(feature("c", 50.0, 5.0, "/r", 200));
    assert_eq!(
        hybrid.observe(&event),
        Verdict::Anomaly(AnomalyReason::WafSpike)
    );
    assert_eq!(
        ml.observe(&event),
        Verdict::Anomaly(AnomalyReason::MlOutlier)
    );
}

#[test]
fn test_build_detectors_per_mode() {
    let mut settings = ml_settings(3);

    settings.mode = DetectionMode::Rules;
    let set = build_detectors(&settings, clock()).unwrap();
    assert_eq!(set.detector.name(), "rules");
    assert!(set.ml.is_none());

    settings.mode = DetectionMode::Ml;
    let set = build_detectors(&settings, clock()).unwrap();
    assert_eq!(set.detector.name(), "ml");
    assert!(set.rules.is_none());

    settings.mode = DetectionMode::Hybrid;
    let set = build_detectors(&settings, clock()).unwrap();
    assert_eq!(set.detector.name(), "hybrid");
    assert!(set.rules.is_some() && set.ml.is_some());

    // ハイブリッドでは検知器経由の観測がMLのベースラインに入る
    set.detector.observe(&feature("c", 1.0, 5.0, "/r", 200));
    assert_eq!(set.ml.as_ref().unwrap().baseline_len(), 1);
}
