use aegis_gateway::anomaly::ml::features::to_vector;
use aegis_gateway::anomaly::ml::{FeatureVec, PcaModel, ScorerPool};
use aegis_gateway::anomaly::{
    AnomalyDetectionSettings, DetectionMode, FeatureEvent, ManualClock, MlAnomalyDetector,
    RollingRuleDetector, SystemClock,
};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;

/// 異常検知ベンチマーク
///
/// リクエストパスから見た1イベントあたりの判定コストと、
/// 再学習時のモデル学習コストを測定します。

fn event(i: usize) -> FeatureEvent {
    FeatureEvent {
        client_id: Some(format!("client_{}", i % 64)),
        rps_estimate: 1.0 + (i % 7) as f64,
        status: if i % 13 == 0 { 404 } else { 200 },
        schema_error: false,
        waf_hit: false,
        method: if i % 3 == 0 { "POST" } else { "GET" }.to_string(),
        route_key: format!("/api/r{}", i % 16),
        ua_entropy: 3.5 + (i % 5) as f64 * 0.2,
    }
}

fn samples(n: usize) -> Vec<FeatureVec> {
    (0..n).map(|i| to_vector(&event(i))).collect()
}

fn bench_rules_observe(c: &mut Criterion) {
    let detector = RollingRuleDetector::new(
        AnomalyDetectionSettings::default(),
        Arc::new(SystemClock),
    );
    let events: Vec<_> = (0..1024).map(event).collect();

    let mut group = c.benchmark_group("rules");
    group.throughput(Throughput::Elements(events.len() as u64));
    group.bench_function("observe_1024", |b| {
        b.iter(|| {
            for event in &events {
                black_box(detector.observe(event));
            }
        })
    });
    group.finish();
}

fn bench_ml_observe(c: &mut Criterion) {
    let settings = AnomalyDetectionSettings {
        mode: DetectionMode::Ml,
        baseline_sample_size: 500,
        ..Default::default()
    };
    let detector = MlAnomalyDetector::new(settings, Arc::new(ManualClock::starting_now())).unwrap();
    for i in 0..500 {
        detector.observe(&event(i));
    }
    let events: Vec<_> = (0..1024).map(event).collect();

    let mut group = c.benchmark_group("ml");
    group.throughput(Throughput::Elements(events.len() as u64));
    group.bench_function("observe_1024", |b| {
        b.iter(|| {
            for event in &events {
                black_box(detector.observe(event));
            }
        })
    });
    group.finish();
}

fn bench_pca(c: &mut Criterion) {
    let mut group = c.benchmark_group("pca");

    // 学習サンプル数ごとの学習時間
    for size in [100, 1000, 10_000].iter() {
        let data = samples(*size);
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::new("fit", size), &data, |b, data| {
            b.iter(|| PcaModel::fit(black_box(data), 20).unwrap())
        });
    }

    let model = Arc::new(PcaModel::fit(&samples(1000), 20).unwrap());
    let pool = ScorerPool::new(model, 4);
    let sample = to_vector(&event(42));
    group.bench_function("pooled_score", |b| b.iter(|| pool.score(black_box(&sample))));

    group.finish();
}

criterion_group!(
    detection_benches,
    bench_rules_observe,
    bench_ml_observe,
    bench_pca
);

criterion_main!(detection_benches);
