//! Rolling Rule Detection
//!
//! (クライアント, ルート) ごとのスライディングウィンドウ集計を静的しきい値と比較します。
//!
//! ## ウィンドウストアの破棄ポリシー
//!
//! ウィンドウは初回観測時に遅延生成され、`window_ttl` の間観測が無ければ破棄される。
//! 掃除は `observe` の中で `prune_interval` ごとに最大1回だけ行われる。
//! 破棄されたウィンドウは「退役」状態になり、取得済みのハンドルから記録されることはない。

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::clock::SharedClock;
use super::config::AnomalyDetectionSettings;
use super::types::{AnomalyReason, FeatureEvent, Verdict};
use super::AnomalyDetector;

/// ウィンドウのキー
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub client: String,
    pub route: String,
}

impl WindowKey {
    pub fn for_event(event: &FeatureEvent) -> Self {
        Self {
            client: event.client_key().to_string(),
            route: event.route_key.clone(),
        }
    }
}

/// 1つの (クライアント, ルート) のスライディングウィンドウ
///
/// シグナルごとにタイムスタンプのキューを持ち、挿入のたびに期限切れを追い出す。
/// 各カウンタはウィンドウ内に残っている該当エントリ数と常に一致する。
#[derive(Debug)]
pub struct SlidingWindow {
    rps_window: Duration,
    error_window: Duration,
    requests: VecDeque<DateTime<Utc>>,
    four_xx: VecDeque<DateTime<Utc>>,
    five_xx: VecDeque<DateTime<Utc>>,
    waf_hits: VecDeque<DateTime<Utc>>,
    last_seen: DateTime<Utc>,
    retired: bool,
}

/// ウィンドウの集計値
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSnapshot {
    pub rps: f64,
    pub four_xx: usize,
    pub five_xx: usize,
    pub waf_hits: usize,
}

impl SlidingWindow {
    pub fn new(rps_window: Duration, error_window: Duration, now: DateTime<Utc>) -> Self {
        let one_second = Duration::seconds(1);
        Self {
            rps_window: rps_window.max(one_second),
            error_window: error_window.max(one_second),
            requests: VecDeque::new(),
            four_xx: VecDeque::new(),
            five_xx: VecDeque::new(),
            waf_hits: VecDeque::new(),
            last_seen: now,
            retired: false,
        }
    }

    /// イベントを記録し、期限切れエントリを追い出す
    pub fn record(&mut self, event: &FeatureEvent, now: DateTime<Utc>) {
        self.last_seen = now;

        self.requests.push_back(now);
        if event.is_4xx() {
            self.four_xx.push_back(now);
        }
        if event.is_5xx() {
            self.five_xx.push_back(now);
        }
        if event.waf_hit {
            self.waf_hits.push_back(now);
        }

        self.evict(now);
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        evict_older(&mut self.requests, now, self.rps_window);
        evict_older(&mut self.four_xx, now, self.error_window);
        evict_older(&mut self.five_xx, now, self.error_window);
        evict_older(&mut self.waf_hits, now, self.error_window);
    }

    /// 最古のエントリからの実経過時間で割ったRPS
    ///
    /// 分母は [1秒, RPSウィンドウ] にクランプする。
    pub fn rps(&self) -> f64 {
        let Some(oldest) = self.requests.front() else {
            return 0.0;
        };
        let elapsed = (self.last_seen - *oldest).num_milliseconds() as f64 / 1000.0;
        let window = self.rps_window.num_milliseconds() as f64 / 1000.0;
        let denominator = elapsed.min(window).max(1.0);
        self.requests.len() as f64 / denominator
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            rps: self.rps(),
            four_xx: self.four_xx.len(),
            five_xx: self.five_xx.len(),
            waf_hits: self.waf_hits.len(),
        }
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    /// ストアから破棄済みか
    pub fn is_retired(&self) -> bool {
        self.retired
    }
}

fn evict_older(queue: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) {
    while let Some(&ts) = queue.front() {
        if now - ts > window {
            queue.pop_front();
        } else {
            break;
        }
    }
}

/// ルール検知器が所有するウィンドウストア
///
/// キー単位の排他（ウィンドウごとの Mutex）で、異なるキー同士は競合しない。
#[derive(Debug, Default)]
pub struct WindowStore {
    windows: DashMap<WindowKey, Arc<Mutex<SlidingWindow>>>,
}

impl WindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// ウィンドウを取得（無ければ生成）
    pub fn get_or_create<F>(&self, key: WindowKey, create: F) -> Arc<Mutex<SlidingWindow>>
    where
        F: FnOnce() -> SlidingWindow,
    {
        if let Some(window) = self.windows.get(&key) {
            return Arc::clone(window.value());
        }
        let entry = self
            .windows
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(create())));
        Arc::clone(entry.value())
    }

    /// 現在ストアにあるウィンドウへイベントを記録して集計値を返す
    ///
    /// 取得からロックまでの間に破棄されたウィンドウには記録せず、作り直して再試行する。
    pub fn record<F>(
        &self,
        key: &WindowKey,
        event: &FeatureEvent,
        now: DateTime<Utc>,
        create: F,
    ) -> WindowSnapshot
    where
        F: Fn() -> SlidingWindow,
    {
        loop {
            let window = self.get_or_create(key.clone(), &create);
            let mut window = window.lock();
            if window.is_retired() {
                continue;
            }
            window.record(event, now);
            return window.snapshot();
        }
    }

    /// `ttl` を超えて観測の無いウィンドウを破棄し、破棄数を返す
    pub fn evict_idle(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| match window.try_lock() {
            Some(mut window) => {
                if now - window.last_seen() <= ttl {
                    true
                } else {
                    window.retired = true;
                    false
                }
            }
            // 使用中のウィンドウはアクティブとみなす
            None => true,
        });
        before.saturating_sub(self.windows.len())
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn contains(&self, key: &WindowKey) -> bool {
        self.windows.contains_key(key)
    }
}

/// ローリングしきい値検知器
#[derive(Debug)]
pub struct RollingRuleDetector {
    settings: AnomalyDetectionSettings,
    store: WindowStore,
    clock: SharedClock,
    last_prune_ms: AtomicI64,
}

impl RollingRuleDetector {
    pub fn new(settings: AnomalyDetectionSettings, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            settings,
            store: WindowStore::new(),
            clock,
            last_prune_ms: AtomicI64::new(now.timestamp_millis()),
        }
    }

    /// イベントを観測して判定
    ///
    /// チェック順は RPS → 4xx → 5xx → WAF → UAエントロピー で、最初に該当したものを返す。
    pub fn observe(&self, event: &FeatureEvent) -> Verdict {
        let now = self.clock.now();
        self.maybe_prune(now);

        let key = WindowKey::for_event(event);
        let snapshot = self.store.record(&key, event, now, || {
            SlidingWindow::new(self.settings.rps_window(), self.settings.error_window(), now)
        });

        let verdict = self.evaluate(event, &snapshot);
        if let Verdict::Anomaly(reason) = verdict {
            debug!(
                "Rule {} for {}{} (rps={:.2}, 4xx={}, 5xx={}, waf={})",
                reason,
                event.client_key(),
                event.route_key,
                snapshot.rps,
                snapshot.four_xx,
                snapshot.five_xx,
                snapshot.waf_hits
            );
        }
        verdict
    }

    fn evaluate(&self, event: &FeatureEvent, snapshot: &WindowSnapshot) -> Verdict {
        let s = &self.settings;
        if snapshot.rps > s.rps_threshold {
            Verdict::Anomaly(AnomalyReason::RpsSpike)
        } else if snapshot.four_xx > s.four_xx_threshold as usize {
            Verdict::Anomaly(AnomalyReason::FourXxSpike)
        } else if snapshot.five_xx > s.five_xx_threshold as usize {
            Verdict::Anomaly(AnomalyReason::FiveXxSpike)
        } else if snapshot.waf_hits > s.waf_threshold as usize {
            Verdict::Anomaly(AnomalyReason::WafSpike)
        } else if event.ua_entropy < s.ua_entropy_threshold {
            Verdict::Anomaly(AnomalyReason::UaLowEntropy)
        } else {
            Verdict::Normal
        }
    }

    /// 前回の掃除から `prune_interval` 経過していれば、1スレッドだけが掃除する
    fn maybe_prune(&self, now: DateTime<Utc>) {
        let last = self.last_prune_ms.load(Ordering::Relaxed);
        let now_ms = now.timestamp_millis();
        if now_ms - last <= self.settings.prune_interval().num_milliseconds() {
            return;
        }
        if self
            .last_prune_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            let evicted = self.store.evict_idle(now, self.settings.window_ttl());
            if evicted > 0 {
                debug!("Evicted {} idle rule windows", evicted);
            }
        }
    }

    /// アイドルウィンドウを即時に掃除
    pub fn evict_idle(&self) -> usize {
        self.store.evict_idle(self.clock.now(), self.settings.window_ttl())
    }

    pub fn window_count(&self) -> usize {
        self.store.len()
    }

    pub fn store(&self) -> &WindowStore {
        &self.store
    }
}

impl AnomalyDetector for RollingRuleDetector {
    fn observe(&self, event: &FeatureEvent) -> Verdict {
        RollingRuleDetector::observe(self, event)
    }

    fn name(&self) -> &'static str {
        "rules"
    }
}
