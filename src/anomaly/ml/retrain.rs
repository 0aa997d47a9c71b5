//! Retrain Scheduler
//!
//! 一定間隔で `MlAnomalyDetector::retrain` を呼び出すバックグラウンドタスク。
//! 学習はブロッキングスレッドで実行し、観測のホットパスを止めない。

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::detector::{MlAnomalyDetector, RetrainOutcome};

/// 直近の再学習サイクルの結果
#[derive(Debug, Clone, PartialEq)]
pub struct RetrainReport {
    /// 起動からのサイクル番号（1始まり）
    pub cycle: u64,
    pub outcome: RetrainOutcome,
}

/// 再学習スケジューラ
#[derive(Debug)]
pub struct RetrainScheduler {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
    reports: watch::Receiver<Option<RetrainReport>>,
}

impl RetrainScheduler {
    /// スケジューラを起動（最初の実行は1周期後）
    pub fn spawn(
        detector: Arc<MlAnomalyDetector>,
        period: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let token = cancel.clone();
        let (report_tx, reports) = watch::channel(None);
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("Retrain scheduler started (interval: {:?})", period);

            let mut cycle = 0u64;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                cycle += 1;
                let detector = Arc::clone(&detector);
                let outcome = match tokio::task::spawn_blocking(move || detector.retrain()).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!("Retrain task failed: {}", e);
                        continue;
                    }
                };
                match &outcome {
                    RetrainOutcome::Skipped(reason) => {
                        debug!("Retrain cycle {} skipped: {}", cycle, reason)
                    }
                    outcome => debug!("Retrain cycle {} finished: {:?}", cycle, outcome),
                }
                report_tx.send_replace(Some(RetrainReport { cycle, outcome }));
            }

            info!("Retrain scheduler stopped");
        });

        Self {
            handle,
            cancel,
            reports,
        }
    }

    /// 再学習サイクルの結果を購読
    pub fn reports(&self) -> watch::Receiver<Option<RetrainReport>> {
        self.reports.clone()
    }

    /// 停止を要求し、最大 `grace` だけ完了を待つ（超過時は中断）
    ///
    /// 猶予内に終了した場合は true。
    pub async fn shutdown(mut self, grace: Duration) -> bool {
        self.cancel.cancel();
        match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("Retrain scheduler ended abnormally: {}", e);
                true
            }
            Err(_) => {
                warn!("Retrain scheduler did not stop within {:?}, aborting", grace);
                self.handle.abort();
                false
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
