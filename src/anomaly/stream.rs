//! Feature Stream
//!
//! リクエスト処理パスから検知パイプラインへ特徴イベントを受け渡す有界キュー。
//!
//! - `enqueue` は決してブロックしない
//! - 容量超過時は最も古いイベントを破棄する
//! - `dequeue_all` は到着順（FIFO）のストリームを返し、キャンセルで終了する

use crossbeam::queue::ArrayQueue;
use futures::Stream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::types::FeatureEvent;

/// 特徴イベントストリーム
#[derive(Debug)]
pub struct FeatureStream {
    queue: ArrayQueue<FeatureEvent>,
    notify: Notify,
    enqueued: AtomicU64,
    dropped: AtomicU64,
}

impl FeatureStream {
    /// 容量を指定して作成（0 は 1 に切り上げ）
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            notify: Notify::new(),
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// イベントを投入（満杯なら最古のイベントを破棄）
    ///
    /// 破棄が発生した場合は true を返す。
    pub fn enqueue(&self, event: FeatureEvent) -> bool {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        let shed = self.queue.force_push(event).is_some();
        if shed {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!("Feature stream full, dropped oldest event (total dropped: {})", dropped);
        }
        self.notify.notify_one();
        shed
    }

    /// テスト・リプレイ用の一括投入
    pub fn seed<I>(&self, events: I)
    where
        I: IntoIterator<Item = FeatureEvent>,
    {
        for event in events {
            self.enqueue(event);
        }
    }

    /// 次のイベントを待つ（キャンセル時は None）
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Option<FeatureEvent> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(event) = self.queue.pop() {
                return Some(event);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    /// 到着順のイベントストリーム（キャンセルで終了）
    pub fn dequeue_all(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = FeatureEvent> + Send + 'static {
        futures::stream::unfold((Arc::clone(self), cancel), |(stream, cancel)| async move {
            let event = stream.dequeue(&cancel).await?;
            Some((event, (stream, cancel)))
        })
    }

    /// 待機中のイベント数
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// これまでに投入されたイベント数
    pub fn enqueued_count(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// 容量超過で破棄されたイベント数
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
