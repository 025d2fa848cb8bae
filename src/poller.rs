//! モニタ向けの文字起こし結果ポーリング
//!
//! モニタソケットの接続毎に購読を作り、一定間隔で結果ストアに
//! 「今からさかのぼって間隔秒ぶん」のスライディングウィンドウを
//! 問い合わせる。購読の解除はタイマーの明示的なライフサイクル操作で、
//! 解除し忘れてもドロップ時にタスクを落とす。

use crate::sink::TranscriptSink;
use crate::transcript::TranscriptSegment;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// callIdとポーリング間隔を結びつける購読
pub struct PollerSubscription {
    receiver: mpsc::Receiver<Vec<TranscriptSegment>>,
    task: JoinHandle<()>,
}

impl PollerSubscription {
    /// 次のtickの結果セットを受け取る（空の場合もある）
    pub async fn recv(&mut self) -> Option<Vec<TranscriptSegment>> {
        self.receiver.recv().await
    }

    /// タイマーを解除する
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for PollerSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct TranscriptsPoller;

impl TranscriptsPoller {
    /// 指定callIdの購読を開始する
    ///
    /// tick毎にウィンドウ内のセグメントを購読者へ送る。受信側が
    /// 消えたらタスクは終了する。
    pub fn subscribe(
        sink: Arc<dyn TranscriptSink>,
        call_id: String,
        interval_seconds: u64,
    ) -> PollerSubscription {
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_seconds.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // intervalの最初のtickは即時に完了するため読み捨てる
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let results = poll_once(sink.as_ref(), &call_id, interval_seconds).await;
                if tx.send(results).await.is_err() {
                    log::debug!("ポーリング購読者が消えたため停止: {}", call_id);
                    break;
                }
            }
        });
        PollerSubscription { receiver: rx, task }
    }
}

/// 1 tick分の問い合わせ
///
/// ウィンドウは累積ではなくスライディング（now − interval より新しいもの）。
/// 問い合わせの失敗はログに残し、そのtickは空の結果として扱う。
pub async fn poll_once(
    sink: &dyn TranscriptSink,
    call_id: &str,
    interval_seconds: u64,
) -> Vec<TranscriptSegment> {
    let since = Utc::now() - ChronoDuration::seconds(interval_seconds as i64);
    match sink.query(call_id, since).await {
        Ok(results) => results,
        Err(e) => {
            log::error!("ポーリングの問い合わせに失敗 ({}): {}", call_id, e);
            Vec::new()
        }
    }
}
