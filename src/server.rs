//! HTTP/WebSocketフロントエンド
//!
//! 入力音声ソケット、モニタソケット、ヘルスチェックの3経路を持つ。
//! セッション毎の依存（ストア・キュー・認証情報プロバイダ）は共有状態
//! として注入され、モジュールスコープのクライアントは置かない。

use crate::config::Config;
use crate::credentials::CredentialProvider;
use crate::poller::TranscriptsPoller;
use crate::publisher::QueuePublisher;
use crate::relay::{RelaySession, SessionSettings};
use crate::sink::TranscriptSink;
use crate::transcript::{self, TranscriptEvent, TranscriptSegment};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// 入力ソケットのデフォルトサンプリングレート
const DEFAULT_INBOUND_SAMPLE_RATE: u32 = 44100;

/// 共有アプリケーション状態
pub struct AppState {
    pub config: Config,
    pub sink: Arc<dyn TranscriptSink>,
    pub publisher: Arc<QueuePublisher>,
    pub credentials: Arc<CredentialProvider>,
}

/// ルーティングを構築する
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/stt/transcribe", get(transcribe_handler))
        .route("/api/stt/connect", get(monitor_handler))
        .route("/api/stt/healthcheck", get(healthcheck))
        .with_state(state)
}

async fn healthcheck() -> &'static str {
    "ok"
}

/// 入力音声ソケットのクエリパラメータ
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscribeParams {
    pub language: Option<String>,
    pub region: Option<String>,
    pub sample_rate: Option<u32>,
    pub username: Option<String>,
    pub speaker_name: Option<String>,
    pub call_id: Option<String>,
}

impl TranscribeParams {
    /// 話者ラベル（speakerName優先、なければusername）
    fn speaker(&self) -> String {
        self.speaker_name
            .clone()
            .or_else(|| self.username.clone())
            .unwrap_or_default()
    }
}

async fn transcribe_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TranscribeParams>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_transcribe_socket(state, params, socket))
}

/// パラメータと設定からセッション設定を組み立てる
fn session_settings(config: &Config, params: &TranscribeParams) -> SessionSettings {
    SessionSettings {
        call_id: params
            .call_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        speaker_name: params.speaker(),
        language_code: params
            .language
            .clone()
            .unwrap_or_else(|| config.transcribe.language_code.clone()),
        region: params
            .region
            .clone()
            .unwrap_or_else(|| config.transcribe.region.clone()),
        inbound_sample_rate: params.sample_rate.unwrap_or(DEFAULT_INBOUND_SAMPLE_RATE),
        upstream_sample_rate: config.transcribe.sample_rate,
        presign_expires_seconds: config.transcribe.presign_expires_seconds,
        connect_timeout: Duration::from_secs(config.session.connect_timeout_seconds),
    }
}

async fn handle_transcribe_socket(
    state: Arc<AppState>,
    params: TranscribeParams,
    mut socket: WebSocket,
) {
    let settings = session_settings(&state.config, &params);
    log::info!(
        "音声接続: callId={} language={} sampleRate={}",
        settings.call_id,
        settings.language_code,
        settings.inbound_sample_rate
    );

    // 1. 認証情報を解決（失敗したら上流は開かず入力ソケットを閉じる）
    let credentials = match state.credentials.resolve().await {
        Ok(credentials) => credentials,
        Err(e) => {
            log::error!("callId={}: {}", settings.call_id, e);
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    // 2. 上流ソケットを確立
    let session = match RelaySession::connect(settings, credentials).await {
        Ok(session) => session,
        Err(e) => {
            log::error!("{}", e);
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    // 3. 確定結果のファンアウトタスク
    let events = session.subscribe();
    let persist_task = tokio::spawn(persist_finalized(
        state.clone(),
        session.settings().call_id.clone(),
        session.settings().speaker_name.clone(),
        events,
    ));

    // 4. 入力ループ。無活動はタイムアウトで切り、上流側の終了にも追随する
    let idle_timeout = Duration::from_secs(state.config.session.idle_timeout_seconds);
    loop {
        tokio::select! {
            received = tokio::time::timeout(idle_timeout, socket.recv()) => {
                match received {
                    Err(_) => {
                        log::info!(
                            "callId={}: 無活動のため切断します",
                            session.settings().call_id
                        );
                        break;
                    }
                    Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
                    Ok(Some(Err(e))) => {
                        log::debug!("入力ソケットのエラー: {}", e);
                        break;
                    }
                    Ok(Some(Ok(Message::Binary(frame)))) => {
                        if let Err(e) = session.push_audio(frame).await {
                            log::warn!("{}", e);
                            break;
                        }
                    }
                    Ok(Some(Ok(_))) => {} // Text/Ping/Pongは無視
                }
            }
            // 上流が閉じたら入力ソケットも閉じてハーフオープンを防ぐ
            _ = session.closed() => break,
        }
    }

    session.shutdown().await;
    let _ = socket.send(Message::Close(None)).await;
    if let Err(e) = persist_task.await {
        log::debug!("ファンアウトタスクの終了待ちに失敗: {}", e);
    }
}

/// 確定結果だけを選び、ストアへの保存とキュー通知を行う
///
/// 部分結果はモニタ向けにチャネルへ流れるだけで、ここには残らない。
/// 保存・通知の失敗はログに残し、リレー本体は止めない。
async fn persist_finalized(
    state: Arc<AppState>,
    call_id: String,
    speaker_name: String,
    mut events: broadcast::Receiver<TranscriptEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(count)) => {
                log::warn!("callId={}: {}件のイベントを取りこぼした", call_id, count);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        for segment in transcript::finalized_segments(&event, &call_id, &speaker_name, Utc::now())
        {
            if let Err(e) = state.sink.persist(&segment).await {
                log::error!("callId={}: {}", call_id, e);
            }
            match state.publisher.publish(&segment).await {
                Ok(Some(message_id)) => {
                    log::debug!("callId={}: キューに送信 messageId={}", call_id, message_id)
                }
                Ok(None) => {}
                Err(e) => log::warn!("callId={}: {}", call_id, e),
            }
        }
    }
}

/// モニタソケットのクエリパラメータ
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorParams {
    pub call_id: Option<String>,
}

/// モニタソケットへ送るメッセージ
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
enum MonitorMessage {
    CallerId(String),
    CallId(String),
    Transcripts(Vec<TranscriptSegment>),
}

async fn monitor_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<MonitorParams>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_monitor_socket(state, params, socket))
}

async fn handle_monitor_socket(state: Arc<AppState>, params: MonitorParams, mut socket: WebSocket) {
    let call_id = params.call_id.unwrap_or_default();
    let caller_id = uuid::Uuid::new_v4().to_string();
    log::info!("モニタ接続: callId={} callerId={}", call_id, caller_id);

    // 接続直後に識別子を2通知らせる
    for message in [
        MonitorMessage::CallerId(caller_id),
        MonitorMessage::CallId(call_id.clone()),
    ] {
        if !send_monitor_message(&mut socket, &message).await {
            return;
        }
    }

    let mut subscription = TranscriptsPoller::subscribe(
        state.sink.clone(),
        call_id.clone(),
        state.config.poller.interval_seconds,
    );

    loop {
        tokio::select! {
            tick = subscription.recv() => {
                match tick {
                    Some(segments) => {
                        let message = MonitorMessage::Transcripts(segments);
                        if !send_monitor_message(&mut socket, &message).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
            received = socket.recv() => {
                match received {
                    None | Some(Ok(Message::Close(_))) | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    // タイマーの明示的な解除。忘れるとタイマーが漏れる
    subscription.stop();
    log::info!("モニタ切断: callId={}", call_id);
}

async fn send_monitor_message(socket: &mut WebSocket, message: &MonitorMessage) -> bool {
    let payload = match serde_json::to_string(message) {
        Ok(payload) => payload,
        Err(e) => {
            log::error!("モニタメッセージの変換に失敗: {}", e);
            return false;
        }
    };
    socket.send(Message::Text(payload)).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use aws_config::BehaviorVersion;
    use chrono::Duration as ChronoDuration;

    fn test_state(sink: Arc<dyn TranscriptSink>) -> Arc<AppState> {
        let sdk_config = aws_config::SdkConfig::builder()
            .behavior_version(BehaviorVersion::latest())
            .build();
        Arc::new(AppState {
            config: Config::default(),
            sink,
            publisher: Arc::new(QueuePublisher::new(&sdk_config, None)),
            credentials: Arc::new(CredentialProvider::new(sdk_config, None)),
        })
    }

    fn transcript_event(is_partial: bool, result_id: &str, text: &str) -> TranscriptEvent {
        serde_json::from_value(serde_json::json!({
            "Transcript": {
                "Results": [{
                    "ResultId": result_id,
                    "StartTime": 0.0,
                    "EndTime": 1.0,
                    "IsPartial": is_partial,
                    "Alternatives": [{"Transcript": text, "Items": []}]
                }]
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_session_settings_defaults() {
        let config = Config::default();
        let settings = session_settings(&config, &TranscribeParams::default());

        assert!(!settings.call_id.is_empty());
        assert_eq!(settings.language_code, "en-US");
        assert_eq!(settings.region, "us-east-1");
        assert_eq!(settings.inbound_sample_rate, 44100);
        assert_eq!(settings.upstream_sample_rate, 16000);
    }

    #[test]
    fn test_speaker_label_preference() {
        let params = TranscribeParams {
            username: Some("user".to_string()),
            speaker_name: Some("speaker".to_string()),
            ..TranscribeParams::default()
        };
        assert_eq!(params.speaker(), "speaker");

        let params = TranscribeParams {
            username: Some("user".to_string()),
            ..TranscribeParams::default()
        };
        assert_eq!(params.speaker(), "user");
    }

    #[test]
    fn test_monitor_message_shapes() {
        let message = MonitorMessage::CallerId("c1".to_string());
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "callerId");
        assert_eq!(json["value"], "c1");

        let message = MonitorMessage::CallId("abc123".to_string());
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "callId");

        let message = MonitorMessage::Transcripts(Vec::new());
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "transcripts");
        assert!(json["value"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persist_finalized_filters_partials() {
        let sink = Arc::new(MemorySink::new());
        let state = test_state(sink.clone());
        let (tx, rx) = broadcast::channel(16);

        let task = tokio::spawn(persist_finalized(
            state,
            "abc123".to_string(),
            "alice".to_string(),
            rx,
        ));

        // 部分結果と確定結果を交互に流す。グループ間を空けて
        // 受信時刻（ストアのキー）が重ならないようにする
        tx.send(transcript_event(true, "r1", "hel")).unwrap();
        tx.send(transcript_event(false, "r1", "hello")).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        tx.send(transcript_event(true, "r2", "wor")).unwrap();
        tx.send(transcript_event(false, "r2", "world")).unwrap();
        drop(tx);
        task.await.unwrap();

        let since = Utc::now() - ChronoDuration::seconds(60);
        let stored = sink.query("abc123", since).await.unwrap();
        assert_eq!(stored.len(), 2);
        let mut result_ids: Vec<&str> =
            stored.iter().map(|segment| segment.result_id.as_str()).collect();
        result_ids.sort();
        assert_eq!(result_ids, vec!["r1", "r2"]);
        assert!(stored.iter().all(|segment| segment.speaker_name == "alice"));
    }

    #[tokio::test]
    async fn test_persist_finalized_single_event_single_segment() {
        let sink = Arc::new(MemorySink::new());
        let state = test_state(sink.clone());
        let (tx, rx) = broadcast::channel(16);

        let task = tokio::spawn(persist_finalized(
            state,
            "abc123".to_string(),
            String::new(),
            rx,
        ));
        tx.send(transcript_event(false, "r1", "hello world")).unwrap();
        drop(tx);
        task.await.unwrap();

        let stored = sink.query_by_result_id("r1").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].transcript, "hello world");
        assert_eq!(stored[0].call_id, "abc123");
    }
}
