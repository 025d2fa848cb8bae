//! 文字起こしリレーセッション
//!
//! 入力音声ソケットと上流の文字起こしソケットを橋渡しするプロトコル
//! ステートマシン。2本のソケットの寿命管理、メッセージの振り分け、
//! イベントのファンアウトを担う。
//!
//! 音声の転送はプッシュ型（入力ハンドラが `push_audio` でフレームを
//! 押し込む）。転送チャネルは有界で、満杯時は送信側のawaitがそのまま
//! 入力ソケットの読み取りループを止める。つまりバックプレッシャは
//! 入力ソケットへのフロー制御として働き、無制限のバッファリングや
//! 並び替え・欠落は起きない。

use crate::audio;
use crate::credentials::SessionCredentials;
use crate::error::RelayError;
use crate::event_stream::{self, RelayedEvent};
use crate::signer::{self, PresignOptions};
use crate::transcript::TranscriptEvent;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// 転送チャネルの深さ。満杯時のawaitが入力側へのフロー制御になる
const AUDIO_CHANNEL_DEPTH: usize = 64;

/// タスクの終了待ちの上限
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// セッションの状態
///
/// 初期状態は `Connecting`。`Closed` は終端で、どの状態からも遷移しうる。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// 上流ソケットを開いている
    Connecting,
    /// 両ソケットが開き音声が流れている
    Streaming,
    /// どちらかの側がクローズを開始した
    Closing,
    /// 終端
    Closed,
}

/// セッション設定
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub call_id: String,
    pub speaker_name: String,
    pub language_code: String,
    pub region: String,
    /// 入力ソケットのサンプリングレート
    pub inbound_sample_rate: u32,
    /// 上流へ送るサンプリングレート
    pub upstream_sample_rate: u32,
    /// 署名の有効期間（秒）
    pub presign_expires_seconds: u64,
    /// 上流接続のタイムアウト（署名の有効期間より短くすること）
    pub connect_timeout: Duration,
}

/// 入力・上流2本のソケットを仲介するリレーセッション
///
/// どちらかのソケットが閉じたら破棄される。リスナーはメッセージと
/// エラーの2チャネルを購読でき、配送順は上流からの到着順、1フレーム
/// につき高々1回の発行となる。
pub struct RelaySession {
    settings: SessionSettings,
    audio_tx: Option<mpsc::Sender<Vec<u8>>>,
    message_tx: broadcast::Sender<TranscriptEvent>,
    error_tx: broadcast::Sender<String>,
    state_tx: Arc<watch::Sender<SessionState>>,
    state_rx: watch::Receiver<SessionState>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

/// 前進方向の遷移だけを許す（Closedは終端）
fn advance(state_tx: &watch::Sender<SessionState>, next: SessionState) {
    state_tx.send_modify(|state| {
        if next > *state {
            *state = next;
        }
    });
}

impl RelaySession {
    /// 認証情報を解決済みの設定でセッションを確立する
    ///
    /// 署名付きURLはセッション毎に新しく生成され、再利用しない。
    ///
    /// # Errors
    ///
    /// 署名入力の不備は `RelayError::Signing`、上流接続の失敗・タイムアウト
    /// は `RelayError::UpstreamConnection`。いずれも致命的で、呼び出し側は
    /// 入力ソケットを閉じる。
    pub async fn connect(
        settings: SessionSettings,
        credentials: SessionCredentials,
    ) -> Result<Self, RelayError> {
        let url = Self::upstream_url(&settings, &credentials)?;
        Self::connect_with_url(url, settings).await
    }

    /// 上流エンドポイントの署名付きURLを組み立てる
    ///
    /// 部分結果の安定化は medium 固定で要求する。
    fn upstream_url(
        settings: &SessionSettings,
        credentials: &SessionCredentials,
    ) -> Result<String, RelayError> {
        let host = format!(
            "transcribestreaming.{}.amazonaws.com:8443",
            settings.region
        );
        let mut query = BTreeMap::new();
        query.insert(
            "language-code".to_string(),
            settings.language_code.clone(),
        );
        query.insert("media-encoding".to_string(), "pcm".to_string());
        query.insert(
            "sample-rate".to_string(),
            settings.upstream_sample_rate.to_string(),
        );
        query.insert(
            "enable-partial-results-stabilization".to_string(),
            "true".to_string(),
        );
        query.insert(
            "partial-results-stability".to_string(),
            "medium".to_string(),
        );

        signer::create_presigned_url(
            "GET",
            &host,
            "/stream-transcription-websocket",
            "transcribe",
            &signer::sha256_hex(""),
            &PresignOptions {
                key: credentials.access_key_id.clone(),
                secret: credentials.secret_access_key.clone(),
                session_token: credentials.session_token.clone(),
                protocol: "wss".to_string(),
                region: settings.region.clone(),
                expires: settings.presign_expires_seconds,
                timestamp: Utc::now(),
                query,
            },
        )
    }

    async fn connect_with_url(url: String, settings: SessionSettings) -> Result<Self, RelayError> {
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let state_tx = Arc::new(state_tx);

        log::debug!("上流ソケットを開きます: callId={}", settings.call_id);
        let (ws_stream, _response) =
            tokio::time::timeout(settings.connect_timeout, connect_async(url.as_str()))
                .await
                .map_err(|_| {
                    RelayError::UpstreamConnection(
                        "上流接続が時間内に完了しなかった".to_string(),
                    )
                })?
                .map_err(|e| {
                    RelayError::UpstreamConnection(format!("上流ソケットを開けない: {}", e))
                })?;
        advance(&state_tx, SessionState::Streaming);
        log::info!("ストリーミングを開始: callId={}", settings.call_id);

        let (mut upstream_sink, mut upstream_stream) = ws_stream.split();
        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(AUDIO_CHANNEL_DEPTH);
        let (message_tx, _) = broadcast::channel(64);
        let (error_tx, _) = broadcast::channel(16);

        // 書き込みタスク: 受信順のままリサンプリング→PCM→フレーミングして転送
        let writer_state = state_tx.clone();
        let inbound_rate = settings.inbound_sample_rate;
        let upstream_rate = settings.upstream_sample_rate;
        let writer = tokio::spawn(async move {
            while let Some(frame) = audio_rx.recv().await {
                let samples = audio::decode_f32_frame(&frame);
                let resampled = audio::downsample(&samples, inbound_rate, upstream_rate);
                let pcm = audio::pcm_encode(&resampled);
                let binary = event_stream::marshall(&event_stream::audio_event_message(pcm));
                if let Err(e) = upstream_sink.send(WsMessage::Binary(binary)).await {
                    log::warn!("上流への送信に失敗: {}", e);
                    break;
                }
            }
            // 入力側が閉じた（または送信に失敗した）。上流をクローズする
            advance(&writer_state, SessionState::Closing);
            if let Err(e) = upstream_sink.send(WsMessage::Close(None)).await {
                log::debug!("上流クローズの送信に失敗: {}", e);
            }
        });

        // 読み取りタスク: 上流イベントを到着順にデコードしてファンアウト
        let reader_state = state_tx.clone();
        let reader_message_tx = message_tx.clone();
        let reader_error_tx = error_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(received) = upstream_stream.next().await {
                let message = match received {
                    Ok(message) => message,
                    Err(e) => {
                        log::warn!("上流ソケットのエラー: {}", e);
                        let _ = reader_error_tx.send(format!("上流ソケットのエラー: {}", e));
                        break;
                    }
                };
                match message {
                    WsMessage::Binary(bytes) => {
                        let routed = event_stream::unmarshall(&bytes)
                            .and_then(|decoded| event_stream::route_message(&decoded));
                        match routed {
                            Ok(RelayedEvent::Transcript(event)) => {
                                let _ = reader_message_tx.send(event);
                            }
                            Ok(RelayedEvent::ProtocolError { message }) => {
                                log::warn!("上流からのエラー通知: {}", message);
                                let _ = reader_error_tx.send(message);
                            }
                            Err(e) => {
                                // 不正フレームはそのメッセージ限りで破棄
                                log::warn!("{}", e);
                                let _ = reader_error_tx.send(e.to_string());
                            }
                        }
                    }
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
            advance(&reader_state, SessionState::Closing);
        });

        Ok(Self {
            settings,
            audio_tx: Some(audio_tx),
            message_tx,
            error_tx,
            state_tx,
            state_rx,
            writer: Some(writer),
            reader: Some(reader),
        })
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// 文字起こしイベントのチャネルを購読する
    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.message_tx.subscribe()
    }

    /// エラーチャネルを購読する
    pub fn subscribe_errors(&self) -> broadcast::Receiver<String> {
        self.error_tx.subscribe()
    }

    /// 入力フレームを上流への転送経路に押し込む
    ///
    /// チャネルが満杯の間はawaitし、それが入力ソケットへのフロー制御に
    /// なる。
    pub async fn push_audio(&self, frame: Vec<u8>) -> Result<(), RelayError> {
        let audio_tx = self.audio_tx.as_ref().ok_or_else(|| {
            RelayError::UpstreamConnection("セッションはすでに終了している".to_string())
        })?;
        audio_tx.send(frame).await.map_err(|_| {
            RelayError::UpstreamConnection("転送経路が閉じている".to_string())
        })
    }

    /// どちらかの側がクローズを開始するまで待つ
    pub async fn closed(&self) {
        let mut state_rx = self.state_rx.clone();
        let _ = state_rx
            .wait_for(|state| *state >= SessionState::Closing)
            .await;
    }

    /// セッションを終了する
    ///
    /// 転送経路を閉じ、上流クローズを送り、両タスクの終了を待つ。
    pub async fn shutdown(mut self) {
        advance(&self.state_tx, SessionState::Closing);
        // 転送チャネルを閉じると書き込みタスクが上流クローズを送って終了する
        self.audio_tx.take();
        if let Some(mut writer) = self.writer.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut writer).await.is_err() {
                writer.abort();
            }
        }
        if let Some(mut reader) = self.reader.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut reader).await.is_err() {
                reader.abort();
            }
        }
        advance(&self.state_tx, SessionState::Closed);
        log::info!("セッションを終了: callId={}", self.settings.call_id);
    }
}

impl Drop for RelaySession {
    fn drop(&mut self) {
        // shutdownを経ない破棄でもタスクを残さない
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        advance(&self.state_tx, SessionState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_stream::{HeaderValue, Message};
    use crate::sink::{MemorySink, TranscriptSink};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    fn test_settings() -> SessionSettings {
        SessionSettings {
            call_id: "abc123".to_string(),
            speaker_name: "alice".to_string(),
            language_code: "en-US".to_string(),
            region: "us-east-1".to_string(),
            inbound_sample_rate: 16000,
            upstream_sample_rate: 16000,
            presign_expires_seconds: 15,
            connect_timeout: Duration::from_secs(5),
        }
    }

    fn f32_frame(samples: &[f32]) -> Vec<u8> {
        samples
            .iter()
            .flat_map(|sample| sample.to_le_bytes())
            .collect()
    }

    fn transcript_event_frame(body: &serde_json::Value) -> Vec<u8> {
        let message = Message {
            headers: vec![
                (
                    ":message-type".to_string(),
                    HeaderValue::String("event".to_string()),
                ),
                (
                    ":event-type".to_string(),
                    HeaderValue::String("TranscriptEvent".to_string()),
                ),
            ],
            body: serde_json::to_vec(body).unwrap(),
        };
        event_stream::marshall(&message)
    }

    fn exception_frame(text: &str) -> Vec<u8> {
        let message = Message {
            headers: vec![(
                ":message-type".to_string(),
                HeaderValue::String("exception".to_string()),
            )],
            body: serde_json::json!({ "Message": text }).to_string().into_bytes(),
        };
        event_stream::marshall(&message)
    }

    /// 3フレーム受信後に応答フレームを送って閉じる上流スタブ
    async fn spawn_upstream_stub(
        response: Vec<u8>,
    ) -> (String, tokio::sync::mpsc::Receiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (payload_tx, payload_rx) = tokio::sync::mpsc::channel(8);

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut sink, mut stream) = ws.split();
            let mut received = 0usize;
            while let Some(Ok(message)) = stream.next().await {
                match message {
                    WsMessage::Binary(bytes) => {
                        let decoded = event_stream::unmarshall(&bytes).unwrap();
                        assert_eq!(decoded.string_header(":message-type"), Some("event"));
                        assert_eq!(decoded.string_header(":event-type"), Some("AudioEvent"));
                        payload_tx.send(decoded.body).await.unwrap();
                        received += 1;
                        if received == 3 {
                            sink.send(WsMessage::Binary(response.clone())).await.unwrap();
                            let _ = sink.send(WsMessage::Close(None)).await;
                        }
                    }
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
        });

        (format!("ws://{}", addr), payload_rx)
    }

    #[tokio::test]
    async fn test_relay_forwards_in_order_and_persistable_event_arrives() {
        let body = serde_json::json!({
            "Transcript": {
                "Results": [{
                    "IsPartial": false,
                    "ResultId": "r1",
                    "StartTime": 0.0,
                    "EndTime": 1.0,
                    "Alternatives": [{"Transcript": "hello world", "Items": []}]
                }]
            }
        });
        let (url, mut payloads) = spawn_upstream_stub(transcript_event_frame(&body)).await;

        let session = RelaySession::connect_with_url(url, test_settings())
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Streaming);
        let mut events = session.subscribe();

        let chunk_a = [0.5f32, -0.5];
        let chunk_b = [0.25f32, -0.25];
        let chunk_c = [1.0f32, -1.0];
        session.push_audio(f32_frame(&chunk_a)).await.unwrap();
        session.push_audio(f32_frame(&chunk_b)).await.unwrap();
        session.push_audio(f32_frame(&chunk_c)).await.unwrap();

        // 上流にはA, B, Cの順でフレーミング済みPCMが届く
        for expected in [&chunk_a[..], &chunk_b[..], &chunk_c[..]] {
            let payload = timeout(RECV_TIMEOUT, payloads.recv())
                .await
                .expect("上流への転送がタイムアウト")
                .expect("スタブが終了している");
            assert_eq!(payload, crate::audio::pcm_encode(expected));
        }

        // 確定イベントがメッセージチャネルに1回だけ届く
        let event = timeout(RECV_TIMEOUT, events.recv())
            .await
            .expect("イベント受信がタイムアウト")
            .unwrap();
        let results = &event.transcript.as_ref().unwrap().results;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].result_id.as_deref(), Some("r1"));
        assert!(!results[0].is_partial);
        assert_eq!(
            results[0].alternatives[0].transcript.as_deref(),
            Some("hello world")
        );

        // 確定イベントを保存経路に通すと、ちょうど1セグメントが残る
        let sink = MemorySink::new();
        for segment in
            crate::transcript::finalized_segments(&event, "abc123", "alice", Utc::now())
        {
            sink.persist(&segment).await.unwrap();
        }
        let stored = sink.query_by_result_id("r1").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].transcript, "hello world");
        assert_eq!(stored[0].call_id, "abc123");

        // 上流クローズでセッションが閉じる（対称なティアダウン）
        timeout(RECV_TIMEOUT, session.closed())
            .await
            .expect("クローズ検知がタイムアウト");
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_protocol_error_routed_to_error_channel() {
        let (url, mut payloads) = spawn_upstream_stub(exception_frame("bad request")).await;

        let session = RelaySession::connect_with_url(url, test_settings())
            .await
            .unwrap();
        let mut errors = session.subscribe_errors();
        let mut events = session.subscribe();

        for _ in 0..3 {
            session.push_audio(f32_frame(&[0.0f32])).await.unwrap();
            let _ = timeout(RECV_TIMEOUT, payloads.recv()).await.unwrap();
        }

        // 例外フレームはエラーチャネルにのみ現れる
        let error_text = timeout(RECV_TIMEOUT, errors.recv()).await.unwrap().unwrap();
        assert_eq!(error_text, "bad request");
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed)
        ));

        timeout(RECV_TIMEOUT, session.closed()).await.unwrap();
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_timeout_fails_fast() {
        // 応答しないTCPリスナーに対してはタイムアウトで失敗する
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut settings = test_settings();
        settings.connect_timeout = Duration::from_millis(200);

        let result =
            RelaySession::connect_with_url(format!("ws://{}", addr), settings).await;
        match result {
            Err(e) => assert!(e.is_fatal()),
            Ok(_) => panic!("接続は失敗するはず"),
        }
        drop(listener);
    }

    #[tokio::test]
    async fn test_inbound_close_closes_upstream() {
        // 入力側のシャットダウンが上流クローズに波及する
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            // クローズフレームまたはEOFで終了を通知
            while let Some(Ok(message)) = ws.next().await {
                if matches!(message, WsMessage::Close(_)) {
                    break;
                }
            }
            let _ = closed_tx.send(());
        });

        let session = RelaySession::connect_with_url(format!("ws://{}", addr), test_settings())
            .await
            .unwrap();
        session.shutdown().await;

        timeout(RECV_TIMEOUT, closed_rx)
            .await
            .expect("上流が閉じられなかった")
            .unwrap();
    }

    #[test]
    fn test_upstream_url_contains_required_parameters() {
        let credentials = SessionCredentials {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: Some("token".to_string()),
        };
        let url = RelaySession::upstream_url(&test_settings(), &credentials).unwrap();

        assert!(url.starts_with(
            "wss://transcribestreaming.us-east-1.amazonaws.com:8443/stream-transcription-websocket?"
        ));
        assert!(url.contains("language-code=en-US"));
        assert!(url.contains("media-encoding=pcm"));
        assert!(url.contains("sample-rate=16000"));
        assert!(url.contains("enable-partial-results-stabilization=true"));
        assert!(url.contains("partial-results-stability=medium"));
        assert!(url.contains("X-Amz-Signature="));
        assert!(url.contains("X-Amz-Security-Token=token"));
    }

    #[test]
    fn test_state_only_advances() {
        let (state_tx, state_rx) = watch::channel(SessionState::Streaming);
        advance(&state_tx, SessionState::Closed);
        advance(&state_tx, SessionState::Connecting);
        assert_eq!(*state_rx.borrow(), SessionState::Closed);
    }
}
