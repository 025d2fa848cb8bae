//! stt-relay - リアルタイム音声文字起こしリレー
//!
//! このクレートは、WebSocketで届くライブ音声ストリームを受け取り、
//! クラウドの音声認識ストリーミングエンドポイント向けに再フレーミング・
//! 署名して転送し、返ってくるバイナリイベントストリームを多重分離して
//! 部分・確定の文字起こしイベントをリスナーにファンアウトしながら
//! 確定結果を永続化する、双方向のプロトコルブリッジを提供します。
//!
//! # 主な機能
//!
//! - **署名付きURL生成**: 正規リクエスト署名方式による短期有効のURL
//! - **バイナリイベントフレーミング**: 長さプレフィックス＋CRC検査付きの
//!   ヘッダ/ペイロード形式のエンコード・デコード
//! - **リサンプリング/PCMエンコード**: float32音声の16bit LE PCM変換
//! - **リレーセッション**: 2本のソケットの寿命とメッセージ振り分けを
//!   管理するステートマシン
//! - **結果ストアとポーリング**: 確定セグメントの永続化とモニタ向けの
//!   スライディングウィンドウ問い合わせ
//!
//! # アーキテクチャ
//!
//! ```text
//! [入力ソケット] → [audio (リサンプリング/PCM)] → [event_stream (フレーミング)]
//!                                                        ↓
//!                                              [署名付き上流ソケット]
//!                                                        ↓
//! [リスナー] ← [relay (振り分け)] ← [event_stream (デコード)] ← [上流サービス]
//!      ↓
//! [sink (永続化)] → [poller (モニタ配信)]
//!      ↓
//! [publisher (キュー通知)]
//! ```
//!
//! # 使用例
//!
//! ```no_run
//! use stt_relay::config::Config;
//!
//! // 設定ファイルを読み込み
//! let config = Config::load_or_default("config.toml").unwrap();
//!
//! // またはデフォルト設定を生成
//! Config::write_default("config.toml").unwrap();
//! ```

pub mod audio;
pub mod config;
pub mod credentials;
pub mod error;
pub mod event_stream;
pub mod poller;
pub mod publisher;
pub mod relay;
pub mod server;
pub mod signer;
pub mod sink;
pub mod transcript;
