use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub transcribe: TranscribeConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub poller: PollerConfig,
}

/// リッスン設定
///
/// # デフォルト値
///
/// - `port`: 8080
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

/// 上流の文字起こしエンドポイント設定
///
/// # デフォルト値
///
/// - `region`: "us-east-1"
/// - `language_code`: "en-US"
/// - `sample_rate`: 16000 Hz (上流に送るターゲットレート)
/// - `presign_expires_seconds`: 15 秒
/// - `role_arn`: なし（環境の認証情報チェーンを使用）
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TranscribeConfig {
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_language_code")]
    pub language_code: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_presign_expires_seconds")]
    pub presign_expires_seconds: u64,
    pub role_arn: Option<String>,
}

/// セッションのタイムアウト設定
///
/// # デフォルト値
///
/// - `idle_timeout_seconds`: 30 秒（無活動の入力接続を切断）
/// - `connect_timeout_seconds`: 10 秒（署名の有効期間より短くすること）
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
}

/// 結果ストア設定
///
/// `table_name` が未設定の場合はプロセス内ストアで動作する（開発用）。
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StorageConfig {
    pub table_name: Option<String>,
}

/// 確定結果の通知先キュー設定
///
/// `queue_url` が未設定の場合は通知を行わない。
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct QueueConfig {
    pub queue_url: Option<String>,
}

/// モニタ用ポーリング設定
///
/// # デフォルト値
///
/// - `interval_seconds`: 10 秒
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollerConfig {
    #[serde(default = "default_poll_interval_seconds")]
    pub interval_seconds: u64,
}

// Default functions
fn default_port() -> u16 {
    8080
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_language_code() -> String {
    "en-US".to_string()
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_presign_expires_seconds() -> u64 {
    15
}

fn default_idle_timeout_seconds() -> u64 {
    30
}

fn default_connect_timeout_seconds() -> u64 {
    10
}

fn default_poll_interval_seconds() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            transcribe: TranscribeConfig::default(),
            session: SessionConfig::default(),
            storage: StorageConfig::default(),
            queue: QueueConfig::default(),
            poller: PollerConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for TranscribeConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            language_code: default_language_code(),
            sample_rate: default_sample_rate(),
            presign_expires_seconds: default_presign_expires_seconds(),
            role_arn: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: default_idle_timeout_seconds(),
            connect_timeout_seconds: default_connect_timeout_seconds(),
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_poll_interval_seconds(),
        }
    }
}

impl Config {
    /// 設定ファイルから読み込み
    ///
    /// # Errors
    ///
    /// ファイルの読み込みまたはパースに失敗した場合にエラーを返す。
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("設定ファイルの読み込みに失敗: {:?}", path.as_ref()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "設定ファイルのパースに失敗")?;
        Ok(config)
    }

    /// デフォルト設定をファイルに書き出し
    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<()> {
        let config = Config::default();
        let content =
            toml::to_string_pretty(&config).with_context(|| "設定のシリアライズに失敗")?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("設定ファイルの書き込みに失敗: {:?}", path.as_ref()))?;
        Ok(())
    }

    /// 設定ファイルがあれば読み込み、なければデフォルトを使用
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            log::warn!(
                "設定ファイルが見つかりません。デフォルト設定を使用します: {:?}",
                path.as_ref()
            );
            Ok(Config::default())
        }
    }

    /// 環境変数で設定を上書き
    ///
    /// 認識する変数: `PORT`, `AWS_DEFAULT_REGION`,
    /// `TRANSCRIBESTREAM_CLIENT_ROLEARN`, `DYNAMODB_TRANSCRIPTS_TABLENAME`,
    /// `TRANSCRIPTS_QUEUE_URL`。いずれも省略可能。
    pub fn apply_env(&mut self) {
        self.apply_env_with(|name| std::env::var(name).ok());
    }

    fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("PORT").and_then(|value| value.parse().ok()) {
            self.server.port = port;
        }
        if let Some(region) = lookup("AWS_DEFAULT_REGION") {
            self.transcribe.region = region;
        }
        if let Some(role_arn) = lookup("TRANSCRIBESTREAM_CLIENT_ROLEARN") {
            self.transcribe.role_arn = Some(role_arn);
        }
        if let Some(table_name) = lookup("DYNAMODB_TRANSCRIPTS_TABLENAME") {
            self.storage.table_name = Some(table_name);
        }
        if let Some(queue_url) = lookup("TRANSCRIPTS_QUEUE_URL") {
            self.queue.queue_url = Some(queue_url);
        }
    }
}
