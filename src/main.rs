use anyhow::{Context, Result};
use env_logger::Env;
use std::sync::Arc;
use stt_relay::config::Config;
use stt_relay::credentials::CredentialProvider;
use stt_relay::publisher::QueuePublisher;
use stt_relay::server::{self, AppState};
use stt_relay::sink::{DynamoDbSink, MemorySink, TranscriptSink};

#[tokio::main]
async fn main() -> Result<()> {
    // ロガーを初期化
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    // コマンドライン引数をパース
    let args: Vec<String> = std::env::args().collect();

    // 設定ファイル生成モード
    if args.len() > 1 && args[1] == "--generate-config" {
        let config_path = if args.len() > 2 {
            &args[2]
        } else {
            "config.toml"
        };
        Config::write_default(config_path)?;
        println!("設定ファイルを生成しました: {}", config_path);
        return Ok(());
    }

    // 設定ファイルのパス
    let config_path = if args.len() > 1 && !args[1].starts_with("--") {
        &args[1]
    } else {
        "config.toml"
    };

    // 設定を読み込み、環境変数で上書き
    let mut config = Config::load_or_default(config_path)?;
    config.apply_env();

    log::info!("stt-relay を起動します");
    log::info!("設定: {:?}", config);

    // 共有SDKクライアントはここで構築して各コンポーネントに注入する
    let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(config.transcribe.region.clone()))
        .load()
        .await;

    let sink: Arc<dyn TranscriptSink> = match &config.storage.table_name {
        Some(table_name) => Arc::new(DynamoDbSink::new(&sdk_config, table_name.clone())),
        None => {
            log::warn!("テーブル未設定のためプロセス内ストアを使用します");
            Arc::new(MemorySink::new())
        }
    };
    let publisher = Arc::new(QueuePublisher::new(
        &sdk_config,
        config.queue.queue_url.clone(),
    ));
    let credentials = Arc::new(CredentialProvider::new(
        sdk_config,
        config.transcribe.role_arn.clone(),
    ));

    let port = config.server.port;
    let state = Arc::new(AppState {
        config,
        sink,
        publisher,
        credentials,
    });
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("ポート {} のバインドに失敗", port))?;
    log::info!("リッスンを開始しました: {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("停止シグナルを受信しました...");
        })
        .await
        .context("サーバの実行に失敗")?;

    Ok(())
}
