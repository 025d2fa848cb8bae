use thiserror::Error;

/// リレー処理のエラー分類
///
/// トランスポート境界のエラー（認証・署名・上流接続）はセッションに対して
/// 致命的で、入力ソケットを閉じて終了する。デコード・永続化・キュー送信の
/// エラーは発生した操作のみに留め、セッションは継続する。
#[derive(Debug, Error)]
pub enum RelayError {
    /// 認証情報の解決またはロール引き受けに失敗（致命的）
    #[error("認証情報の解決に失敗: {0}")]
    AuthResolution(String),

    /// 署名入力が不正（リージョン・ホスト欠落など、致命的）
    #[error("署名の生成に失敗: {0}")]
    Signing(String),

    /// 上流からの不正なバイナリフレーム（該当メッセージのみ破棄）
    #[error("フレームの解析に失敗: {0}")]
    Framing(String),

    /// 上流ソケットの接続失敗または予期しない切断（致命的）
    #[error("上流接続エラー: {0}")]
    UpstreamConnection(String),

    /// 結果ストアへの書き込み・問い合わせ失敗（セッションは継続）
    #[error("永続化エラー: {0}")]
    Persistence(String),

    /// 確定結果のキュー送信失敗（セッションは継続）
    #[error("キュー送信エラー: {0}")]
    Publish(String),
}

impl RelayError {
    /// セッションを終了させるべきエラーかどうか
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::AuthResolution(_)
                | RelayError::Signing(_)
                | RelayError::UpstreamConnection(_)
        )
    }
}
