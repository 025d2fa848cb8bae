//! 署名用の短期認証情報の解決
//!
//! ロール引き受け先が設定されていればセキュアトークン交換で短期認証情報を
//! 取得し、なければ環境の認証情報チェーンをそのまま返す。解決に失敗した
//! セッションは上流接続を開かずに入力ソケットを閉じる。

use crate::error::RelayError;
use aws_credential_types::provider::ProvideCredentials;

/// 署名に使う認証情報一式
#[derive(Debug, Clone)]
pub struct SessionCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

/// セッション毎に認証情報を解決するプロバイダ
///
/// SDKクライアントはモジュールスコープに置かず、これを所有するコンポーネント
/// から注入する。
pub struct CredentialProvider {
    sdk_config: aws_config::SdkConfig,
    role_arn: Option<String>,
}

impl CredentialProvider {
    pub fn new(sdk_config: aws_config::SdkConfig, role_arn: Option<String>) -> Self {
        Self {
            sdk_config,
            role_arn,
        }
    }

    /// 認証情報を解決する
    ///
    /// # Errors
    ///
    /// チェーンの解決またはロール引き受けが拒否された場合は
    /// `RelayError::AuthResolution`（致命的）。
    pub async fn resolve(&self) -> Result<SessionCredentials, RelayError> {
        match &self.role_arn {
            Some(role_arn) => self.assume_role(role_arn).await,
            None => self.ambient().await,
        }
    }

    async fn ambient(&self) -> Result<SessionCredentials, RelayError> {
        let provider = self.sdk_config.credentials_provider().ok_or_else(|| {
            RelayError::AuthResolution("認証情報プロバイダが構成されていない".to_string())
        })?;
        let credentials = provider.provide_credentials().await.map_err(|e| {
            RelayError::AuthResolution(format!("認証情報チェーンの解決に失敗: {}", e))
        })?;
        Ok(SessionCredentials {
            access_key_id: credentials.access_key_id().to_string(),
            secret_access_key: credentials.secret_access_key().to_string(),
            session_token: credentials.session_token().map(|token| token.to_string()),
        })
    }

    async fn assume_role(&self, role_arn: &str) -> Result<SessionCredentials, RelayError> {
        let client = aws_sdk_sts::Client::new(&self.sdk_config);
        let session_name = format!("transcribe-relay-{}", uuid::Uuid::new_v4().simple());
        log::debug!("ロール {} を引き受け (セッション名: {})", role_arn, session_name);

        let output = client
            .assume_role()
            .role_arn(role_arn)
            .role_session_name(&session_name)
            .send()
            .await
            .map_err(|e| {
                RelayError::AuthResolution(format!("ロール引き受けが拒否された: {}", e))
            })?;

        let credentials = output.credentials().ok_or_else(|| {
            RelayError::AuthResolution("ロール引き受け応答に認証情報がない".to_string())
        })?;
        Ok(SessionCredentials {
            access_key_id: credentials.access_key_id().to_string(),
            secret_access_key: credentials.secret_access_key().to_string(),
            session_token: Some(credentials.session_token().to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_credential_types::provider::SharedCredentialsProvider;
    use aws_credential_types::Credentials;

    #[tokio::test]
    async fn test_ambient_resolution() {
        let sdk_config = aws_config::SdkConfig::builder()
            .credentials_provider(SharedCredentialsProvider::new(Credentials::new(
                "AKIDTEST",
                "secret",
                Some("token".to_string()),
                None,
                "static",
            )))
            .build();
        let provider = CredentialProvider::new(sdk_config, None);

        let credentials = provider.resolve().await.unwrap();
        assert_eq!(credentials.access_key_id, "AKIDTEST");
        assert_eq!(credentials.secret_access_key, "secret");
        assert_eq!(credentials.session_token.as_deref(), Some("token"));
    }

    #[tokio::test]
    async fn test_missing_provider_fails_fast() {
        let sdk_config = aws_config::SdkConfig::builder().build();
        let provider = CredentialProvider::new(sdk_config, None);

        let err = provider.resolve().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, RelayError::AuthResolution(_)));
    }
}
