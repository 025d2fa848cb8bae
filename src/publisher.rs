//! 確定セグメントの下流通知
//!
//! 確定した文字起こしセグメントを設定されたキューへfire-and-forgetで
//! 送信する。失敗してもリレーは音声処理を続ける。

use crate::error::RelayError;
use crate::transcript::TranscriptSegment;

/// キュー送信クライアント
///
/// キューURLが未設定の場合は何もしない。
pub struct QueuePublisher {
    client: aws_sdk_sqs::Client,
    queue_url: Option<String>,
}

impl QueuePublisher {
    pub fn new(sdk_config: &aws_config::SdkConfig, queue_url: Option<String>) -> Self {
        Self {
            client: aws_sdk_sqs::Client::new(sdk_config),
            queue_url,
        }
    }

    /// セグメントをJSONで送信し、メッセージIDを返す
    ///
    /// # Errors
    ///
    /// 送信が拒否された場合は `RelayError::Publish`。呼び出し側はログに
    /// 残すだけでセッションを止めない。
    pub async fn publish(
        &self,
        segment: &TranscriptSegment,
    ) -> Result<Option<String>, RelayError> {
        let queue_url = match &self.queue_url {
            Some(url) => url,
            None => return Ok(None),
        };

        let body = serde_json::to_string(segment)
            .map_err(|e| RelayError::Publish(format!("セグメントの変換に失敗: {}", e)))?;
        let output = self
            .client
            .send_message()
            .queue_url(queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| RelayError::Publish(format!("キュー送信に失敗: {}", e)))?;

        Ok(output.message_id().map(|id| id.to_string()))
    }
}
