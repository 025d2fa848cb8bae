//! 確定セグメントの永続化と問い合わせ
//!
//! ストアは (callId, eventTimestamp) をキーとし、同一キーへの書き込みは
//! 後勝ち。resultId による二次参照を持つ。書き込み・問い合わせの失敗は
//! `RelayError::Persistence` として呼び出し元に返すだけで、稼働中の
//! セッションを終了させることはない。

use crate::error::RelayError;
use crate::transcript::{SegmentItem, TranscriptSegment};
use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// 文字起こし結果ストアの共通トレイト
#[async_trait]
pub trait TranscriptSink: Send + Sync {
    /// セグメントを保存する（同一キーは後勝ち）
    async fn persist(&self, segment: &TranscriptSegment) -> Result<(), RelayError>;

    /// `since` より新しいイベント時刻のセグメントを取得する
    async fn query(
        &self,
        call_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<TranscriptSegment>, RelayError>;

    /// resultId による二次参照
    async fn query_by_result_id(
        &self,
        result_id: &str,
    ) -> Result<Vec<TranscriptSegment>, RelayError>;
}

/// DynamoDBを使うストア実装
///
/// 属性名は既存テーブルに合わせる（callId, eventTimestamp, resultId,
/// speakerName, startTime, endTime, transcript）。単語要素はJSON文字列
/// として items 属性に入れる。
pub struct DynamoDbSink {
    client: aws_sdk_dynamodb::Client,
    table_name: String,
}

impl DynamoDbSink {
    pub fn new(sdk_config: &aws_config::SdkConfig, table_name: String) -> Self {
        Self {
            client: aws_sdk_dynamodb::Client::new(sdk_config),
            table_name,
        }
    }

    fn segment_from_item(item: &HashMap<String, AttributeValue>) -> Option<TranscriptSegment> {
        let string_attr = |name: &str| -> Option<String> {
            item.get(name).and_then(|v| v.as_s().ok()).cloned()
        };
        let number_attr = |name: &str| -> f64 {
            item.get(name)
                .and_then(|v| v.as_n().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0)
        };

        let items: Vec<SegmentItem> = string_attr("items")
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();

        Some(TranscriptSegment {
            call_id: string_attr("callId")?,
            speaker_name: string_attr("speakerName").unwrap_or_default(),
            result_id: string_attr("resultId").unwrap_or_default(),
            start_time: number_attr("startTime"),
            end_time: number_attr("endTime"),
            transcript: string_attr("transcript").unwrap_or_default(),
            event_timestamp: string_attr("eventTimestamp")?,
            items,
        })
    }

    fn item_from_segment(
        segment: &TranscriptSegment,
    ) -> Result<HashMap<String, AttributeValue>, RelayError> {
        let mut item = HashMap::new();
        item.insert(
            "callId".to_string(),
            AttributeValue::S(segment.call_id.clone()),
        );
        item.insert(
            "eventTimestamp".to_string(),
            AttributeValue::S(segment.event_timestamp.clone()),
        );
        item.insert(
            "resultId".to_string(),
            AttributeValue::S(segment.result_id.clone()),
        );
        item.insert(
            "speakerName".to_string(),
            AttributeValue::S(segment.speaker_name.clone()),
        );
        item.insert(
            "startTime".to_string(),
            AttributeValue::N(segment.start_time.to_string()),
        );
        item.insert(
            "endTime".to_string(),
            AttributeValue::N(segment.end_time.to_string()),
        );
        item.insert(
            "transcript".to_string(),
            AttributeValue::S(segment.transcript.clone()),
        );
        if !segment.items.is_empty() {
            let raw = serde_json::to_string(&segment.items)
                .map_err(|e| RelayError::Persistence(format!("単語要素の変換に失敗: {}", e)))?;
            item.insert("items".to_string(), AttributeValue::S(raw));
        }
        Ok(item)
    }
}

#[async_trait]
impl TranscriptSink for DynamoDbSink {
    async fn persist(&self, segment: &TranscriptSegment) -> Result<(), RelayError> {
        let item = Self::item_from_segment(segment)?;
        log::trace!(
            "セグメントを保存: callId={} eventTimestamp={}",
            segment.call_id,
            segment.event_timestamp
        );
        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .send()
            .await
            .map_err(|e| RelayError::Persistence(format!("書き込みに失敗: {}", e)))?;
        Ok(())
    }

    async fn query(
        &self,
        call_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<TranscriptSegment>, RelayError> {
        let output = self
            .client
            .query()
            .table_name(&self.table_name)
            .key_condition_expression("callId = :callId AND eventTimestamp > :eventTimestamp")
            .expression_attribute_values(":callId", AttributeValue::S(call_id.to_string()))
            .expression_attribute_values(
                ":eventTimestamp",
                AttributeValue::S(crate::transcript::event_timestamp(since)),
            )
            .send()
            .await
            .map_err(|e| RelayError::Persistence(format!("問い合わせに失敗: {}", e)))?;

        Ok(output
            .items()
            .iter()
            .filter_map(Self::segment_from_item)
            .collect())
    }

    async fn query_by_result_id(
        &self,
        result_id: &str,
    ) -> Result<Vec<TranscriptSegment>, RelayError> {
        let output = self
            .client
            .query()
            .table_name(&self.table_name)
            .index_name("resultId-index")
            .key_condition_expression("resultId = :resultId")
            .expression_attribute_values(":resultId", AttributeValue::S(result_id.to_string()))
            .send()
            .await
            .map_err(|e| RelayError::Persistence(format!("二次参照に失敗: {}", e)))?;

        Ok(output
            .items()
            .iter()
            .filter_map(Self::segment_from_item)
            .collect())
    }
}

/// プロセス内ストア実装
///
/// テーブル未設定のローカル実行とテストで使う。ストア自体がキー毎の
/// 原子的な書き込みを提供するため、呼び出し側のロックは不要。
#[derive(Default)]
pub struct MemorySink {
    segments: Mutex<BTreeMap<(String, String), TranscriptSegment>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TranscriptSink for MemorySink {
    async fn persist(&self, segment: &TranscriptSegment) -> Result<(), RelayError> {
        let key = (segment.call_id.clone(), segment.event_timestamp.clone());
        self.segments
            .lock()
            .map_err(|_| RelayError::Persistence("ストアのロックに失敗".to_string()))?
            .insert(key, segment.clone());
        Ok(())
    }

    async fn query(
        &self,
        call_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<TranscriptSegment>, RelayError> {
        let since = crate::transcript::event_timestamp(since);
        let segments = self
            .segments
            .lock()
            .map_err(|_| RelayError::Persistence("ストアのロックに失敗".to_string()))?;
        Ok(segments
            .iter()
            .filter(|((id, timestamp), _)| id == call_id && timestamp.as_str() > since.as_str())
            .map(|(_, segment)| segment.clone())
            .collect())
    }

    async fn query_by_result_id(
        &self,
        result_id: &str,
    ) -> Result<Vec<TranscriptSegment>, RelayError> {
        let segments = self
            .segments
            .lock()
            .map_err(|_| RelayError::Persistence("ストアのロックに失敗".to_string()))?;
        Ok(segments
            .values()
            .filter(|segment| segment.result_id == result_id)
            .cloned()
            .collect())
    }
}
