//! 文字起こしイベントのワイヤ型と永続化型
//!
//! 上流から届くJSONイベント（PascalCaseのフィールド名）と、結果ストアに
//! 保存するセグメント（camelCaseの属性名）を明示的な型として定義する。
//! 境界で形を検証し、認識できない形は伝播させずにフレーミングエラーと
//! して扱う。

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// 上流の文字起こしイベント本文
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TranscriptEvent {
    pub transcript: Option<TranscriptBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TranscriptBody {
    #[serde(default)]
    pub results: Vec<RecognitionResult>,
}

/// 1発話分の認識結果
///
/// `result_id` は同一発話の改訂をまたいで安定している。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RecognitionResult {
    pub result_id: Option<String>,
    #[serde(default)]
    pub start_time: f64,
    #[serde(default)]
    pub end_time: f64,
    pub is_partial: bool,
    #[serde(default)]
    pub alternatives: Vec<RecognitionAlternative>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RecognitionAlternative {
    pub transcript: Option<String>,
    #[serde(default)]
    pub items: Vec<RecognitionItem>,
}

/// 単語レベルの要素
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RecognitionItem {
    pub content: Option<String>,
    #[serde(default)]
    pub start_time: f64,
    #[serde(default)]
    pub end_time: f64,
    pub stable: Option<bool>,
    #[serde(rename = "Type")]
    pub item_type: Option<String>,
    pub vocabulary_filter_match: Option<bool>,
}

/// 永続化される文字起こしセグメント
///
/// (callId, eventTimestamp) をキーとし、resultId で二次参照する。
/// 確定結果（is-partialがfalse）だけが保存され、作成後は変更されない。
/// 同じ result_id の改訂は新しいセグメントとして置き換わる。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptSegment {
    pub call_id: String,
    pub speaker_name: String,
    pub result_id: String,
    pub start_time: f64,
    pub end_time: f64,
    pub transcript: String,
    /// 受信時刻（RFC 3339）。ストアのソートキー
    pub event_timestamp: String,
    #[serde(default)]
    pub items: Vec<SegmentItem>,
}

/// セグメントに添付する単語要素
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SegmentItem {
    pub content: String,
    pub start_time: f64,
    pub end_time: f64,
    pub stable: bool,
    pub item_type: String,
    pub vocabulary_filter_match: bool,
}

/// RFC 3339（ミリ秒精度）のタイムスタンプ文字列
pub fn event_timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// イベントから確定セグメントだけを抽出する
///
/// 部分結果はライブモニタ用にリスナーへ流すのみで、ここでは捨てる。
/// 各確定結果の第一候補を採用し、呼び出し識別子・話者ラベル・受信時刻を
/// 添付する。
pub fn finalized_segments(
    event: &TranscriptEvent,
    call_id: &str,
    speaker_name: &str,
    received_at: DateTime<Utc>,
) -> Vec<TranscriptSegment> {
    let results = match &event.transcript {
        Some(body) => &body.results,
        None => return Vec::new(),
    };

    results
        .iter()
        .filter(|result| !result.is_partial)
        .filter_map(|result| {
            let alternative = result.alternatives.first()?;
            let text = alternative.transcript.clone()?;
            Some(TranscriptSegment {
                call_id: call_id.to_string(),
                speaker_name: speaker_name.to_string(),
                result_id: result.result_id.clone().unwrap_or_default(),
                start_time: result.start_time,
                end_time: result.end_time,
                transcript: text,
                event_timestamp: event_timestamp(received_at),
                items: alternative
                    .items
                    .iter()
                    .map(|item| SegmentItem {
                        content: item.content.clone().unwrap_or_default(),
                        start_time: item.start_time,
                        end_time: item.end_time,
                        stable: item.stable.unwrap_or(false),
                        item_type: item.item_type.clone().unwrap_or_default(),
                        vocabulary_filter_match: item.vocabulary_filter_match.unwrap_or(false),
                    })
                    .collect(),
            })
        })
        .collect()
}
