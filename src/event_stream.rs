//! イベントストリームのバイナリフレーミング
//!
//! 上流プロトコルが使う長さプレフィックス＋CRC検査付きのバイナリメッセージ
//! 形式を実装する。ワイヤ形式は次の通り（数値はすべてビッグエンディアン）:
//!
//! ```text
//! [total_len: u32][headers_len: u32][prelude_crc: u32]
//! [ヘッダブロック: headers_len バイト][ペイロード][message_crc: u32]
//! ```
//!
//! ヘッダは「名前長 u8・名前・値型 u8・型別の値」の繰り返し。
//! 不正なフレームはそのメッセージ限りの `RelayError::Framing` となり、
//! セッション自体は落とさない。

use crate::error::RelayError;
use crate::transcript::TranscriptEvent;

/// プレリュード12バイト + 末尾CRC 4バイト
const OVERHEAD_LEN: usize = 16;
const PRELUDE_LEN: usize = 12;

/// ヘッダ値の型タグ
const TYPE_BOOL_TRUE: u8 = 0;
const TYPE_BOOL_FALSE: u8 = 1;
const TYPE_BYTE: u8 = 2;
const TYPE_INT16: u8 = 3;
const TYPE_INT32: u8 = 4;
const TYPE_INT64: u8 = 5;
const TYPE_BYTE_ARRAY: u8 = 6;
const TYPE_STRING: u8 = 7;
const TYPE_TIMESTAMP: u8 = 8;
const TYPE_UUID: u8 = 9;

/// 型付きのヘッダ値
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    Byte(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    ByteArray(Vec<u8>),
    String(String),
    Timestamp(i64),
    Uuid([u8; 16]),
}

/// ヘッダとペイロードからなるイベントストリームメッセージ
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// 到着順を保持したヘッダ列
    pub headers: Vec<(String, HeaderValue)>,
    pub body: Vec<u8>,
}

impl Message {
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// 文字列型ヘッダの値を取得
    pub fn string_header(&self, name: &str) -> Option<&str> {
        match self.header(name) {
            Some(HeaderValue::String(value)) => Some(value.as_str()),
            _ => None,
        }
    }
}

/// 音声チャンクをAudioEventメッセージに包む
pub fn audio_event_message(payload: Vec<u8>) -> Message {
    Message {
        headers: vec![
            (
                ":message-type".to_string(),
                HeaderValue::String("event".to_string()),
            ),
            (
                ":event-type".to_string(),
                HeaderValue::String("AudioEvent".to_string()),
            ),
        ],
        body: payload,
    }
}

fn encode_header_value(buffer: &mut Vec<u8>, value: &HeaderValue) {
    match value {
        HeaderValue::Bool(true) => buffer.push(TYPE_BOOL_TRUE),
        HeaderValue::Bool(false) => buffer.push(TYPE_BOOL_FALSE),
        HeaderValue::Byte(v) => {
            buffer.push(TYPE_BYTE);
            buffer.push(*v as u8);
        }
        HeaderValue::Int16(v) => {
            buffer.push(TYPE_INT16);
            buffer.extend_from_slice(&v.to_be_bytes());
        }
        HeaderValue::Int32(v) => {
            buffer.push(TYPE_INT32);
            buffer.extend_from_slice(&v.to_be_bytes());
        }
        HeaderValue::Int64(v) => {
            buffer.push(TYPE_INT64);
            buffer.extend_from_slice(&v.to_be_bytes());
        }
        HeaderValue::ByteArray(v) => {
            buffer.push(TYPE_BYTE_ARRAY);
            buffer.extend_from_slice(&(v.len() as u16).to_be_bytes());
            buffer.extend_from_slice(v);
        }
        HeaderValue::String(v) => {
            buffer.push(TYPE_STRING);
            buffer.extend_from_slice(&(v.len() as u16).to_be_bytes());
            buffer.extend_from_slice(v.as_bytes());
        }
        HeaderValue::Timestamp(v) => {
            buffer.push(TYPE_TIMESTAMP);
            buffer.extend_from_slice(&v.to_be_bytes());
        }
        HeaderValue::Uuid(v) => {
            buffer.push(TYPE_UUID);
            buffer.extend_from_slice(v);
        }
    }
}

/// メッセージをワイヤ形式にエンコード
pub fn marshall(message: &Message) -> Vec<u8> {
    let mut headers_bytes = Vec::new();
    for (name, value) in &message.headers {
        headers_bytes.push(name.len() as u8);
        headers_bytes.extend_from_slice(name.as_bytes());
        encode_header_value(&mut headers_bytes, value);
    }

    let total_len = OVERHEAD_LEN + headers_bytes.len() + message.body.len();
    let mut buffer = Vec::with_capacity(total_len);
    buffer.extend_from_slice(&(total_len as u32).to_be_bytes());
    buffer.extend_from_slice(&(headers_bytes.len() as u32).to_be_bytes());
    let prelude_crc = crc32fast::hash(&buffer[0..8]);
    buffer.extend_from_slice(&prelude_crc.to_be_bytes());
    buffer.extend_from_slice(&headers_bytes);
    buffer.extend_from_slice(&message.body);
    let message_crc = crc32fast::hash(&buffer);
    buffer.extend_from_slice(&message_crc.to_be_bytes());
    buffer
}

struct Cursor<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], RelayError> {
        if self.position + len > self.bytes.len() {
            return Err(RelayError::Framing(
                "ヘッダブロックが途中で切れている".to_string(),
            ));
        }
        let slice = &self.bytes[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, RelayError> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16, RelayError> {
        let slice = self.take(2)?;
        Ok(u16::from_be_bytes([slice[0], slice[1]]))
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }
}

fn decode_header_value(cursor: &mut Cursor<'_>) -> Result<HeaderValue, RelayError> {
    let value_type = cursor.take_u8()?;
    match value_type {
        TYPE_BOOL_TRUE => Ok(HeaderValue::Bool(true)),
        TYPE_BOOL_FALSE => Ok(HeaderValue::Bool(false)),
        TYPE_BYTE => Ok(HeaderValue::Byte(cursor.take(1)?[0] as i8)),
        TYPE_INT16 => {
            let slice = cursor.take(2)?;
            Ok(HeaderValue::Int16(i16::from_be_bytes([slice[0], slice[1]])))
        }
        TYPE_INT32 => {
            let slice = cursor.take(4)?;
            Ok(HeaderValue::Int32(i32::from_be_bytes([
                slice[0], slice[1], slice[2], slice[3],
            ])))
        }
        TYPE_INT64 => {
            let slice = cursor.take(8)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(slice);
            Ok(HeaderValue::Int64(i64::from_be_bytes(raw)))
        }
        TYPE_BYTE_ARRAY => {
            let len = cursor.take_u16()? as usize;
            Ok(HeaderValue::ByteArray(cursor.take(len)?.to_vec()))
        }
        TYPE_STRING => {
            let len = cursor.take_u16()? as usize;
            let bytes = cursor.take(len)?;
            let value = std::str::from_utf8(bytes).map_err(|_| {
                RelayError::Framing("文字列ヘッダがUTF-8でない".to_string())
            })?;
            Ok(HeaderValue::String(value.to_string()))
        }
        TYPE_TIMESTAMP => {
            let slice = cursor.take(8)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(slice);
            Ok(HeaderValue::Timestamp(i64::from_be_bytes(raw)))
        }
        TYPE_UUID => {
            let slice = cursor.take(16)?;
            let mut raw = [0u8; 16];
            raw.copy_from_slice(slice);
            Ok(HeaderValue::Uuid(raw))
        }
        other => Err(RelayError::Framing(format!(
            "未知のヘッダ値型: {}",
            other
        ))),
    }
}

/// ワイヤ形式のバッファをメッセージにデコード
///
/// 長さフィールドと2つのCRCを検証する。失敗はこのメッセージ限りの
/// `RelayError::Framing`。
pub fn unmarshall(bytes: &[u8]) -> Result<Message, RelayError> {
    if bytes.len() < OVERHEAD_LEN {
        return Err(RelayError::Framing(format!(
            "フレームが短すぎる: {} バイト",
            bytes.len()
        )));
    }

    let total_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let headers_len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let prelude_crc = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);

    if crc32fast::hash(&bytes[0..8]) != prelude_crc {
        return Err(RelayError::Framing("プレリュードCRC不一致".to_string()));
    }
    if total_len != bytes.len() {
        return Err(RelayError::Framing(format!(
            "長さフィールド不一致: total_len={} 実際={}",
            total_len,
            bytes.len()
        )));
    }
    if PRELUDE_LEN + headers_len + 4 > total_len {
        return Err(RelayError::Framing(format!(
            "ヘッダ長が本体を超えている: headers_len={}",
            headers_len
        )));
    }

    let message_crc = u32::from_be_bytes([
        bytes[total_len - 4],
        bytes[total_len - 3],
        bytes[total_len - 2],
        bytes[total_len - 1],
    ]);
    if crc32fast::hash(&bytes[0..total_len - 4]) != message_crc {
        return Err(RelayError::Framing("メッセージCRC不一致".to_string()));
    }

    let mut cursor = Cursor {
        bytes: &bytes[PRELUDE_LEN..PRELUDE_LEN + headers_len],
        position: 0,
    };
    let mut headers = Vec::new();
    while cursor.remaining() > 0 {
        let name_len = cursor.take_u8()? as usize;
        let name_bytes = cursor.take(name_len)?;
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| RelayError::Framing("ヘッダ名がUTF-8でない".to_string()))?
            .to_string();
        let value = decode_header_value(&mut cursor)?;
        headers.push((name, value));
    }

    let body = bytes[PRELUDE_LEN + headers_len..total_len - 4].to_vec();
    Ok(Message { headers, body })
}

/// デコード済みフレームのルーティング結果
#[derive(Debug, Clone)]
pub enum RelayedEvent {
    /// 通常メッセージ（文字起こしイベント）
    Transcript(TranscriptEvent),
    /// プロトコルレベルのエラー通知
    ProtocolError { message: String },
}

/// メッセージ種別ヘッダで振り分ける
///
/// `:message-type` が `event` なら本文をJSONの文字起こしイベントとして
/// 解析し、それ以外の値なら本文の `Message` フィールドをエラーテキストと
/// するプロトコルエラーにする。1フレームにつき結果はちょうど1つ。
pub fn route_message(message: &Message) -> Result<RelayedEvent, RelayError> {
    let message_type = message.string_header(":message-type").ok_or_else(|| {
        RelayError::Framing(":message-type ヘッダがない".to_string())
    })?;

    if message_type == "event" {
        let event: TranscriptEvent = serde_json::from_slice(&message.body).map_err(|e| {
            RelayError::Framing(format!("文字起こしイベントの解析に失敗: {}", e))
        })?;
        return Ok(RelayedEvent::Transcript(event));
    }

    // 例外メッセージの本文は {"Message": "..."} 形式。崩れていれば生テキスト
    let text = serde_json::from_slice::<serde_json::Value>(&message.body)
        .ok()
        .and_then(|value| {
            value
                .get("Message")
                .and_then(|m| m.as_str())
                .map(|m| m.to_string())
        })
        .unwrap_or_else(|| String::from_utf8_lossy(&message.body).to_string());
    Ok(RelayedEvent::ProtocolError { message: text })
}
