//! 上流エンドポイント向けの署名付きURL生成
//!
//! 正規リクエストの構築から署名鍵の導出までを決定的に行う。
//! 外部プロトコルとの相互運用のため、出力は参照実装とバイト単位で
//! 一致しなければならない。正規化時と最終組み立て時で同じ
//! パーセントエンコード規則を使うこと（揃っていないと署名が検証されない）。

use crate::error::RelayError;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;

/// 署名付きURL生成のオプション
#[derive(Debug, Clone)]
pub struct PresignOptions {
    /// アクセスキーID
    pub key: String,
    /// シークレットアクセスキー
    pub secret: String,
    /// セッショントークン（短期認証情報の場合）
    pub session_token: Option<String>,
    /// URLスキーム（上流接続では "wss"）
    pub protocol: String,
    /// 対象リージョン
    pub region: String,
    /// 署名の有効期間（秒）
    pub expires: u64,
    /// 署名タイムスタンプ（呼び出し側が与える。決定性のため内部で時刻は取らない）
    pub timestamp: DateTime<Utc>,
    /// 追加のクエリパラメータ
    pub query: BTreeMap<String, String>,
}

/// ISO-8601基本形式のタイムスタンプ（コロン・ハイフン・小数秒なし）
fn to_amz_time(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%Y%m%dT%H%M%SZ").to_string()
}

/// 日付部分（YYYYMMDD）
fn to_amz_date(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%Y%m%d").to_string()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// 入力のSHA-256ハッシュ（16進小文字）
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hmac_sha256(key: &[u8], input: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMACは任意長の鍵を受け付ける");
    mac.update(input.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

fn encode_component(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// 正規クエリ文字列（キーをバイト順でソートし、キー・値ともにエンコード）
fn create_canonical_query_string(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{}={}", encode_component(key), encode_component(value)))
        .collect::<Vec<_>>()
        .join("&")
}

/// 正規ヘッダ（名前を小文字化・トリムしてソート、各行を改行で終端）
fn create_canonical_headers(headers: &BTreeMap<String, String>) -> String {
    let mut entries: Vec<(String, &str)> = headers
        .iter()
        .map(|(name, value)| (name.to_lowercase().trim().to_string(), value.trim()))
        .collect();
    entries.sort();
    entries
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value))
        .collect()
}

/// 署名対象ヘッダ一覧（小文字名をソートしセミコロン連結）
fn create_signed_headers(headers: &BTreeMap<String, String>) -> String {
    let mut names: Vec<String> = headers
        .keys()
        .map(|name| name.to_lowercase().trim().to_string())
        .collect();
    names.sort();
    names.join(";")
}

fn create_canonical_request(
    method: &str,
    pathname: &str,
    query: &BTreeMap<String, String>,
    headers: &BTreeMap<String, String>,
    payload_hash: &str,
) -> String {
    [
        method.to_uppercase(),
        pathname.to_string(),
        create_canonical_query_string(query),
        create_canonical_headers(headers),
        create_signed_headers(headers),
        payload_hash.to_string(),
    ]
    .join("\n")
}

/// 認証スコープ（date/region/service/aws4_request）
fn create_credential_scope(timestamp: &DateTime<Utc>, region: &str, service: &str) -> String {
    [
        to_amz_date(timestamp),
        region.to_string(),
        service.to_string(),
        "aws4_request".to_string(),
    ]
    .join("/")
}

fn create_string_to_sign(
    timestamp: &DateTime<Utc>,
    region: &str,
    service: &str,
    canonical_request: &str,
) -> String {
    [
        "AWS4-HMAC-SHA256".to_string(),
        to_amz_time(timestamp),
        create_credential_scope(timestamp, region, service),
        sha256_hex(canonical_request),
    ]
    .join("\n")
}

/// 署名鍵を4段のHMAC-SHA256で導出し、string-to-signに署名する
fn create_signature(
    secret: &str,
    timestamp: &DateTime<Utc>,
    region: &str,
    service: &str,
    string_to_sign: &str,
) -> String {
    let date_key = hmac_sha256(format!("AWS4{}", secret).as_bytes(), &to_amz_date(timestamp));
    let region_key = hmac_sha256(&date_key, region);
    let service_key = hmac_sha256(&region_key, service);
    let signing_key = hmac_sha256(&service_key, "aws4_request");
    hex_encode(&hmac_sha256(&signing_key, string_to_sign))
}

/// 署名付きURLを組み立てる
///
/// # Arguments
///
/// * `method` - HTTPメソッド
/// * `host` - 対象ホスト（ポート含む）
/// * `path` - リテラルパス
/// * `service` - サービス名（認証スコープに入る）
/// * `payload_hash` - ペイロードのSHA-256（16進）
/// * `options` - 認証情報・リージョン・タイムスタンプなど
///
/// # Errors
///
/// ホスト・リージョン・認証情報が欠けている場合は `RelayError::Signing`。
pub fn create_presigned_url(
    method: &str,
    host: &str,
    path: &str,
    service: &str,
    payload_hash: &str,
    options: &PresignOptions,
) -> Result<String, RelayError> {
    if host.is_empty() {
        return Err(RelayError::Signing("ホストが指定されていない".to_string()));
    }
    if options.region.is_empty() {
        return Err(RelayError::Signing("リージョンが指定されていない".to_string()));
    }
    if options.key.is_empty() || options.secret.is_empty() {
        return Err(RelayError::Signing("認証情報が指定されていない".to_string()));
    }

    let mut headers = BTreeMap::new();
    headers.insert("Host".to_string(), host.to_string());

    let mut query = options.query.clone();
    query.insert(
        "X-Amz-Algorithm".to_string(),
        "AWS4-HMAC-SHA256".to_string(),
    );
    query.insert(
        "X-Amz-Credential".to_string(),
        format!(
            "{}/{}",
            options.key,
            create_credential_scope(&options.timestamp, &options.region, service)
        ),
    );
    query.insert("X-Amz-Date".to_string(), to_amz_time(&options.timestamp));
    query.insert("X-Amz-Expires".to_string(), options.expires.to_string());
    query.insert(
        "X-Amz-SignedHeaders".to_string(),
        create_signed_headers(&headers),
    );
    if let Some(token) = &options.session_token {
        query.insert("X-Amz-Security-Token".to_string(), token.clone());
    }

    let canonical_request =
        create_canonical_request(method, path, &query, &headers, payload_hash);
    let string_to_sign = create_string_to_sign(
        &options.timestamp,
        &options.region,
        service,
        &canonical_request,
    );
    let signature = create_signature(
        &options.secret,
        &options.timestamp,
        &options.region,
        service,
        &string_to_sign,
    );
    query.insert("X-Amz-Signature".to_string(), signature);

    Ok(format!(
        "{}://{}{}?{}",
        options.protocol,
        host,
        path,
        create_canonical_query_string(&query)
    ))
}
