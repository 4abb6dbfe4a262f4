//! 最底層的 HTTP 介面。
//!
//! 協議邏輯只依賴 [`HttpClient`]，正式環境使用 [`ReqwestClient`]，
//! 測試與離線情境使用 [`MockHttpClient`] 依序回放預先排好的回應。

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::jws::Jws;

/// ACME 請求使用的 Content-Type。
pub const JOSE_CONTENT_TYPE: &str = "application/jose+json";

/// HTTP 層的錯誤。
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::ToStrError),
    #[error("Connection failed: {0}")]
    Connection(String),
}

/// 一個已讀完本文的 HTTP 回應。標頭名稱一律以小寫保存。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_json(self, value: &Value) -> Self {
        self.with_body(value.to_string())
    }

    /// 以不區分大小寫的方式取得標頭值。
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn replay_nonce(&self) -> Option<&str> {
        self.header("replay-nonce").filter(|n| !n.is_empty())
    }

    pub fn location(&self) -> Option<&str> {
        self.header("location")
    }

    /// 解析 `Retry-After`：秒數或 HTTP-date。過去的日期視為零秒。
    pub fn retry_after(&self) -> Option<Duration> {
        self.header("retry-after")
            .and_then(|value| parse_retry_after(value, Utc::now()))
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

pub(crate) fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// 發送 HTTP 請求的最小介面。
pub trait HttpClient: Send + Sync + fmt::Debug {
    fn get(&self, url: &str) -> Result<HttpResponse, HttpError>;

    fn head(&self, url: &str) -> Result<HttpResponse, HttpError>;

    fn post(&self, url: &str, content_type: &str, body: Vec<u8>) -> Result<HttpResponse, HttpError>;
}

/// 以 `reqwest` 阻塞式客戶端實作的 [`HttpClient`]。
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: Client,
}

impl ReqwestClient {
    /// 建立客戶端。
    ///
    /// # 參數
    ///
    /// - `timeout`: 單一請求的逾時上限，確保任何網路呼叫都不會無限阻塞。
    /// - `user_agent`: 送出的 `User-Agent`。
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, HttpError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client })
    }

    fn convert(response: reqwest::blocking::Response) -> Result<HttpResponse, HttpError> {
        let status = response.status().as_u16();
        let mut headers = Vec::new();
        for (name, value) in response.headers() {
            headers.push((name.as_str().to_ascii_lowercase(), value.to_str()?.to_string()));
        }
        let body = response.bytes()?.to_vec();
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

impl HttpClient for ReqwestClient {
    fn get(&self, url: &str) -> Result<HttpResponse, HttpError> {
        Self::convert(self.client.get(url).send()?)
    }

    fn head(&self, url: &str) -> Result<HttpResponse, HttpError> {
        Self::convert(self.client.head(url).send()?)
    }

    fn post(&self, url: &str, content_type: &str, body: Vec<u8>) -> Result<HttpResponse, HttpError> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", content_type)
            .body(body)
            .send()?;
        Self::convert(response)
    }
}

/// [`MockHttpClient`] 記錄下來的請求。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: String,
    pub url: String,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    /// 將請求本文視為 JWS 解析。
    pub fn jws(&self) -> Option<Jws> {
        Jws::from_json(&self.body).ok()
    }

    /// 解碼後的保護頭。
    pub fn protected_header(&self) -> Option<Value> {
        self.jws()?.protected_header().ok()
    }

    pub fn nonce(&self) -> Option<String> {
        self.protected_header()?
            .get("nonce")?
            .as_str()
            .map(ToString::to_string)
    }

    /// 解碼後的 payload；POST-as-GET 回傳 `None`。
    pub fn payload(&self) -> Option<Value> {
        self.jws()?.payload().ok().flatten()
    }
}

/// 依 `(method, url)` 排隊回放回應的模擬客戶端，並記錄所有請求。
///
/// 同一路徑的回應依加入順序取出；沒有預排回應時回傳 [`HttpError::Connection`]，
/// 除非該 URL 以 [`MockHttpClient::serve_nonces`] 註冊為 nonce 端點。
#[derive(Debug, Default)]
pub struct MockHttpClient {
    responses: Mutex<HashMap<(String, String), VecDeque<HttpResponse>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    nonce_endpoints: Mutex<HashSet<String>>,
    issued_nonces: AtomicU64,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 為指定方法與 URL 排入一個回應。
    pub fn on(&self, method: &str, url: &str, response: HttpResponse) -> &Self {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((method.to_ascii_uppercase(), url.to_string()))
            .or_default()
            .push_back(response);
        self
    }

    /// 讓 `url` 的 HEAD 請求在沒有預排回應時回傳一個從未用過的 nonce。
    pub fn serve_nonces(&self, url: &str) -> &Self {
        self.nonce_endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.to_string());
        self
    }

    /// 目前為止收到的所有請求。
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 指定方法與 URL 的請求。
    pub fn requests_to(&self, method: &str, url: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method.to_ascii_uppercase() && r.url == url)
            .collect()
    }

    /// 尚未被取用的回應數量。
    pub fn pending_responses(&self) -> usize {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(VecDeque::len)
            .sum()
    }

    fn respond(&self, method: &str, url: &str, body: Vec<u8>) -> Result<HttpResponse, HttpError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedRequest {
                method: method.to_string(),
                url: url.to_string(),
                body,
            });

        let queued = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&(method.to_string(), url.to_string()))
            .and_then(VecDeque::pop_front);
        if let Some(response) = queued {
            return Ok(response);
        }

        let serves_nonce = method == "HEAD"
            && self
                .nonce_endpoints
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(url);
        if serves_nonce {
            let n = self.issued_nonces.fetch_add(1, Ordering::SeqCst);
            return Ok(HttpResponse::new(200).with_header("Replay-Nonce", format!("mock-nonce-{}", n)));
        }

        Err(HttpError::Connection(format!("no mock response for {} {}", method, url)))
    }
}

impl HttpClient for MockHttpClient {
    fn get(&self, url: &str) -> Result<HttpResponse, HttpError> {
        self.respond("GET", url, Vec::new())
    }

    fn head(&self, url: &str) -> Result<HttpResponse, HttpError> {
        self.respond("HEAD", url, Vec::new())
    }

    fn post(&self, url: &str, _content_type: &str, body: Vec<u8>) -> Result<HttpResponse, HttpError> {
        self.respond("POST", url, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let response = HttpResponse::new(200).with_header("Replay-Nonce", "abc");
        assert_eq!(response.header("replay-nonce"), Some("abc"));
        assert_eq!(response.replay_nonce(), Some("abc"));
        assert_eq!(response.location(), None);
    }

    #[test]
    fn test_retry_after_seconds_and_dates() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap();
        assert_eq!(parse_retry_after(" 7 ", now), Some(Duration::from_secs(7)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:30 GMT", now),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:27:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn test_mock_replays_in_order_and_records() {
        let mock = MockHttpClient::new();
        mock.on("GET", "https://ca.test/a", HttpResponse::new(200).with_body("one"))
            .on("GET", "https://ca.test/a", HttpResponse::new(200).with_body("two"));

        assert_eq!(mock.get("https://ca.test/a").unwrap().text(), "one");
        assert_eq!(mock.get("https://ca.test/a").unwrap().text(), "two");
        assert!(matches!(
            mock.get("https://ca.test/a"),
            Err(HttpError::Connection(_))
        ));
        assert_eq!(mock.requests_to("GET", "https://ca.test/a").len(), 3);
        assert_eq!(mock.pending_responses(), 0);
    }

    #[test]
    fn test_nonce_endpoint_issues_unique_values() {
        let mock = MockHttpClient::new();
        mock.serve_nonces("https://ca.test/nonce");

        let first = mock.head("https://ca.test/nonce").unwrap();
        let second = mock.head("https://ca.test/nonce").unwrap();
        assert_ne!(first.replay_nonce(), second.replay_nonce());
        assert!(mock.get("https://ca.test/nonce").is_err());
    }

    #[test]
    fn test_reqwest_client_collects_headers() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("HEAD", "/acme/new-nonce")
            .with_status(200)
            .with_header("Replay-Nonce", "server-nonce")
            .create();

        let client = ReqwestClient::new(Duration::from_secs(5), "acme-driver-test").unwrap();
        let response = client
            .head(&format!("{}/acme/new-nonce", server.url()))
            .unwrap();

        mock.assert();
        assert_eq!(response.status, 200);
        assert_eq!(response.replay_nonce(), Some("server-nonce"));
    }

    #[test]
    fn test_reqwest_client_posts_jose_body() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/acme/new-order")
            .match_header("content-type", JOSE_CONTENT_TYPE)
            .with_status(201)
            .with_header("Location", "https://ca.test/order/1")
            .with_body("{}")
            .create();

        let client = ReqwestClient::new(Duration::from_secs(5), "acme-driver-test").unwrap();
        let response = client
            .post(
                &format!("{}/acme/new-order", server.url()),
                JOSE_CONTENT_TYPE,
                b"{}".to_vec(),
            )
            .unwrap();

        mock.assert();
        assert_eq!(response.status, 201);
        assert_eq!(response.location(), Some("https://ca.test/order/1"));
    }
}
