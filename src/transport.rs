//! 已簽名請求的傳輸層。
//!
//! 每個請求都會從 [`NoncePool`] 取出一個 nonce 使用，並把回應（無論成功與否）
//! 附帶的 `Replay-Nonce` 放回。非 2xx 回應轉成 [`Error::Ca`]；
//! `badNonce` 只會自動重試一次。

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    error::{Error, Problem, Result},
    http::{HttpClient, HttpResponse, JOSE_CONTENT_TYPE},
    jws::{Payload, Signer},
    nonce::NoncePool,
    protection::{HeaderFields, KeyBinding},
};

#[derive(Debug)]
pub struct Transport {
    http: Arc<dyn HttpClient>,
    nonces: NoncePool,
    new_nonce_url: String,
}

impl Transport {
    /// 建立傳輸層。
    ///
    /// # 參數
    ///
    /// - `http`: 實際發送請求的客戶端。
    /// - `new_nonce_url`: nonce 用完時補充用的 `newNonce` 端點。
    /// - `initial_nonce`: 目錄解析時取得的第一個 nonce。
    pub fn new(http: Arc<dyn HttpClient>, new_nonce_url: impl Into<String>, initial_nonce: Option<String>) -> Self {
        Self {
            http,
            nonces: NoncePool::with_nonce(initial_nonce),
            new_nonce_url: new_nonce_url.into(),
        }
    }

    pub fn http(&self) -> &Arc<dyn HttpClient> {
        &self.http
    }

    pub fn nonces(&self) -> &NoncePool {
        &self.nonces
    }

    /// 簽名並 POST 到 `url`。
    ///
    /// # 回傳
    ///
    /// 2xx 回應原樣回傳；其他狀態回傳帶有問題文件的 [`Error::Ca`]。
    pub fn post(&self, url: &str, payload: &Payload, signer: &Signer, binding: &KeyBinding) -> Result<HttpResponse> {
        match self.send_once(url, payload, signer, binding) {
            Err(Error::Ca(problem)) if problem.is_bad_nonce() => {
                warn!(url, detail = %problem.detail, "CA rejected nonce, retrying once");
                self.send_once(url, payload, signer, binding)
            }
            other => other,
        }
    }

    /// 以空 payload 進行 POST-as-GET。
    pub fn post_as_get(&self, url: &str, signer: &Signer, binding: &KeyBinding) -> Result<HttpResponse> {
        self.post(url, &Payload::Empty, signer, binding)
    }

    fn send_once(&self, url: &str, payload: &Payload, signer: &Signer, binding: &KeyBinding) -> Result<HttpResponse> {
        let nonce = self
            .nonces
            .take_or_fetch(self.http.as_ref(), &self.new_nonce_url)?;

        let fields = HeaderFields {
            url: url.to_string(),
            nonce,
            binding: binding.clone(),
        };
        let body = signer.sign(payload, &fields)?.to_json().map_err(|e| {
            Error::Protocol(format!("could not serialize JWS: {}", e))
        })?;

        let response = self.http.post(url, JOSE_CONTENT_TYPE, body.into_bytes())?;
        debug!(url, status = response.status, "ACME request completed");

        if let Some(nonce) = response.replay_nonce() {
            self.nonces.store(nonce);
        }

        if response.is_success() {
            Ok(response)
        } else {
            Err(Error::Ca(Problem::from_response(&response)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::BAD_NONCE,
        http::MockHttpClient,
        key_pair::{KeyAlgorithm, KeyPair},
    };
    use serde_json::json;

    const NEW_NONCE: &str = "https://ca.test/acme/new-nonce";
    const URL: &str = "https://ca.test/acme/new-order";

    fn setup(initial: Option<&str>) -> (Arc<MockHttpClient>, Transport, Signer) {
        let http = Arc::new(MockHttpClient::new());
        let transport = Transport::new(http.clone(), NEW_NONCE, initial.map(String::from));
        let signer = Signer::new(Arc::new(KeyPair::generate(KeyAlgorithm::EcP256).unwrap()));
        (http, transport, signer)
    }

    fn bad_nonce(fresh: &str) -> HttpResponse {
        HttpResponse::new(400)
            .with_header("Replay-Nonce", fresh)
            .with_header("Content-Type", "application/problem+json")
            .with_json(&json!({"type": BAD_NONCE, "detail": "bad nonce"}))
    }

    fn kid() -> KeyBinding {
        KeyBinding::Kid("https://ca.test/acme/acct/1".into())
    }

    #[test]
    fn test_nonce_rotates_between_requests() {
        let (http, transport, signer) = setup(Some("n1"));
        http.on("POST", URL, HttpResponse::new(200).with_header("Replay-Nonce", "n2"))
            .on("POST", URL, HttpResponse::new(200).with_header("Replay-Nonce", "n3"));

        transport.post_as_get(URL, &signer, &kid()).unwrap();
        transport.post_as_get(URL, &signer, &kid()).unwrap();

        let nonces: Vec<_> = http.requests().iter().filter_map(|r| r.nonce()).collect();
        assert_eq!(nonces, vec!["n1", "n2"]);
        assert_eq!(transport.nonces().take(), Some("n3".to_string()));
    }

    #[test]
    fn test_bad_nonce_retried_once_with_error_nonce() {
        let (http, transport, signer) = setup(Some("stale"));
        http.on("POST", URL, bad_nonce("from-error"))
            .on("POST", URL, HttpResponse::new(201).with_header("Replay-Nonce", "next"));

        let response = transport
            .post(URL, &Payload::Json(json!({"a": 1})), &signer, &kid())
            .unwrap();
        assert_eq!(response.status, 201);

        let requests = http.requests_to("POST", URL);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].nonce().as_deref(), Some("stale"));
        assert_eq!(requests[1].nonce().as_deref(), Some("from-error"));
        assert_eq!(requests[1].payload(), Some(json!({"a": 1})));
    }

    #[test]
    fn test_second_bad_nonce_propagates() {
        let (http, transport, signer) = setup(Some("stale"));
        http.on("POST", URL, bad_nonce("n2"))
            .on("POST", URL, bad_nonce("n3"))
            .on("POST", URL, HttpResponse::new(200));

        let err = transport.post_as_get(URL, &signer, &kid()).unwrap_err();
        match err {
            Error::Ca(problem) => assert!(problem.is_bad_nonce()),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(http.requests_to("POST", URL).len(), 2);
        assert_eq!(transport.nonces().take(), Some("n3".to_string()));
    }

    #[test]
    fn test_other_errors_not_retried() {
        let (http, transport, signer) = setup(Some("n1"));
        http.on(
            "POST",
            URL,
            HttpResponse::new(403)
                .with_header("Replay-Nonce", "n2")
                .with_json(&json!({
                    "type": "urn:ietf:params:acme:error:unauthorized",
                    "detail": "account is not authorized"
                })),
        );

        let err = transport.post_as_get(URL, &signer, &kid()).unwrap_err();
        assert_eq!(
            err.problem().map(|p| p.detail.as_str()),
            Some("account is not authorized")
        );
        assert_eq!(http.requests_to("POST", URL).len(), 1);
        assert_eq!(transport.nonces().take(), Some("n2".to_string()));
    }

    #[test]
    fn test_empty_pool_fetches_new_nonce() {
        let (http, transport, signer) = setup(None);
        http.on("HEAD", NEW_NONCE, HttpResponse::new(200).with_header("Replay-Nonce", "head-nonce"))
            .on("POST", URL, HttpResponse::new(200));

        transport.post_as_get(URL, &signer, &kid()).unwrap();
        assert_eq!(
            http.requests_to("POST", URL)[0].nonce().as_deref(),
            Some("head-nonce")
        );
    }
}
