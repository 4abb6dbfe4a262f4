//! 一次 ACME 連線所需的全部狀態。
//!
//! `Session` 擁有傳輸層（以及其中的 nonce）、簽名器、目錄與帳戶 URL。
//! 它可以跨執行緒共用，nonce 由互斥鎖保護。

use std::sync::{Arc, PoisonError, RwLock};

use crate::{
    directory::{resolve, Directory},
    error::{Error, Result},
    http::{HttpClient, HttpResponse},
    jws::{Payload, Signer},
    protection::KeyBinding,
    signature::AccountKey,
    transport::Transport,
};

#[derive(Debug)]
pub struct Session {
    transport: Transport,
    signer: Signer,
    directory: Directory,
    account_url: RwLock<Option<String>>,
}

impl Session {
    /// 解析目錄並建立工作階段。
    ///
    /// # 參數
    ///
    /// - `http`: HTTP 客戶端。
    /// - `directory_url`: CA 目錄 URL。
    /// - `key`: 用來簽署所有請求的帳戶金鑰。
    pub fn connect(http: Arc<dyn HttpClient>, directory_url: &str, key: Arc<dyn AccountKey>) -> Result<Self> {
        let resolved = resolve(http.as_ref(), directory_url)?;
        let transport = Transport::new(http, &resolved.directory.new_nonce, Some(resolved.nonce));

        Ok(Self {
            transport,
            signer: Signer::new(key),
            directory: resolved.directory,
            account_url: RwLock::new(None),
        })
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    pub fn http(&self) -> &Arc<dyn HttpClient> {
        self.transport.http()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// 帳戶 URL，建立或查到帳戶之後才存在。
    pub fn account_url(&self) -> Option<String> {
        self.account_url
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_account_url(&self, url: impl Into<String>) {
        *self
            .account_url
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(url.into());
    }

    /// 以完整 JWK 簽名的 POST，只用於 `newAccount`。
    pub fn post_with_jwk(&self, url: &str, payload: &Payload) -> Result<HttpResponse> {
        self.transport.post(url, payload, &self.signer, &KeyBinding::Jwk)
    }

    /// 以帳戶 URL 作為 `kid` 的 POST。
    pub fn post(&self, url: &str, payload: &Payload) -> Result<HttpResponse> {
        self.transport.post(url, payload, &self.signer, &self.kid()?)
    }

    pub fn post_as_get(&self, url: &str) -> Result<HttpResponse> {
        self.transport.post_as_get(url, &self.signer, &self.kid()?)
    }

    fn kid(&self) -> Result<KeyBinding> {
        self.account_url()
            .map(KeyBinding::Kid)
            .ok_or_else(|| Error::Protocol("no account URL; ensure the account first".into()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        http::MockHttpClient,
        key_pair::{KeyAlgorithm, KeyPair},
    };
    use serde_json::json;

    pub const DIR_URL: &str = "https://ca.test/directory";
    pub const NEW_NONCE: &str = "https://ca.test/acme/new-nonce";
    pub const NEW_ACCOUNT: &str = "https://ca.test/acme/new-acct";
    pub const NEW_ORDER: &str = "https://ca.test/acme/new-order";
    pub const ACCOUNT_URL: &str = "https://ca.test/acme/acct/1";

    /// 排入目錄與初始 nonce 的模擬客戶端。
    pub fn mock_ca() -> Arc<MockHttpClient> {
        let http = Arc::new(MockHttpClient::new());
        http.on(
            "GET",
            DIR_URL,
            HttpResponse::new(200)
                .with_header("Replay-Nonce", "nonce-0")
                .with_json(&json!({
                    "newNonce": NEW_NONCE,
                    "newAccount": NEW_ACCOUNT,
                    "newOrder": NEW_ORDER
                })),
        )
        .serve_nonces(NEW_NONCE);
        http
    }

    pub fn connect(http: &Arc<MockHttpClient>) -> Session {
        let key = Arc::new(KeyPair::generate(KeyAlgorithm::EcP256).unwrap());
        Session::connect(http.clone(), DIR_URL, key).unwrap()
    }

    /// 已有帳戶 URL 的工作階段。
    pub fn connected_with_account(http: &Arc<MockHttpClient>) -> Session {
        let session = connect(http);
        session.set_account_url(ACCOUNT_URL);
        session
    }

    #[test]
    fn test_kid_required_before_account() {
        let http = mock_ca();
        let session = connect(&http);

        assert!(matches!(
            session.post_as_get("https://ca.test/acme/order/1"),
            Err(Error::Protocol(_))
        ));
        assert!(http.requests_to("POST", "https://ca.test/acme/order/1").is_empty());
    }

    #[test]
    fn test_binding_switches_after_account() {
        let http = mock_ca();
        let session = connect(&http);
        http.on(
            "POST",
            NEW_ACCOUNT,
            HttpResponse::new(201).with_header("Replay-Nonce", "nonce-1"),
        )
        .on("POST", NEW_ORDER, HttpResponse::new(201));

        session
            .post_with_jwk(NEW_ACCOUNT, &Payload::Json(json!({})))
            .unwrap();
        session.set_account_url(ACCOUNT_URL);
        session.post(NEW_ORDER, &Payload::Json(json!({}))).unwrap();

        let first = http.requests_to("POST", NEW_ACCOUNT)[0].protected_header().unwrap();
        assert!(first.get("jwk").is_some());
        assert!(first.get("kid").is_none());
        assert_eq!(first["nonce"], "nonce-0");

        let second = http.requests_to("POST", NEW_ORDER)[0].protected_header().unwrap();
        assert_eq!(second["kid"], ACCOUNT_URL);
        assert!(second.get("jwk").is_none());
        assert_eq!(second["nonce"], "nonce-1");
        assert_eq!(second["url"], NEW_ORDER);
    }
}
