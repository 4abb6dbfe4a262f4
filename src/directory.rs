use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    http::{HttpClient, HttpError},
    nonce::{fetch_nonce, NonceError},
};

/// 表示處理目錄操作時可能發生的錯誤類型。
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// JSON 解析錯誤。
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// HTTP 請求錯誤。
    #[error("Request error: {0}")]
    Request(#[from] HttpError),
    /// CA 以非 2xx 狀態回應目錄請求。
    #[error("Directory request failed with status {status}: {body}")]
    Status { status: u16, body: String },
    /// 目錄缺少必要端點。
    #[error("Directory is missing required endpoint {0}")]
    MissingEndpoint(&'static str),
    /// 無法取得初始 nonce。
    #[error("Could not obtain initial nonce: {0}")]
    MissingNonce(#[from] NonceError),
}

/// 簡化目錄操作結果的型別。
type DirectoryResult<T> = std::result::Result<T, DirectoryError>;

/// 表示與目錄相關的 API 結構，包含與帳號、nonce、訂單、續期資訊及撤銷憑證相關的 URL。
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    /// 用於新帳號註冊的 API 路徑。
    #[serde(default)]
    pub new_account: String,
    /// 用於取得新的 nonce 值的 API 路徑。
    #[serde(default)]
    pub new_nonce: String,
    /// 用於建立訂單的 API 路徑。
    #[serde(default)]
    pub new_order: String,
    /// 預先授權端點，多數 CA 不提供。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_authz: Option<String>,
    /// 用於撤銷憑證的 API 路徑。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoke_cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_change: Option<String>,
    /// 用於取得續期資訊的 API 路徑，可能不存在。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renewal_info: Option<String>,
    /// CA 的附加資訊，例如服務條款 URL。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl Directory {
    /// 確認三個必要端點都存在。
    pub fn validate(&self) -> DirectoryResult<()> {
        for (name, url) in [
            ("newNonce", &self.new_nonce),
            ("newAccount", &self.new_account),
            ("newOrder", &self.new_order),
        ] {
            if url.is_empty() {
                return Err(DirectoryError::MissingEndpoint(name));
            }
        }
        Ok(())
    }

    /// `meta.termsOfService`，若 CA 有提供。
    pub fn terms_of_service(&self) -> Option<&str> {
        self.meta.as_ref()?.get("termsOfService")?.as_str()
    }
}

/// 解析後的目錄以及第一個可用的 nonce。
#[derive(Debug, Clone)]
pub struct Resolved {
    pub directory: Directory,
    pub nonce: String,
}

/// 取得 CA 目錄並準備第一個 nonce。
///
/// 目錄回應若已附帶 `Replay-Nonce` 則直接使用，否則對 `newNonce` 發送一次 HEAD 請求。
///
/// # 參數
///
/// - `http`: 用來發送請求的客戶端。
/// - `url`: CA 目錄 URL。
///
/// # 回傳
///
/// 成功時回傳 [`Resolved`]，否則回傳 `DirectoryError` 錯誤。
pub fn resolve(http: &dyn HttpClient, url: &str) -> DirectoryResult<Resolved> {
    let response = http.get(url)?;
    if !response.is_success() {
        return Err(DirectoryError::Status {
            status: response.status,
            body: response.text(),
        });
    }

    let directory: Directory = response.json()?;
    directory.validate()?;
    info!(url, "Fetched ACME directory");

    let nonce = match response.replay_nonce() {
        Some(nonce) => nonce.to_string(),
        None => {
            debug!("Directory response carried no nonce");
            fetch_nonce(http, &directory.new_nonce)?
        }
    };

    Ok(Resolved { directory, nonce })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpResponse, MockHttpClient};
    use serde_json::json;

    const DIR_URL: &str = "https://ca.test/directory";

    fn directory_body() -> Value {
        json!({
            "newNonce": "https://ca.test/acme/new-nonce",
            "newAccount": "https://ca.test/acme/new-acct",
            "newOrder": "https://ca.test/acme/new-order",
            "revokeCert": "https://ca.test/acme/revoke-cert",
            "keyChange": "https://ca.test/acme/key-change",
            "meta": {"termsOfService": "https://ca.test/terms"}
        })
    }

    #[test]
    fn test_resolve_exposes_endpoints_and_initial_nonce() {
        let http = MockHttpClient::new();
        http.on("GET", DIR_URL, HttpResponse::new(200).with_json(&directory_body()))
            .on(
                "HEAD",
                "https://ca.test/acme/new-nonce",
                HttpResponse::new(200).with_header("Replay-Nonce", "first-nonce"),
            );

        let resolved = resolve(&http, DIR_URL).unwrap();
        assert_eq!(resolved.directory.new_account, "https://ca.test/acme/new-acct");
        assert_eq!(resolved.directory.new_order, "https://ca.test/acme/new-order");
        assert_eq!(resolved.directory.new_nonce, "https://ca.test/acme/new-nonce");
        assert_eq!(resolved.directory.new_authz, None);
        assert_eq!(resolved.directory.terms_of_service(), Some("https://ca.test/terms"));
        assert_eq!(resolved.nonce, "first-nonce");
    }

    #[test]
    fn test_nonce_from_directory_response() {
        let http = MockHttpClient::new();
        http.on(
            "GET",
            DIR_URL,
            HttpResponse::new(200)
                .with_header("Replay-Nonce", "dir-nonce")
                .with_json(&directory_body()),
        );

        let resolved = resolve(&http, DIR_URL).unwrap();
        assert_eq!(resolved.nonce, "dir-nonce");
        assert!(http.requests_to("HEAD", "https://ca.test/acme/new-nonce").is_empty());
    }

    #[test]
    fn test_missing_endpoint() {
        let http = MockHttpClient::new();
        http.on(
            "GET",
            DIR_URL,
            HttpResponse::new(200).with_json(&json!({
                "newNonce": "https://ca.test/acme/new-nonce",
                "newAccount": "https://ca.test/acme/new-acct"
            })),
        );

        assert!(matches!(
            resolve(&http, DIR_URL),
            Err(DirectoryError::MissingEndpoint("newOrder"))
        ));
    }

    #[test]
    fn test_error_status() {
        let http = MockHttpClient::new();
        http.on("GET", DIR_URL, HttpResponse::new(503).with_body("maintenance"));

        match resolve(&http, DIR_URL) {
            Err(DirectoryError::Status { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "maintenance");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
