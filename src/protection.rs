use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::signature::{AccountKey, SignatureError};

type Result<T> = std::result::Result<T, SignatureError>;

/// 保護頭中用來識別簽名者的方式。
///
/// ACME 規定只有 `newAccount`（以及 key rollover）使用完整的 `jwk`，
/// 其他請求一律以帳戶 URL 作為 `kid`。由誰選擇綁定方式由呼叫端決定，簽名器不做假設。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyBinding {
    /// 在保護頭內嵌入完整公開 JWK。
    Jwk,
    /// 以帳戶 URL 作為 key ID。
    Kid(String),
}

/// 由呼叫端提供的保護頭欄位。
#[derive(Debug, Clone)]
pub struct HeaderFields {
    pub url: String,
    pub nonce: String,
    pub binding: KeyBinding,
}

/// 用於生成保護頭（Protected Header）的結構體。
pub struct Protection<'a> {
    key: &'a dyn AccountKey,
}

/// 表示 JWS 保護頭部的資料結構，序列化後再以 URL 安全 Base64 編碼。
#[derive(Debug, Serialize)]
pub struct ProtectedHeader {
    /// 簽章演算法
    alg: String,
    /// 用於防止重放攻擊的隨機數
    nonce: String,
    /// 請求目標 URL
    url: String,
    /// 可選的 JSON Web Key (JWK)
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<JsonValue>,
    /// 可選的密鑰標識符 (Key ID)
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

impl ProtectedHeader {
    /// 將保護頭序列化後轉換為 URL 安全 Base64 字串。
    ///
    /// # Errors
    ///
    /// 序列化失敗時回傳 [`SignatureError::SerializationError`]。
    pub fn to_base64url(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn kid(&self) -> Option<&str> {
        self.kid.as_deref()
    }

    pub fn jwk(&self) -> Option<&JsonValue> {
        self.jwk.as_ref()
    }
}

impl<'a> Protection<'a> {
    /// 建立一個新的 [`Protection`] 實例，演算法由金鑰決定。
    pub fn new(key: &'a dyn AccountKey) -> Self {
        Self { key }
    }

    /// 根據呼叫端提供的欄位生成 [`ProtectedHeader`]。
    ///
    /// # Errors
    ///
    /// 金鑰演算法不受支援或 JWK 產生失敗時回傳相應的 [`SignatureError`]。
    pub fn create_header(&self, fields: &HeaderFields) -> Result<ProtectedHeader> {
        let alg = self.key.algorithm()?.as_str().to_string();

        let (jwk, kid) = match &fields.binding {
            KeyBinding::Jwk => (Some(self.key.jwk()?.to_value()?), None),
            KeyBinding::Kid(kid) => (None, Some(kid.clone())),
        };

        Ok(ProtectedHeader {
            alg,
            nonce: fields.nonce.clone(),
            url: fields.url.clone(),
            jwk,
            kid,
        })
    }
}

impl std::fmt::Display for ProtectedHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        serde_json::to_string(self)
            .map_err(|_| std::fmt::Error)
            .and_then(|s| write!(f, "{}", s))
    }
}
