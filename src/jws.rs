//! 此模組提供 JSON Web Signature (JWS) 的結構與簽名器。
//!
//! 每個 ACME 請求都包成 flattened JSON 形式的 JWS：`{protected, payload, signature}`。

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    protection::{HeaderFields, Protection},
    signature::{AccountKey, SignatureError},
};

/// 表示一個 JSON Web Signature (JWS) 物件，三個欄位皆已 URL 安全 Base64 編碼。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Jws {
    /// 對應 JWS 中的 "protected" 欄位。
    #[serde(rename = "protected")]
    header: String,
    payload: String,
    signature: String,
}

/// 解析既有 JWS 時可能發生的錯誤。
#[derive(Error, Debug)]
pub enum JwsError {
    #[error("Base64 decode error: {0}")]
    Base64DecodeError(#[from] base64::DecodeError),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl Jws {
    /// 將 `Jws` 實例序列化為 JSON 字串。
    pub fn to_json(&self) -> Result<String, JwsError> {
        Ok(serde_json::to_string(self)?)
    }

    /// 從請求本文解析 JWS。
    pub fn from_json(body: &[u8]) -> Result<Self, JwsError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// 解碼保護頭為 JSON。
    pub fn protected_header(&self) -> Result<Value, JwsError> {
        Ok(serde_json::from_slice(&URL_SAFE_NO_PAD.decode(&self.header)?)?)
    }

    /// 解碼 payload；POST-as-GET 的空 payload 回傳 `None`。
    pub fn payload(&self) -> Result<Option<Value>, JwsError> {
        if self.payload.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(
            &URL_SAFE_NO_PAD.decode(&self.payload)?,
        )?))
    }

    /// 簽名輸入：`protected.payload`。
    pub fn signing_input(&self) -> String {
        format!("{}.{}", self.header, self.payload)
    }

    pub fn signature_bytes(&self) -> Result<Vec<u8>, JwsError> {
        Ok(URL_SAFE_NO_PAD.decode(&self.signature)?)
    }
}

/// 請求的 payload。
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// 一般 JSON payload，例如 `{}` 或新訂單內容。
    Json(Value),
    /// POST-as-GET 使用的空字串 payload。
    Empty,
}

impl Payload {
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Payload::Json(serde_json::to_value(value)?))
    }

    fn encode(&self) -> Result<String, SignatureError> {
        match self {
            Payload::Json(value) => Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(value)?)),
            Payload::Empty => Ok(String::new()),
        }
    }
}

/// JWS 簽名器，包裝帳戶金鑰。
///
/// `sign` 是純函式：相同輸入得到相同保護頭與 payload，不保存任何狀態。
/// 使用 `jwk` 或 `kid` 由 [`HeaderFields::binding`] 決定。
#[derive(Clone, Debug)]
pub struct Signer {
    key: Arc<dyn AccountKey>,
}

impl Signer {
    pub fn new(key: Arc<dyn AccountKey>) -> Self {
        Self { key }
    }

    pub fn key(&self) -> &dyn AccountKey {
        self.key.as_ref()
    }

    /// 帳戶金鑰的 JWK thumbprint。
    pub fn thumbprint(&self) -> Result<String, SignatureError> {
        self.key.thumbprint()
    }

    /// 建立並簽署一個 JWS。
    ///
    /// # 參數
    ///
    /// - `payload`: 請求內容；POST-as-GET 使用 [`Payload::Empty`]。
    /// - `fields`: `url`、`nonce` 與金鑰綁定方式。
    ///
    /// # 回傳
    ///
    /// 成功回傳 `Jws`；金鑰沒有私鑰或演算法不受支援時回傳 [`SignatureError`]。
    pub fn sign(&self, payload: &Payload, fields: &HeaderFields) -> Result<Jws, SignatureError> {
        let header = Protection::new(self.key.as_ref())
            .create_header(fields)?
            .to_base64url()?;
        let payload = payload.encode()?;

        let signing_input = format!("{}.{}", header, payload);
        let signature = self.key.sign(signing_input.as_bytes())?;

        Ok(Jws {
            header,
            payload,
            signature: URL_SAFE_NO_PAD.encode(signature),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        key_pair::{KeyAlgorithm, KeyPair},
        protection::KeyBinding,
    };
    use serde_json::json;

    fn signer_and_key() -> (Signer, Arc<KeyPair>) {
        let key = Arc::new(KeyPair::generate(KeyAlgorithm::EcP256).unwrap());
        (Signer::new(key.clone()), key)
    }

    fn fields(nonce: &str) -> HeaderFields {
        HeaderFields {
            url: "https://ca.test/acme/order/1".to_string(),
            nonce: nonce.to_string(),
            binding: KeyBinding::Kid("https://ca.test/acme/acct/1".to_string()),
        }
    }

    #[test]
    fn test_signature_verifies() {
        let (signer, key) = signer_and_key();
        let jws = signer.sign(&Payload::Json(json!({"a": 1})), &fields("n1")).unwrap();

        let signature = jws.signature_bytes().unwrap();
        assert!(key.verify(jws.signing_input().as_bytes(), &signature).unwrap());
        assert_eq!(jws.payload().unwrap(), Some(json!({"a": 1})));
    }

    #[test]
    fn test_post_as_get_has_empty_payload() {
        let (signer, _) = signer_and_key();
        let jws = signer.sign(&Payload::Empty, &fields("n1")).unwrap();

        assert_eq!(jws.payload().unwrap(), None);
        assert!(jws.to_json().unwrap().contains("\"payload\":\"\""));
    }

    #[test]
    fn test_protected_header_round_trip() {
        let (signer, _) = signer_and_key();
        let jws = signer.sign(&Payload::Empty, &fields("nonce-42")).unwrap();
        let parsed = Jws::from_json(jws.to_json().unwrap().as_bytes()).unwrap();

        let header = parsed.protected_header().unwrap();
        assert_eq!(header["nonce"], "nonce-42");
        assert_eq!(header["alg"], "ES256");
        assert_eq!(header["kid"], "https://ca.test/acme/acct/1");
        assert!(header.get("jwk").is_none());
    }

    #[test]
    fn test_signing_without_private_key_fails() {
        let (_, key) = signer_and_key();
        let public = KeyPair::from_public_pem(&key.public_key_to_pem().unwrap()).unwrap();
        let signer = Signer::new(Arc::new(public));

        assert!(matches!(
            signer.sign(&Payload::Empty, &fields("n")),
            Err(SignatureError::KeyUnavailable(_))
        ));
    }
}
