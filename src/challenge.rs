use std::{fmt, str::FromStr};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use openssl::{
    error::ErrorStack,
    hash::{hash, MessageDigest},
};
use serde::{Deserialize, Serialize};

use crate::error::Problem;

/// HTTP-01 驗證檔案所在的路徑前綴。
pub const HTTP01_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

/// 表示 ACME 挑戰的類型，可用於選擇相應的驗證策略。
///
/// CA 可能提供本程式不認得的類型，這些保留在 [`ChallengeType::Unknown`] 中，
/// 永遠不會被選為設定的挑戰類型。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChallengeType {
    Http01,
    Dns01,
    TlsAlpn01,
    Unknown(String),
}

impl ChallengeType {
    /// 返回挑戰類型對應的字串表示。
    pub fn as_str(&self) -> &str {
        match self {
            Self::Http01 => "http-01",
            Self::Dns01 => "dns-01",
            Self::TlsAlpn01 => "tls-alpn-01",
            Self::Unknown(other) => other,
        }
    }
}

impl From<String> for ChallengeType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "http-01" => Self::Http01,
            "dns-01" => Self::Dns01,
            "tls-alpn-01" => Self::TlsAlpn01,
            _ => Self::Unknown(s),
        }
    }
}

impl From<ChallengeType> for String {
    fn from(t: ChallengeType) -> Self {
        t.as_str().to_string()
    }
}

impl FromStr for ChallengeType {
    type Err = String;

    /// 只接受已知的類型，設定檔中的未知類型視為錯誤。
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match ChallengeType::from(s.to_lowercase()) {
            Self::Unknown(other) => Err(other),
            known => Ok(known),
        }
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 表示 ACME 挑戰的狀態，用來追蹤挑戰進展。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

impl ChallengeStatus {
    /// CA 已經開始或完成驗證，不需要再通知。
    pub fn is_submitted(&self) -> bool {
        matches!(self, Self::Processing | Self::Valid)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
        }
    }
}

/// 表示一個 ACME 驗證挑戰，包含驗證所需的各項資料。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    /// 驗證挑戰的類型
    #[serde(rename = "type")]
    pub challenge_type: ChallengeType,
    /// 通知 CA「可以驗證」的 URL
    pub url: String,
    /// 挑戰 token，用於生成 key authorization
    #[serde(default)]
    pub token: String,
    pub status: ChallengeStatus,
    /// 驗證失敗時 CA 提供的問題文件
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validated: Option<String>,
}

impl Challenge {
    /// 以帳戶 thumbprint 計算此挑戰的 key authorization。
    pub fn key_authorization(&self, thumbprint: &str) -> KeyAuthorization {
        KeyAuthorization::new(&self.token, thumbprint)
    }

    /// HTTP-01 驗證檔案的 URL 路徑。
    pub fn http_path(&self) -> String {
        format!("{}{}", HTTP01_PATH_PREFIX, self.token)
    }
}

/// `token + "." + thumbprint`，挑戰回應者必須公開的字串。
///
/// 只由 token 與 thumbprint 推導，不另外保存。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyAuthorization(String);

impl KeyAuthorization {
    pub fn new(token: &str, thumbprint: &str) -> Self {
        KeyAuthorization(format!("{}.{}", token, thumbprint))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 根據 key authorization 計算 DNS TXT 記錄值，使用 SHA-256 與 URL-safe Base64 編碼。
    pub fn dns_txt_value(&self) -> Result<String, ErrorStack> {
        Ok(URL_SAFE_NO_PAD.encode(self.digest()?))
    }

    /// TLS-ALPN-01 憑證 `acmeIdentifier` 擴充欄位所需的 SHA-256 摘要。
    pub fn tls_alpn_digest(&self) -> Result<Vec<u8>, ErrorStack> {
        self.digest()
    }

    fn digest(&self) -> Result<Vec<u8>, ErrorStack> {
        Ok(hash(MessageDigest::sha256(), self.0.as_bytes())?.to_vec())
    }
}

impl fmt::Display for KeyAuthorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// DNS-01 TXT 記錄的主機名稱，萬用字元網域去掉 `*.` 前綴。
pub fn dns_record_name(domain: &str) -> String {
    format!("_acme-challenge.{}", domain.trim_start_matches("*."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_authorization_format() {
        let ka = KeyAuthorization::new("token-abc", "thumb-123");
        assert_eq!(ka.as_str(), "token-abc.thumb-123");
        assert_eq!(ka, KeyAuthorization::new("token-abc", "thumb-123"));
    }

    #[test]
    fn test_dns_txt_value() {
        let ka = KeyAuthorization::new(
            "evaGxfADs6pSRb2LAv9IZf17Dt3juxGJ-PCt92wr-oA",
            "nP1qzpXGymHBrUEepNY9HCsQk7K8KhOypzEt62jcerQ",
        );
        assert_eq!(ka.dns_txt_value().unwrap().len(), 43);
        assert_eq!(ka.tls_alpn_digest().unwrap().len(), 32);
        assert_eq!(dns_record_name("*.example.org"), "_acme-challenge.example.org");
    }

    #[test]
    fn test_challenge_parsing() {
        let challenge: Challenge = serde_json::from_value(json!({
            "type": "http-01",
            "url": "https://ca.test/acme/chall/1",
            "token": "tok",
            "status": "invalid",
            "error": {
                "type": "urn:ietf:params:acme:error:unauthorized",
                "detail": "Invalid response from http://example.com/.well-known/acme-challenge/tok"
            }
        }))
        .unwrap();

        assert_eq!(challenge.challenge_type, ChallengeType::Http01);
        assert_eq!(challenge.status, ChallengeStatus::Invalid);
        assert_eq!(challenge.http_path(), "/.well-known/acme-challenge/tok");
        assert!(challenge.error.unwrap().detail.starts_with("Invalid response"));
    }

    #[test]
    fn test_unknown_type_preserved() {
        let challenge: Challenge = serde_json::from_value(json!({
            "type": "onion-csr-01",
            "url": "https://ca.test/acme/chall/2",
            "status": "pending"
        }))
        .unwrap();

        assert_eq!(challenge.challenge_type, ChallengeType::Unknown("onion-csr-01".into()));
        assert_eq!(challenge.challenge_type.to_string(), "onion-csr-01");
        assert!("onion-csr-01".parse::<ChallengeType>().is_err());
        assert_eq!("HTTP-01".parse::<ChallengeType>(), Ok(ChallengeType::Http01));
    }
}
