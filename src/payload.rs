use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::jws::Payload;

/// 載荷驗證失敗的原因。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Invalid contact: {0}")]
    InvalidContact(String),
    #[error("At least one identifier is required")]
    NoIdentifiers,
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("CSR must not be empty")]
    EmptyCsr,
}

/// 定義所有 API 載荷（Payload）必須實作的功能。
pub trait PayloadT: Serialize {
    /// 驗證載荷內容，送出前呼叫。
    fn validate(&self) -> Result<(), PayloadError>;

    /// 驗證後轉換成可簽名的 [`Payload`]。
    fn to_payload(&self) -> crate::error::Result<Payload>
    where
        Self: Sized,
    {
        self.validate()?;
        Ok(Payload::json(self)?)
    }
}

/// 建立（或查詢）帳號所需的載荷資料。
#[derive(Debug, Serialize, Deserialize)]
pub struct NewAccountPayload {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    contact: Vec<String>,
    #[serde(rename = "termsOfServiceAgreed")]
    terms_of_service_agreed: bool,
    #[serde(rename = "onlyReturnExisting")]
    only_return_existing: bool,
}

impl NewAccountPayload {
    /// 建立一個新的 `NewAccountPayload` 實例。
    ///
    /// 沒有 URI scheme 的聯絡方式視為電子郵件，自動補上 `mailto:` 前綴。
    ///
    /// # 參數
    ///
    /// - `contacts`: 聯絡方式清單，例如 `admin@example.com` 或 `mailto:admin@example.com`。
    /// - `only_return_existing`: 為 `true` 時 CA 只回傳既有帳號，不會建立新帳號。
    pub fn new<S: AsRef<str>>(contacts: &[S], only_return_existing: bool) -> Self {
        let contact = contacts
            .iter()
            .map(|c| normalize_contact(c.as_ref()))
            .collect();

        NewAccountPayload {
            contact,
            terms_of_service_agreed: true,
            only_return_existing,
        }
    }

    pub fn contacts(&self) -> &[String] {
        &self.contact
    }
}

fn normalize_contact(contact: &str) -> String {
    let contact = contact.trim();
    if contact.starts_with("mailto:") || contact.starts_with("tel:") {
        contact.to_string()
    } else {
        format!("mailto:{}", contact)
    }
}

impl PayloadT for NewAccountPayload {
    /// 每個聯絡方式都必須有值且不含空白；使用者必須同意服務條款。
    fn validate(&self) -> Result<(), PayloadError> {
        for contact in &self.contact {
            let (_, value) = contact.split_once(':').unwrap_or(("", contact));
            if value.is_empty() || value.chars().any(char::is_whitespace) {
                return Err(PayloadError::InvalidContact(contact.clone()));
            }
        }
        if !self.terms_of_service_agreed {
            return Err(PayloadError::InvalidContact(
                "terms of service must be agreed".into(),
            ));
        }
        Ok(())
    }
}

/// 表示一個識別項，用來描述證書所涵蓋的主機名稱。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub type_: String,
    pub value: String,
}

impl Identifier {
    /// 建立 `dns` 類型的識別項。
    pub fn dns(domain: impl Into<String>) -> Self {
        Identifier {
            type_: "dns".to_string(),
            value: domain.into(),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_, self.value)
    }
}

/// 建立新訂單時所需的載荷資料。
#[derive(Debug, Serialize, Deserialize)]
pub struct NewOrderPayload {
    pub identifiers: Vec<Identifier>,
}

impl NewOrderPayload {
    pub fn new(identifiers: &[Identifier]) -> Self {
        NewOrderPayload {
            identifiers: identifiers.to_vec(),
        }
    }
}

impl PayloadT for NewOrderPayload {
    /// 至少一個識別項；類型必須為 `dns`，值不得為空或含空白。
    fn validate(&self) -> Result<(), PayloadError> {
        if self.identifiers.is_empty() {
            return Err(PayloadError::NoIdentifiers);
        }
        for identifier in &self.identifiers {
            if identifier.type_ != "dns"
                || identifier.value.is_empty()
                || identifier.value.chars().any(char::is_whitespace)
            {
                return Err(PayloadError::InvalidIdentifier(identifier.to_string()));
            }
        }
        Ok(())
    }
}

/// 通知 CA「挑戰已就緒」的載荷，固定為 `{}`。
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ChallengeReadyPayload {}

impl ChallengeReadyPayload {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PayloadT for ChallengeReadyPayload {
    fn validate(&self) -> Result<(), PayloadError> {
        Ok(())
    }
}

/// 最終化訂單時所需的載荷：DER 格式 CSR 的 URL 安全 Base64 編碼。
#[derive(Debug, Serialize, Deserialize)]
pub struct FinalizeOrderPayload {
    #[serde(rename = "csr")]
    csr_b64_str: String,
}

impl FinalizeOrderPayload {
    pub fn new(csr_der: &[u8]) -> Self {
        FinalizeOrderPayload {
            csr_b64_str: URL_SAFE_NO_PAD.encode(csr_der),
        }
    }
}

impl PayloadT for FinalizeOrderPayload {
    fn validate(&self) -> Result<(), PayloadError> {
        if self.csr_b64_str.is_empty() {
            return Err(PayloadError::EmptyCsr);
        }
        Ok(())
    }
}
