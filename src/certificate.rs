use chrono::{DateTime, Utc};
use openssl::{asn1::Asn1Time, x509::X509};
use thiserror::Error;

/// 證書相關操作可能出現的錯誤類型
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("Failed to parse certificate: {0}")]
    ParseError(#[from] openssl::error::ErrorStack),
    #[error("Certificate chain is empty")]
    EmptyChain,
    #[error("Invalid expiration timestamp")]
    InvalidTimestamp,
}

/// 自定義結果型別，錯誤類型為 `CertificateError`
type Result<T> = std::result::Result<T, CertificateError>;

/// CA 下載回來的 PEM 證書鏈，第一張是終端證書。
///
/// 內容原樣保存，不重新編碼。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateChain {
    pem: String,
}

impl CertificateChain {
    /// 建立一個 `CertificateChain` 實例，並確認至少能解析出一張證書。
    ///
    /// # 參數
    ///
    /// - `pem`: 包含一或多張證書的 PEM 字串
    pub fn new(pem: impl Into<String>) -> Result<Self> {
        let chain = CertificateChain { pem: pem.into() };
        chain.leaf()?;
        Ok(chain)
    }

    pub fn as_pem(&self) -> &str {
        &self.pem
    }

    pub fn into_pem(self) -> String {
        self.pem
    }

    /// 解析鏈上所有證書。
    pub fn certificates(&self) -> Result<Vec<X509>> {
        Ok(X509::stack_from_pem(self.pem.as_bytes())?)
    }

    /// 終端證書。
    pub fn leaf(&self) -> Result<X509> {
        self.certificates()?
            .into_iter()
            .next()
            .ok_or(CertificateError::EmptyChain)
    }

    /// 終端證書的到期時間。
    pub fn not_after(&self) -> Result<DateTime<Utc>> {
        let leaf = self.leaf()?;
        let epoch = Asn1Time::from_unix(0)?;
        let diff = epoch.diff(leaf.not_after())?;
        let seconds = diff.days as i64 * 86400 + diff.secs as i64;
        DateTime::from_timestamp(seconds, 0).ok_or(CertificateError::InvalidTimestamp)
    }

    /// 距離到期還有幾天，已過期時為負數。
    pub fn days_remaining(&self, now: DateTime<Utc>) -> Result<i64> {
        Ok((self.not_after()? - now).num_days())
    }

    /// 判斷證書是否應該進行續約
    ///
    /// # 參數
    ///
    /// - `threshold_days`: 續約閾值（以天為單位），剩餘有效天數低於此值即需續約
    ///
    /// # 回傳
    ///
    /// 已過期或剩餘時間少於閾值時回傳 `true`。
    pub fn should_renew(&self, threshold_days: u32) -> Result<bool> {
        let remaining = self.not_after()? - Utc::now();
        Ok(remaining.num_seconds() < threshold_days as i64 * 86400)
    }
}
