use std::collections::BTreeSet;

use openssl::{
    hash::MessageDigest,
    nid::Nid,
    stack::Stack,
    x509::{extension::SubjectAlternativeName, X509Builder, X509NameBuilder, X509Req, X509ReqRef},
};
use thiserror::Error;

use crate::{key_pair::KeyPair, payload::Identifier};

/// 用於描述建立 CSR（證書簽名請求）過程中可能發生的錯誤。
#[derive(Debug, Error)]
pub enum CsrError {
    #[error("Openssl error: {0}")]
    OpensslError(#[from] openssl::error::ErrorStack),
    #[error("No SAN entries")]
    NoSanEntries,
    #[error("Private key is required to sign the CSR")]
    MissingPrivateKey,
    #[error("CSR names {csr:?} do not match order identifiers {order:?}")]
    IdentifierMismatch { csr: Vec<String>, order: Vec<String> },
}

/// 為簡化錯誤處理定義 Result 類型
type Result<T> = std::result::Result<T, CsrError>;

/// CommonName 的長度上限（RFC 5280 ub-common-name）。
const MAX_COMMON_NAME_LEN: usize = 64;

/// 表示一個 CSR 建構器，主要用於生成包含主體替代名稱 (SAN) 擴展的證書簽名請求。
#[derive(Debug, Default, Clone)]
pub struct Csr {
    san_entries: Vec<String>,
}

impl Csr {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新增一個 DNS 主體替代名稱 (SAN) 到 CSR 中。重複的名稱會被忽略。
    pub fn add_san(mut self, dns_name: &str) -> Self {
        if !self.san_entries.iter().any(|e| e == dns_name) {
            self.san_entries.push(dns_name.to_string());
        }
        self
    }

    /// 以訂單的識別項建立。
    pub fn for_identifiers(identifiers: &[Identifier]) -> Self {
        identifiers
            .iter()
            .fold(Self::new(), |csr, identifier| csr.add_san(&identifier.value))
    }

    /// 根據當前設定的 SAN 項目以及指定的金鑰對構建一個 X509 證書簽名請求 (CSR)。
    ///
    /// 第一個名稱不超過 64 個字元時同時作為 CommonName，否則主體留空，只依賴 SAN。
    ///
    /// # 參數
    ///
    /// * `key_pair` - 用於簽署 CSR 的金鑰對，必須包含私鑰。
    ///
    /// # 錯誤
    ///
    /// 若在過程中遇到 OpenSSL 的錯誤或未設定 SAN 項目，將回傳相對應的 `CsrError`。
    pub fn build(self, key_pair: &KeyPair) -> Result<X509Req> {
        if self.san_entries.is_empty() {
            return Err(CsrError::NoSanEntries);
        }
        let pri_key = key_pair.pri_key.as_ref().ok_or(CsrError::MissingPrivateKey)?;

        let mut req_builder = X509Req::builder()?;

        if let Some(first) = self.san_entries.first().filter(|n| n.len() <= MAX_COMMON_NAME_LEN) {
            let mut name = X509NameBuilder::new()?;
            name.append_entry_by_text("CN", first)?;
            req_builder.set_subject_name(&name.build())?;
        }

        let mut san_builder = SubjectAlternativeName::new();
        for entry in &self.san_entries {
            san_builder.dns(entry);
        }
        let san_extension = san_builder.build(&req_builder.x509v3_context(None))?;

        let mut stack = Stack::new()?;
        stack.push(san_extension)?;
        req_builder.add_extensions(&stack)?;

        req_builder.set_pubkey(pri_key)?;
        req_builder.sign(pri_key, MessageDigest::sha256())?;

        Ok(req_builder.build())
    }

    /// 建立並輸出 DER 編碼的 CSR。
    pub fn to_der(self, key_pair: &KeyPair) -> Result<Vec<u8>> {
        Ok(self.build(key_pair)?.to_der()?)
    }
}

/// 提供最終化訂單所需的 DER 格式 CSR。
pub trait CsrProvider: Send + Sync {
    fn csr_der(&self, identifiers: &[Identifier]) -> Result<Vec<u8>>;
}

/// 以憑證金鑰對簽出涵蓋所有識別項的 CSR。
impl CsrProvider for KeyPair {
    fn csr_der(&self, identifiers: &[Identifier]) -> Result<Vec<u8>> {
        Csr::for_identifiers(identifiers).to_der(self)
    }
}

/// 呼叫端預先產生好的 CSR。
///
/// 建立時就會解析出 CSR 涵蓋的主機名稱（CommonName 與 SAN 中的 DNS 名稱），
/// 因此可以只憑 CSR 建立訂單，最終化時也會確認訂單沒有多出或少掉任何名稱。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerCsr {
    der: Vec<u8>,
    names: Vec<String>,
}

impl DerCsr {
    /// 解析 DER 格式的 CSR。
    ///
    /// # 錯誤
    ///
    /// 內容不是合法的 CSR 時回傳 [`CsrError::OpensslError`]；
    /// 沒有任何主機名稱時回傳 [`CsrError::NoSanEntries`]。
    pub fn from_der(der: Vec<u8>) -> Result<Self> {
        let req = X509Req::from_der(&der)?;
        let names = names_in(&req)?;
        if names.is_empty() {
            return Err(CsrError::NoSanEntries);
        }
        Ok(Self { der, names })
    }

    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        Self::from_der(X509Req::from_pem(pem)?.to_der()?)
    }

    /// CSR 涵蓋的 `dns` 識別項，已排序且不重複。
    pub fn identifiers(&self) -> Vec<Identifier> {
        self.names.iter().map(Identifier::dns).collect()
    }

    pub fn as_der(&self) -> &[u8] {
        &self.der
    }
}

impl CsrProvider for DerCsr {
    fn csr_der(&self, identifiers: &[Identifier]) -> Result<Vec<u8>> {
        let order = identifiers
            .iter()
            .map(|i| i.value.to_ascii_lowercase())
            .collect::<BTreeSet<_>>();
        if !order.iter().eq(self.names.iter()) {
            return Err(CsrError::IdentifierMismatch {
                csr: self.names.clone(),
                order: order.into_iter().collect(),
            });
        }
        Ok(self.der.clone())
    }
}

/// 取出 CommonName 與 SAN 中的 DNS 名稱，轉成小寫後排序去重。
fn names_in(req: &X509ReqRef) -> Result<Vec<String>> {
    let mut names = BTreeSet::new();

    for entry in req.subject_name().entries_by_nid(Nid::COMMONNAME) {
        names.insert(entry.data().as_utf8()?.to_ascii_lowercase());
    }

    // 沒有擴展時部分 OpenSSL 版本回傳 NULL。
    if let Ok(extensions) = req.extensions() {
        // openssl 只能從證書讀出 SAN，借一張未簽名的證書來解碼。
        let mut builder = X509Builder::new()?;
        for extension in &extensions {
            builder.append_extension2(extension)?;
        }
        let carrier = builder.build();
        for name in carrier.subject_alt_names().into_iter().flatten() {
            if let Some(dns) = name.dnsname() {
                names.insert(dns.to_ascii_lowercase());
            }
        }
    }

    Ok(names.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_pair::KeyAlgorithm;

    #[test]
    fn test_csr_contains_all_names() {
        let key = KeyPair::generate(KeyAlgorithm::EcP256).unwrap();
        let identifiers = [Identifier::dns("example.com"), Identifier::dns("www.example.com")];
        let der = key.csr_der(&identifiers).unwrap();

        let req = X509Req::from_der(&der).unwrap();
        assert!(req.verify(&req.public_key().unwrap()).unwrap());

        let cn = req
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .unwrap()
            .data()
            .as_utf8()
            .unwrap()
            .to_string();
        assert_eq!(cn, "example.com");

        let extensions = req.extensions().unwrap();
        assert_eq!(extensions.len(), 1);
    }

    #[test]
    fn test_long_first_name_has_no_common_name() {
        let key = KeyPair::generate(KeyAlgorithm::EcP256).unwrap();
        let long = format!("{}.example.com", "a".repeat(60));
        let req = Csr::new().add_san(&long).build(&key).unwrap();
        assert_eq!(req.subject_name().entries().count(), 0);
    }

    #[test]
    fn test_empty_csr_rejected() {
        let key = KeyPair::generate(KeyAlgorithm::EcP256).unwrap();
        assert!(matches!(Csr::new().build(&key), Err(CsrError::NoSanEntries)));
    }

    #[test]
    fn test_public_only_key_rejected() {
        let key = KeyPair::generate(KeyAlgorithm::EcP256).unwrap();
        let public = KeyPair::from_public_pem(&key.public_key_to_pem().unwrap()).unwrap();
        assert!(matches!(
            public.csr_der(&[Identifier::dns("example.com")]),
            Err(CsrError::MissingPrivateKey)
        ));
    }

    #[test]
    fn test_der_csr_reads_names() {
        let key = KeyPair::generate(KeyAlgorithm::EcP256).unwrap();
        let der = Csr::new()
            .add_san("www.example.com")
            .add_san("Example.com")
            .add_san("api.example.com")
            .to_der(&key)
            .unwrap();

        let csr = DerCsr::from_der(der.clone()).unwrap();

        assert_eq!(
            csr.identifiers(),
            vec![
                Identifier::dns("api.example.com"),
                Identifier::dns("example.com"),
                Identifier::dns("www.example.com"),
            ]
        );
        assert_eq!(csr.as_der(), der.as_slice());
        assert_eq!(csr.csr_der(&csr.identifiers()).unwrap(), der);
    }

    #[test]
    fn test_der_csr_from_pem() {
        let key = KeyPair::generate(KeyAlgorithm::Rsa { bits: 2048 }).unwrap();
        let pem = Csr::new().add_san("example.com").build(&key).unwrap().to_pem().unwrap();

        let csr = DerCsr::from_pem(&pem).unwrap();
        assert_eq!(csr.identifiers(), vec![Identifier::dns("example.com")]);
    }

    #[test]
    fn test_der_csr_rejects_other_names() {
        let key = KeyPair::generate(KeyAlgorithm::EcP256).unwrap();
        let der = Csr::new()
            .add_san("example.com")
            .add_san("www.example.com")
            .to_der(&key)
            .unwrap();
        let csr = DerCsr::from_der(der).unwrap();

        let missing = csr.csr_der(&[Identifier::dns("example.com")]);
        assert!(matches!(
            missing,
            Err(CsrError::IdentifierMismatch { ref csr, ref order })
                if csr == &["example.com", "www.example.com"] && order == &["example.com"]
        ));

        let extra = csr.csr_der(&[
            Identifier::dns("example.com"),
            Identifier::dns("www.example.com"),
            Identifier::dns("mail.example.com"),
        ]);
        assert!(matches!(extra, Err(CsrError::IdentifierMismatch { .. })));

        let reordered = csr.csr_der(&[Identifier::dns("WWW.example.com"), Identifier::dns("example.com")]);
        assert!(reordered.is_ok());
    }

    #[test]
    fn test_der_csr_rejects_garbage() {
        assert!(matches!(
            DerCsr::from_der(b"csr".to_vec()),
            Err(CsrError::OpensslError(_))
        ));
    }
}
