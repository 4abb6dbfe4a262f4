use std::fmt;

use openssl::{
    bn::BigNum,
    ecdsa::EcdsaSig,
    error::ErrorStack,
    hash::{hash, MessageDigest},
    pkey::{HasPublic, PKeyRef, Private},
    sign::{Signer, Verifier},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::jwk::{Jwk, JwkError};

/// 定義簽名操作可能遇到的錯誤類型。
#[derive(Debug, Error)]
pub enum SignatureError {
    /// 金鑰沒有私鑰部分，無法簽名。
    #[error("Signing key unavailable: {0}")]
    KeyUnavailable(String),
    /// 不支援的簽名演算法。
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    /// OpenSSL 在簽名過程中回報錯誤。
    #[error("Signing error: {0}")]
    SigningError(#[from] ErrorStack),
    /// 產生 JWK 失敗。
    #[error("JWK error: {0}")]
    Jwk(#[from] JwkError),
    /// 序列化保護頭或 payload 失敗。
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// JWS `alg` 欄位可用的演算法。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JwsAlgorithm {
    RS256,
    ES256,
    ES384,
}

impl JwsAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RS256 => "RS256",
            Self::ES256 => "ES256",
            Self::ES384 => "ES384",
        }
    }
}

impl fmt::Display for JwsAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 帳戶金鑰的抽象介面。
///
/// 核心流程只透過此介面取得公開 JWK 與簽名結果，從不接觸私鑰本身。
/// 實作者必須可以跨執行緒共用，因為授權可以並行處理。
pub trait AccountKey: Send + Sync + fmt::Debug {
    /// 此金鑰對應的 JWS 演算法。
    fn algorithm(&self) -> Result<JwsAlgorithm, SignatureError>;

    /// 公開金鑰的 JWK 表示。
    fn jwk(&self) -> Result<Jwk, SignatureError>;

    /// 對 JWS signing input 簽名，回傳 JWS 規定格式的簽名位元組。
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SignatureError>;

    /// JWK thumbprint，用於組成 key authorization。
    fn thumbprint(&self) -> Result<String, SignatureError> {
        Ok(self.jwk()?.thumbprint()?)
    }
}

/// 定義簽名演算法的介面。
trait SignatureAlgorithmT {
    fn sign(&self, data: &[u8], key: &PKeyRef<Private>) -> Result<Vec<u8>, SignatureError>;

    fn verify(
        &self,
        data: &[u8],
        signature: &[u8],
        key: &PKeyRef<openssl::pkey::Public>,
    ) -> Result<bool, SignatureError>;
}

/// RSASSA-PKCS1-v1_5 搭配 SHA-256。
struct RsaSha256;

impl SignatureAlgorithmT for RsaSha256 {
    fn sign(&self, data: &[u8], key: &PKeyRef<Private>) -> Result<Vec<u8>, SignatureError> {
        let mut signer = Signer::new(MessageDigest::sha256(), key)?;
        signer.update(data)?;
        Ok(signer.sign_to_vec()?)
    }

    fn verify(
        &self,
        data: &[u8],
        signature: &[u8],
        key: &PKeyRef<openssl::pkey::Public>,
    ) -> Result<bool, SignatureError> {
        let mut verifier = Verifier::new(MessageDigest::sha256(), key)?;
        verifier.update(data)?;
        Ok(verifier.verify(signature)?)
    }
}

/// ECDSA 簽名；JWS 要求輸出為固定長度的 `r || s`，而不是 DER。
struct Ecdsa {
    digest: MessageDigest,
    width: i32,
}

impl SignatureAlgorithmT for Ecdsa {
    fn sign(&self, data: &[u8], key: &PKeyRef<Private>) -> Result<Vec<u8>, SignatureError> {
        let digest = hash(self.digest, data)?;
        let ec = key.ec_key()?;
        let sig = EcdsaSig::sign(&digest, &ec)?;

        let mut out = sig.r().to_vec_padded(self.width)?;
        out.extend_from_slice(&sig.s().to_vec_padded(self.width)?);
        Ok(out)
    }

    fn verify(
        &self,
        data: &[u8],
        signature: &[u8],
        key: &PKeyRef<openssl::pkey::Public>,
    ) -> Result<bool, SignatureError> {
        let width = self.width as usize;
        if signature.len() != width * 2 {
            return Ok(false);
        }
        let r = BigNum::from_slice(&signature[..width])?;
        let s = BigNum::from_slice(&signature[width..])?;
        let sig = EcdsaSig::from_private_components(r, s)?;
        let digest = hash(self.digest, data)?;
        let ec = key.ec_key()?;
        Ok(sig.verify(&digest, &ec)?)
    }
}

/// 根據演算法取得對應的簽名實作。
fn algorithm_for(alg: JwsAlgorithm) -> Box<dyn SignatureAlgorithmT> {
    match alg {
        JwsAlgorithm::RS256 => Box::new(RsaSha256),
        JwsAlgorithm::ES256 => Box::new(Ecdsa {
            digest: MessageDigest::sha256(),
            width: 32,
        }),
        JwsAlgorithm::ES384 => Box::new(Ecdsa {
            digest: MessageDigest::sha384(),
            width: 48,
        }),
    }
}

/// 使用指定演算法與私鑰產生 JWS 簽名。
pub(crate) fn sign_with(
    alg: JwsAlgorithm,
    data: &[u8],
    key: &PKeyRef<Private>,
) -> Result<Vec<u8>, SignatureError> {
    algorithm_for(alg).sign(data, key)
}

/// 驗證 JWS 簽名。
pub(crate) fn verify_with<T: HasPublic>(
    alg: JwsAlgorithm,
    data: &[u8],
    signature: &[u8],
    key: &PKeyRef<T>,
) -> Result<bool, SignatureError> {
    let public = openssl::pkey::PKey::public_key_from_der(&key.public_key_to_der()?)?;
    algorithm_for(alg).verify(data, signature, &public)
}
