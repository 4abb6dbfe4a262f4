use std::{fmt, str::FromStr};

use openssl::{
    ec::{EcGroup, EcKey},
    error::ErrorStack,
    nid::Nid,
    pkey::{Id, PKey, Private, Public},
    rsa::Rsa,
};
use thiserror::Error;

use crate::{
    jwk::{Jwk, JwkError},
    signature::{sign_with, verify_with, AccountKey, JwsAlgorithm, SignatureError},
};

/// 鍵相關操作的錯誤列舉。
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("OpenSSL error: {0}")]
    OpenSSL(#[from] ErrorStack),
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("Private key is not available")]
    MissingPrivateKey,
    #[error("JWK error: {0}")]
    JwkError(#[from] JwkError),
}

type Result<T> = std::result::Result<T, KeyError>;

/// 可產生的金鑰種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa { bits: u32 },
    EcP256,
    EcP384,
}

impl Default for KeyAlgorithm {
    fn default() -> Self {
        KeyAlgorithm::Rsa { bits: 2048 }
    }
}

impl FromStr for KeyAlgorithm {
    type Err = KeyError;

    /// 接受 `rsa`、`rsa2048`、`rsa3072`、`rsa4096`、`p-256`、`p-384` 等寫法（不區分大小寫）。
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "rsa" | "rsa2048" => Ok(Self::Rsa { bits: 2048 }),
            "rsa3072" => Ok(Self::Rsa { bits: 3072 }),
            "rsa4096" => Ok(Self::Rsa { bits: 4096 }),
            "ec" | "ecdsa" | "p-256" | "p256" | "es256" => Ok(Self::EcP256),
            "p-384" | "p384" | "es384" => Ok(Self::EcP384),
            other => Err(KeyError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// 表示一組非對稱金鑰。
///
/// 私鑰可以不存在：只載入公鑰時此結構仍可產生 JWK、thumbprint 並驗證簽名，
/// 但簽名會回傳 [`SignatureError::KeyUnavailable`]。
pub struct KeyPair {
    /// 私鑰，使用 OpenSSL 的 `PKey` 封裝。
    pub pri_key: Option<PKey<Private>>,
    /// 公鑰，從私鑰派生或直接載入。
    pub pub_key: PKey<Public>,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("algorithm", &self.jws_algorithm().ok())
            .field("has_private_key", &self.pri_key.is_some())
            .finish()
    }
}

impl KeyPair {
    /// 根據指定演算法產生新的金鑰對。
    ///
    /// # 參數
    ///
    /// - `algorithm`: 金鑰種類，RSA 需指定位元長度（至少 2048）。
    ///
    /// # 回傳
    ///
    /// 成功回傳建立好的 `KeyPair`，否則回傳對應的 `KeyError`。
    pub fn generate(algorithm: KeyAlgorithm) -> Result<Self> {
        let pri_key = match algorithm {
            KeyAlgorithm::Rsa { bits } if bits < 2048 => {
                return Err(KeyError::UnsupportedAlgorithm(format!("RSA-{}", bits)))
            }
            KeyAlgorithm::Rsa { bits } => PKey::from_rsa(Rsa::generate(bits)?)?,
            KeyAlgorithm::EcP256 => Self::generate_ec(Nid::X9_62_PRIME256V1)?,
            KeyAlgorithm::EcP384 => Self::generate_ec(Nid::SECP384R1)?,
        };
        Self::from_private(pri_key)
    }

    fn generate_ec(curve: Nid) -> Result<PKey<Private>> {
        let group = EcGroup::from_curve_name(curve)?;
        Ok(PKey::from_ec_key(EcKey::generate(&group)?)?)
    }

    fn from_private(pri_key: PKey<Private>) -> Result<Self> {
        let pub_key = Self::derive_public_key(&pri_key)?;
        let key_pair = Self {
            pri_key: Some(pri_key),
            pub_key,
        };
        key_pair
            .jws_algorithm()
            .map_err(|e| KeyError::UnsupportedAlgorithm(e.to_string()))?;
        Ok(key_pair)
    }

    /// 根據私鑰派生出對應的公鑰。
    fn derive_public_key(pri_key: &PKey<Private>) -> Result<PKey<Public>> {
        Ok(PKey::public_key_from_der(&pri_key.public_key_to_der()?)?)
    }

    /// 根據 PEM 格式的私鑰資料建立金鑰對（PKCS#1、SEC1 與 PKCS#8 皆可）。
    pub fn from_pem(pri_key_pem: &[u8]) -> Result<Self> {
        Self::from_private(PKey::private_key_from_pem(pri_key_pem)?)
    }

    /// 只載入公鑰，產生僅能驗證的金鑰。
    pub fn from_public_pem(pub_key_pem: &[u8]) -> Result<Self> {
        let key_pair = Self {
            pri_key: None,
            pub_key: PKey::public_key_from_pem(pub_key_pem)?,
        };
        key_pair
            .jws_algorithm()
            .map_err(|e| KeyError::UnsupportedAlgorithm(e.to_string()))?;
        Ok(key_pair)
    }

    /// 以 PKCS#8 PEM 匯出私鑰。
    pub fn private_key_to_pem(&self) -> Result<Vec<u8>> {
        let pri_key = self.pri_key.as_ref().ok_or(KeyError::MissingPrivateKey)?;
        Ok(pri_key.private_key_to_pem_pkcs8()?)
    }

    pub fn public_key_to_pem(&self) -> Result<Vec<u8>> {
        Ok(self.pub_key.public_key_to_pem()?)
    }

    pub fn has_private_key(&self) -> bool {
        self.pri_key.is_some()
    }

    /// 依金鑰類型與曲線推導 JWS 演算法。
    pub fn jws_algorithm(&self) -> std::result::Result<JwsAlgorithm, SignatureError> {
        match self.pub_key.id() {
            Id::RSA => Ok(JwsAlgorithm::RS256),
            Id::EC => {
                let curve = self.pub_key.ec_key()?.group().curve_name();
                if curve == Some(Nid::X9_62_PRIME256V1) {
                    Ok(JwsAlgorithm::ES256)
                } else if curve == Some(Nid::SECP384R1) {
                    Ok(JwsAlgorithm::ES384)
                } else {
                    Err(SignatureError::UnsupportedAlgorithm(format!(
                        "EC curve {:?}",
                        curve.and_then(|nid| nid.short_name().ok())
                    )))
                }
            }
            other => Err(SignatureError::UnsupportedAlgorithm(format!("{:?}", other))),
        }
    }

    /// 計算金鑰的 thumbprint（RFC 7638）。
    pub fn thumbprint(&self) -> Result<String> {
        Ok(Jwk::from_key(&self.pub_key)?.thumbprint()?)
    }

    /// 驗證以此金鑰產生的 JWS 簽名。
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> std::result::Result<bool, SignatureError> {
        verify_with(self.jws_algorithm()?, data, signature, &self.pub_key)
    }

    /// 取得金鑰的位元長度，例如 RSA 2048 或 EC 256。
    pub fn key_bits(&self) -> u32 {
        self.pub_key.bits()
    }
}

impl AccountKey for KeyPair {
    fn algorithm(&self) -> std::result::Result<JwsAlgorithm, SignatureError> {
        self.jws_algorithm()
    }

    fn jwk(&self) -> std::result::Result<Jwk, SignatureError> {
        Ok(Jwk::from_key(&self.pub_key)?)
    }

    fn sign(&self, data: &[u8]) -> std::result::Result<Vec<u8>, SignatureError> {
        let pri_key = self
            .pri_key
            .as_ref()
            .ok_or_else(|| SignatureError::KeyUnavailable("key pair has no private key".into()))?;
        sign_with(self.jws_algorithm()?, data, pri_key)
    }
}
