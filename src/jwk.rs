use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use openssl::{
    bn::BigNumContext,
    error::ErrorStack,
    nid::Nid,
    pkey::{HasPublic, Id, PKeyRef},
    sha::sha256,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// JWK 相關操作的錯誤類型。
#[derive(Debug, Error)]
pub enum JwkError {
    /// 不支援的金鑰類型或曲線。
    #[error("Unsupported key: {0}")]
    UnsupportedKey(String),
    /// 金鑰轉換失敗。
    #[error("Failed to convert key: {0}")]
    KeyConversionError(#[from] ErrorStack),
    /// 序列化錯誤。
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// JSON Web Key (JWK) 的封裝，支援 RSA 與 EC（P-256、P-384）兩種格式。
///
/// 此結構只包含公開參數，可以直接放進 JWS 保護頭的 `jwk` 欄位。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kty")]
pub enum Jwk {
    /// RSA 格式的 JWK。
    #[serde(rename = "RSA")]
    Rsa(RsaJwk),
    /// EC 格式的 JWK。
    #[serde(rename = "EC")]
    Ec(EcJwk),
}

/// RSA 格式的 JWK，`n` 與 `e` 皆為 URL 安全 Base64 編碼。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsaJwk {
    pub n: String,
    pub e: String,
}

/// EC 格式的 JWK，座標為固定長度的大端序位元組。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcJwk {
    pub crv: String,
    pub x: String,
    pub y: String,
}

impl Jwk {
    /// 根據公鑰（或私鑰）建立對應的 JWK。
    ///
    /// # 參數
    ///
    /// * `key` - 任何含有公開部分的 OpenSSL 金鑰。
    ///
    /// # 返回
    ///
    /// 成功時返回 `Jwk`；金鑰類型或曲線不受支援時返回 `JwkError::UnsupportedKey`。
    pub fn from_key<T: HasPublic>(key: &PKeyRef<T>) -> Result<Self, JwkError> {
        match key.id() {
            Id::RSA => {
                let rsa = key.rsa()?;
                Ok(Jwk::Rsa(RsaJwk {
                    n: URL_SAFE_NO_PAD.encode(rsa.n().to_vec()),
                    e: URL_SAFE_NO_PAD.encode(rsa.e().to_vec()),
                }))
            }
            Id::EC => {
                let ec = key.ec_key()?;
                let group = ec.group();
                let (crv, width) = match group.curve_name() {
                    Some(Nid::X9_62_PRIME256V1) => ("P-256", 32),
                    Some(Nid::SECP384R1) => ("P-384", 48),
                    other => return Err(JwkError::UnsupportedKey(format!("EC curve {:?}", other))),
                };

                let mut ctx = BigNumContext::new()?;
                let mut x = openssl::bn::BigNum::new()?;
                let mut y = openssl::bn::BigNum::new()?;
                ec.public_key()
                    .affine_coordinates(group, &mut x, &mut y, &mut ctx)?;

                Ok(Jwk::Ec(EcJwk {
                    crv: crv.to_string(),
                    x: URL_SAFE_NO_PAD.encode(x.to_vec_padded(width)?),
                    y: URL_SAFE_NO_PAD.encode(y.to_vec_padded(width)?),
                }))
            }
            other => Err(JwkError::UnsupportedKey(format!("{:?}", other))),
        }
    }

    /// 產生 RFC 7638 規定的標準 JSON：只含必要成員，依字典序排列且沒有空白。
    ///
    /// 依賴 `serde_json` 的 `preserve_order`，插入順序即輸出順序。
    pub fn canonical_json(&self) -> Result<String, JwkError> {
        let mut map = Map::new();
        match self {
            Jwk::Rsa(jwk) => {
                map.insert("e".to_string(), Value::String(jwk.e.clone()));
                map.insert("kty".to_string(), Value::String("RSA".to_string()));
                map.insert("n".to_string(), Value::String(jwk.n.clone()));
            }
            Jwk::Ec(jwk) => {
                map.insert("crv".to_string(), Value::String(jwk.crv.clone()));
                map.insert("kty".to_string(), Value::String("EC".to_string()));
                map.insert("x".to_string(), Value::String(jwk.x.clone()));
                map.insert("y".to_string(), Value::String(jwk.y.clone()));
            }
        }

        serde_json::to_string(&Value::Object(map)).map_err(JwkError::from)
    }

    /// 計算 JWK thumbprint：標準 JSON 的 SHA-256，以 URL 安全 Base64（無填充）回傳。
    pub fn thumbprint(&self) -> Result<String, JwkError> {
        let hash = sha256(self.canonical_json()?.as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(hash))
    }

    /// 將 JWK 轉為 JSON 值，供保護頭使用。
    pub fn to_value(&self) -> Result<Value, JwkError> {
        serde_json::to_value(self).map_err(JwkError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::{ec::EcGroup, ec::EcKey, pkey::PKey, rsa::Rsa};

    #[test]
    fn test_rsa_canonical_member_order() {
        let jwk = Jwk::Rsa(RsaJwk {
            n: "nnn".to_string(),
            e: "AQAB".to_string(),
        });
        assert_eq!(
            jwk.canonical_json().unwrap(),
            r#"{"e":"AQAB","kty":"RSA","n":"nnn"}"#
        );
    }

    #[test]
    fn test_ec_canonical_member_order() {
        let jwk = Jwk::Ec(EcJwk {
            crv: "P-256".to_string(),
            x: "xx".to_string(),
            y: "yy".to_string(),
        });
        assert_eq!(
            jwk.canonical_json().unwrap(),
            r#"{"crv":"P-256","kty":"EC","x":"xx","y":"yy"}"#
        );
    }

    #[test]
    fn test_rfc7638_example_thumbprint() {
        // RFC 7638 第 3.1 節的範例金鑰。
        let jwk = Jwk::Rsa(RsaJwk {
            n: "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw".to_string(),
            e: "AQAB".to_string(),
        });
        assert_eq!(
            jwk.thumbprint().unwrap(),
            "NzbLsXh8uDCcd-6MNwXF4W_7noWXFZAfHkxZsRGC9Xs"
        );
    }

    #[test]
    fn test_from_ec_key_pads_coordinates() {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();
        match Jwk::from_key(&key).unwrap() {
            Jwk::Ec(ec) => {
                assert_eq!(ec.crv, "P-256");
                assert_eq!(URL_SAFE_NO_PAD.decode(&ec.x).unwrap().len(), 32);
                assert_eq!(URL_SAFE_NO_PAD.decode(&ec.y).unwrap().len(), 32);
            }
            other => panic!("unexpected jwk {:?}", other),
        }
    }

    #[test]
    fn test_serialized_jwk_carries_kty() {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let value = Jwk::from_key(&key).unwrap().to_value().unwrap();
        assert_eq!(value["kty"], "RSA");
        assert_eq!(value["e"], "AQAB");
    }
}
