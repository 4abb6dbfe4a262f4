//! # ACME Protocol Driver
//!
//! 本庫實作 ACME（RFC 8555）客戶端的協議部分，向 CA（例如 Let's Encrypt）申請與續約 X.509 證書：
//!
//! - **session / transport**: 目錄解析、nonce 管理、JWS 簽名與 `badNonce` 重試。
//! - **account**: 以帳戶金鑰建立或查詢帳戶。
//! - **order**: 建立訂單、完成挑戰、送出 CSR 並下載證書。
//! - **poll**: 帶退避與 `Retry-After` 的輪詢，以及取消訊號。
//! - **responder**: 把挑戰內容佈署到 CA 看得到的地方，內建 webroot 實作。
//!
//! ## 特性
//!
//! - 支援 RSA、P-256、P-384 帳戶金鑰
//! - HTTP-01、DNS-01、TLS-ALPN-01 的 key authorization 計算
//! - 可選擇同時處理多個授權
//! - 訂單可序列化，讓取得挑戰與完成驗證分開進行
//! - 依到期日判斷是否續約
//!
//! ## 示例
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use acme_driver::{
//!     AcmeClient, AcmeConfigBuilder, ChallengeType, Identifier, KeyAlgorithm, KeyPair, WebrootResponder,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AcmeConfigBuilder::new()
//!         .staging()
//!         .challenge_type(ChallengeType::Http01)
//!         .contact("admin@example.com")
//!         .build()?;
//!
//!     let account_key = Arc::new(KeyPair::generate(KeyAlgorithm::EcP256)?);
//!     let client = AcmeClient::new(config, account_key)?;
//!
//!     let certificate_key = KeyPair::generate(KeyAlgorithm::Rsa { bits: 2048 })?;
//!     let responder = WebrootResponder::new("/var/www/html/.well-known/acme-challenge");
//!
//!     let chain = client.issue(&[Identifier::dns("example.com")], &certificate_key, &responder)?;
//!     println!("{}", chain.as_pem());
//!     Ok(())
//! }
//! ```
//!
//! 更多詳細 API 說明請參考各個模組的文檔。

pub mod account;
pub mod authorization;
pub mod certificate;
pub mod challenge;
pub mod client;
pub mod config;
pub mod csr;
pub mod directory;
pub mod error;
pub mod http;
pub mod jwk;
pub mod jws;
pub mod key_pair;
pub mod nonce;
pub mod order;
pub mod payload;
pub mod poll;
pub mod protection;
pub mod responder;
pub mod session;
pub mod signature;
pub mod transport;

pub use certificate::CertificateChain;
pub use challenge::ChallengeType;
pub use client::AcmeClient;
pub use config::{AcmeConfig, AcmeConfigBuilder};
pub use csr::{Csr, CsrProvider, DerCsr};
pub use error::{Error, Problem, Result};
pub use key_pair::{KeyAlgorithm, KeyPair};
pub use order::{Orchestrator, PendingOrder};
pub use payload::Identifier;
pub use responder::{ChallengeResponder, FnResponder, WebrootResponder};
pub use session::Session;
