//! 驅動器的設定。
//!
//! 可以從 TOML 載入（鍵名為 camelCase，時間以秒為單位），或用 [`AcmeConfigBuilder`] 組出。

use std::{fs, io, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{challenge::ChallengeType, poll::PollPolicy};

/// Let's Encrypt 正式環境目錄。
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
/// Let's Encrypt 測試環境目錄。
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// 設定相關錯誤。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Unknown challenge type: {0}")]
    UnknownChallengeType(String),
}

type Result<T> = std::result::Result<T, ConfigError>;

/// 所有可調整的選項。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AcmeConfig {
    /// CA 目錄 URL。
    pub directory_url: String,
    /// 挑戰類型，例如 `http-01`。
    pub challenge_type: String,
    pub poll_max_attempts: u32,
    /// 第一次輪詢等待秒數。
    pub poll_initial_delay: u64,
    /// 輪詢等待秒數上限。
    pub poll_max_delay: u64,
    /// 聯絡方式，`mailto:` 或其他 URI；沒有 scheme 的值視為電子郵件。
    pub contacts: Vec<String>,
    /// 單一 HTTP 請求的逾時秒數。
    pub request_timeout: u64,
    pub user_agent: String,
    /// 是否同時處理多個授權。
    pub concurrent_authorizations: bool,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        let policy = PollPolicy::default();
        Self {
            directory_url: LETS_ENCRYPT_PRODUCTION.to_string(),
            challenge_type: ChallengeType::Http01.to_string(),
            poll_max_attempts: policy.max_attempts,
            poll_initial_delay: policy.initial_delay.as_secs(),
            poll_max_delay: policy.max_delay.as_secs(),
            contacts: Vec::new(),
            request_timeout: 30,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            concurrent_authorizations: false,
        }
    }
}

impl AcmeConfig {
    /// 從 TOML 字串解析並驗證。
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: AcmeConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// 從 TOML 檔案載入並驗證。
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// 檢查設定是否合理。
    pub fn validate(&self) -> Result<()> {
        if self.directory_url.trim().is_empty() {
            return Err(ConfigError::Invalid("directoryUrl must not be empty".into()));
        }
        if self.poll_max_attempts == 0 {
            return Err(ConfigError::Invalid("pollMaxAttempts must be at least 1".into()));
        }
        if self.poll_max_delay < self.poll_initial_delay {
            return Err(ConfigError::Invalid(
                "pollMaxDelay must not be smaller than pollInitialDelay".into(),
            ));
        }
        if self.request_timeout == 0 {
            return Err(ConfigError::Invalid("requestTimeout must be at least 1 second".into()));
        }
        self.challenge()?;
        Ok(())
    }

    pub fn challenge(&self) -> Result<ChallengeType> {
        self.challenge_type
            .parse()
            .map_err(ConfigError::UnknownChallengeType)
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            max_attempts: self.poll_max_attempts,
            initial_delay: Duration::from_secs(self.poll_initial_delay),
            max_delay: Duration::from_secs(self.poll_max_delay),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

/// 用於構建 [`AcmeConfig`] 的構造器，採用 builder 模式。
#[derive(Debug, Default)]
pub struct AcmeConfigBuilder {
    config: AcmeConfig,
}

impl AcmeConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 設置 ACME 目錄 URL。
    pub fn directory_url(mut self, url: &str) -> Self {
        self.config.directory_url = url.to_string();
        self
    }

    /// 使用 Let's Encrypt 測試環境。
    pub fn staging(self) -> Self {
        self.directory_url(LETS_ENCRYPT_STAGING)
    }

    pub fn challenge_type(mut self, challenge_type: ChallengeType) -> Self {
        self.config.challenge_type = challenge_type.to_string();
        self
    }

    pub fn contact(mut self, contact: &str) -> Self {
        self.config.contacts.push(contact.to_string());
        self
    }

    /// 設置輪詢參數，時間以整秒計。
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - 最多取得次數。
    /// * `initial_delay_secs` - 第一次等待秒數，之後每次加倍。
    /// * `max_delay_secs` - 等待秒數上限。
    pub fn poll(mut self, max_attempts: u32, initial_delay_secs: u64, max_delay_secs: u64) -> Self {
        self.config.poll_max_attempts = max_attempts;
        self.config.poll_initial_delay = initial_delay_secs;
        self.config.poll_max_delay = max_delay_secs;
        self
    }

    /// 單一請求的逾時秒數。
    pub fn request_timeout(mut self, timeout_secs: u64) -> Self {
        self.config.request_timeout = timeout_secs;
        self
    }

    pub fn user_agent(mut self, user_agent: &str) -> Self {
        self.config.user_agent = user_agent.to_string();
        self
    }

    pub fn concurrent_authorizations(mut self, enabled: bool) -> Self {
        self.config.concurrent_authorizations = enabled;
        self
    }

    /// 根據當前的配置構建 [`AcmeConfig`] 實例。
    ///
    /// # Errors
    ///
    /// 設定不合理時返回 [`ConfigError`]。
    pub fn build(self) -> Result<AcmeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
