use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tracing::debug;

use crate::http::{HttpClient, HttpError};

/// 表示在取得 Nonce 時可能發生的錯誤狀況。
#[derive(Error, Debug)]
pub enum NonceError {
    /// 當請求過程中發生錯誤時回傳此錯誤。
    #[error("Failed to make request: {0}")]
    RequestFailed(#[from] HttpError),
    /// 當回應中缺少 `Replay-Nonce` 標頭時回傳此錯誤。
    #[error("No Replay-Nonce header found in response")]
    NoNonceHeader,
}

/// 保存目前可用的 replay nonce。
///
/// 每個 nonce 只能使用一次：[`NoncePool::take`] 取出的同時清空，
/// 因此並行的請求不可能拿到同一個值。每個回應的 `Replay-Nonce` 由 [`NoncePool::store`] 放回。
#[derive(Debug, Default)]
pub struct NoncePool {
    current: Mutex<Option<String>>,
}

impl NoncePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以已知的 nonce 建立，例如目錄回應附帶的 nonce。
    pub fn with_nonce(nonce: Option<String>) -> Self {
        Self {
            current: Mutex::new(nonce),
        }
    }

    /// 取出並清空目前的 nonce。
    pub fn take(&self) -> Option<String> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// 以回應帶回的新 nonce 取代目前的值。
    pub fn store(&self, nonce: impl Into<String>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(nonce.into());
    }

    pub fn is_empty(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// 取出目前的 nonce；沒有時向 `newNonce` 發送 HEAD 請求取得新的。
    ///
    /// # 參數
    ///
    /// - `http`: 用來發送請求的客戶端。
    /// - `new_nonce_url`: 目錄中的 `newNonce` 端點。
    pub fn take_or_fetch(&self, http: &dyn HttpClient, new_nonce_url: &str) -> Result<String, NonceError> {
        if let Some(nonce) = self.take() {
            return Ok(nonce);
        }
        fetch_nonce(http, new_nonce_url)
    }
}

/// 透過 HTTP HEAD 請求取得回應中的 `Replay-Nonce` 標頭。
pub fn fetch_nonce(http: &dyn HttpClient, new_nonce_url: &str) -> Result<String, NonceError> {
    debug!(url = new_nonce_url, "Fetching fresh nonce");
    let response = http.head(new_nonce_url)?;
    response
        .replay_nonce()
        .map(ToString::to_string)
        .ok_or(NonceError::NoNonceHeader)
}
