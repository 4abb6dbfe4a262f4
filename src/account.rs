//! 模塊提供與 ACME 帳戶管理相關的功能：建立帳戶或查詢既有帳戶。

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::{
    error::{Error, Problem, Result},
    http::HttpResponse,
    payload::{NewAccountPayload, PayloadT},
    session::Session,
};

/// 錯誤類型，用於描述在處理 ACME 帳戶相關操作時可能發生的各類錯誤。
#[derive(Debug, Error)]
pub enum AccountError {
    /// CA 拒絕了帳戶請求。
    #[error("Account request rejected: {0}")]
    Rejected(Problem),
    /// 回應中缺少 `Location` 標頭。
    #[error("Account response has no Location header")]
    MissingLocation,
    /// 帳戶已停用或被撤銷，無法再使用。
    #[error("Account is {0}")]
    Unusable(AccountStatus),
}

/// 帳戶狀態。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    #[default]
    Valid,
    Deactivated,
    Revoked,
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AccountStatus::Valid => "valid",
            AccountStatus::Deactivated => "deactivated",
            AccountStatus::Revoked => "revoked",
        };
        f.write_str(s)
    }
}

/// CA 回傳的帳戶資源。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// 帳戶 URL，之後作為所有請求的 `kid`。
    #[serde(skip)]
    pub url: String,
    #[serde(default)]
    pub status: AccountStatus,
    #[serde(rename = "contact", default)]
    pub contacts: Vec<String>,
    /// 訂單清單的 URL，部分 CA 不提供。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orders: Option<String>,
    /// CA 以 201 回應表示這次請求才建立帳戶。
    #[serde(skip)]
    pub created: bool,
}

/// 使用工作階段的帳戶金鑰建立或取得帳戶，並把帳戶 URL 記入工作階段。
///
/// 相同金鑰重複呼叫會得到相同 URL：CA 以 200 回傳既有帳戶。
///
/// # Arguments
///
/// * `session` - 已解析目錄的工作階段。
/// * `contacts` - 聯絡方式，沒有 scheme 的值視為電子郵件。
///
/// # Errors
///
/// CA 回傳錯誤時返回 [`AccountError::Rejected`]，重試後仍是 `badNonce` 則原樣返回
/// [`Error::Ca`]；缺少 `Location` 時返回
/// [`AccountError::MissingLocation`]；帳戶不是 `valid` 時返回 [`AccountError::Unusable`]。
pub fn ensure_account<S: AsRef<str>>(session: &Session, contacts: &[S]) -> Result<Account> {
    let payload = NewAccountPayload::new(contacts, false);
    register(session, &payload)
}

/// 只查詢既有帳戶（`onlyReturnExisting: true`），不會建立新帳戶。
pub fn find_existing(session: &Session) -> Result<Account> {
    let payload = NewAccountPayload::new::<&str>(&[], true);
    register(session, &payload)
}

fn register(session: &Session, payload: &NewAccountPayload) -> Result<Account> {
    let new_account = &session.directory().new_account;
    let response = session
        .post_with_jwk(new_account, &payload.to_payload()?)
        .map_err(|e| match e {
            Error::Ca(problem) if !problem.is_bad_nonce() => {
                Error::Account(AccountError::Rejected(problem))
            }
            other => other,
        })?;

    let account = parse_account(&response)?;
    if account.status != AccountStatus::Valid {
        return Err(AccountError::Unusable(account.status).into());
    }

    session.set_account_url(&account.url);
    info!(url = %account.url, created = account.created, "Account ready");
    Ok(account)
}

fn parse_account(response: &HttpResponse) -> Result<Account> {
    let url = response
        .location()
        .ok_or(AccountError::MissingLocation)?
        .to_string();

    let mut account: Account = if response.body.is_empty() {
        Account {
            url: String::new(),
            status: AccountStatus::Valid,
            contacts: Vec::new(),
            orders: None,
            created: false,
        }
    } else {
        response.json()?
    };
    account.url = url;
    account.created = response.status == 201;
    Ok(account)
}
