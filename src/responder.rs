//! 挑戰回應者：把 key authorization 放到 CA 看得到的地方。
//!
//! 協議核心不在乎回應者是寫檔、設定 DNS 還是呼叫遠端代理，
//! 只要求 [`ChallengeResponder::provision`] 在內容對外可見之後才回傳。

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;
use tracing::{debug, info};

use crate::{
    challenge::{ChallengeType, KeyAuthorization, HTTP01_PATH_PREFIX},
    http::{HttpClient, HttpError},
    payload::Identifier,
};

/// 挑戰回應者回報的錯誤。
#[derive(Debug, Error)]
pub enum ResponderError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Challenge type {0} is not supported by this responder")]
    UnsupportedType(ChallengeType),
    #[error("Token contains characters outside the base64url alphabet: {0}")]
    InvalidToken(String),
    #[error("Self-check request failed: {0}")]
    SelfCheckRequest(#[from] HttpError),
    #[error("Challenge file at {url} is not reachable or has wrong content")]
    SelfCheckFailed { url: String },
    #[error("{0}")]
    Other(String),
}

/// 交給回應者的佈署資訊。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provision {
    pub identifier: Identifier,
    pub challenge_type: ChallengeType,
    pub token: String,
    pub key_authorization: KeyAuthorization,
}

impl Provision {
    /// HTTP-01 驗證時 CA 會請求的 URL。
    pub fn well_known_url(&self) -> String {
        format!("http://{}{}{}", self.identifier.value, HTTP01_PATH_PREFIX, self.token)
    }
}

/// 呼叫端提供的挑戰回應者。
pub trait ChallengeResponder: Send + Sync {
    /// 佈署挑戰內容，必須在內容對外可見之後才回傳。
    fn provision(&self, provision: &Provision) -> Result<(), ResponderError>;

    /// 授權結束（成功或失敗）後移除挑戰內容。
    fn cleanup(&self, _provision: &Provision) -> Result<(), ResponderError> {
        Ok(())
    }

    /// 識別項驗證成功時呼叫。
    fn validated(&self, _identifier: &Identifier) {}
}

/// 以閉包實作的回應者。
pub struct FnResponder<F> {
    provision: F,
}

impl<F> FnResponder<F>
where
    F: Fn(&Provision) -> Result<(), ResponderError> + Send + Sync,
{
    pub fn new(provision: F) -> Self {
        Self { provision }
    }
}

impl<F> ChallengeResponder for FnResponder<F>
where
    F: Fn(&Provision) -> Result<(), ResponderError> + Send + Sync,
{
    fn provision(&self, provision: &Provision) -> Result<(), ResponderError> {
        (self.provision)(provision)
    }
}

impl<F> fmt::Debug for FnResponder<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnResponder").finish_non_exhaustive()
    }
}

type RootFn = dyn Fn(&str) -> PathBuf + Send + Sync;

enum Webroot {
    Shared(PathBuf),
    PerDomain(Box<RootFn>),
}

/// 把 HTTP-01 的 key authorization 寫到網站目錄的回應者。
///
/// 檔案寫在 `<root>/<token>`，`root` 應該對應到網站的 `/.well-known/acme-challenge/`。
pub struct WebrootResponder {
    root: Webroot,
    self_check: Option<Arc<dyn HttpClient>>,
}

impl WebrootResponder {
    /// 所有網域共用同一個目錄。
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Webroot::Shared(root.into()),
            self_check: None,
        }
    }

    /// 每個網域由 `root_for` 決定目錄。
    pub fn per_domain<F>(root_for: F) -> Self
    where
        F: Fn(&str) -> PathBuf + Send + Sync + 'static,
    {
        Self {
            root: Webroot::PerDomain(Box::new(root_for)),
            self_check: None,
        }
    }

    /// 寫完檔案後先自行以 HTTP 讀取一次，內容相符才確認。
    pub fn with_self_check(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.self_check = Some(http);
        self
    }

    /// 挑戰檔案的完整路徑。
    pub fn file_path(&self, provision: &Provision) -> Result<PathBuf, ResponderError> {
        if !is_base64url(&provision.token) {
            return Err(ResponderError::InvalidToken(provision.token.clone()));
        }
        let root = match &self.root {
            Webroot::Shared(root) => root.clone(),
            Webroot::PerDomain(root_for) => root_for(&provision.identifier.value),
        };
        Ok(root.join(&provision.token))
    }

    fn check_reachable(&self, http: &dyn HttpClient, provision: &Provision) -> Result<(), ResponderError> {
        let url = provision.well_known_url();
        let response = http.get(&url)?;
        if response.is_success() && response.text().trim() == provision.key_authorization.as_str() {
            debug!(url, "Challenge file is reachable");
            Ok(())
        } else {
            Err(ResponderError::SelfCheckFailed { url })
        }
    }
}

impl fmt::Debug for WebrootResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let root = match &self.root {
            Webroot::Shared(root) => format!("{}", root.display()),
            Webroot::PerDomain(_) => "<per-domain>".to_string(),
        };
        f.debug_struct("WebrootResponder")
            .field("root", &root)
            .field("self_check", &self.self_check.is_some())
            .finish()
    }
}

impl ChallengeResponder for WebrootResponder {
    fn provision(&self, provision: &Provision) -> Result<(), ResponderError> {
        if provision.challenge_type != ChallengeType::Http01 {
            return Err(ResponderError::UnsupportedType(provision.challenge_type.clone()));
        }

        let path = self.file_path(provision)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, provision.key_authorization.as_str())?;
        info!(path = %path.display(), identifier = %provision.identifier, "Wrote challenge file");

        if let Some(http) = &self.self_check {
            if let Err(e) = self.check_reachable(http.as_ref(), provision) {
                remove_if_present(&path)?;
                return Err(e);
            }
        }
        Ok(())
    }

    fn cleanup(&self, provision: &Provision) -> Result<(), ResponderError> {
        remove_if_present(&self.file_path(provision)?)
    }
}

fn remove_if_present(path: &Path) -> Result<(), ResponderError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn is_base64url(token: &str) -> bool {
    !token.is_empty()
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
