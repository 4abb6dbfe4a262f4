//! 高階介面：以一份 [`AcmeConfig`] 完成帳戶、簽發與續約。

use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

use crate::{
    account::{self, Account},
    certificate::CertificateChain,
    config::AcmeConfig,
    csr::{CsrProvider, DerCsr},
    error::Result,
    http::{HttpClient, ReqwestClient},
    order::{Orchestrator, PendingOrder},
    payload::Identifier,
    poll::{CancelSignal, Sleeper, ThreadSleeper},
    responder::ChallengeResponder,
    session::Session,
    signature::AccountKey,
};

/// ACME 客戶端。
///
/// 建立時就會解析目錄；帳戶在第一次需要時才建立並快取。
#[derive(Debug)]
pub struct AcmeClient {
    config: AcmeConfig,
    session: Session,
    sleeper: Arc<dyn Sleeper>,
    account: Mutex<Option<Account>>,
    cancel: CancelSignal,
}

impl AcmeClient {
    /// 以 `reqwest` 建立客戶端並解析目錄。
    ///
    /// # 參數
    ///
    /// - `config`: 設定，會先經過驗證。
    /// - `key`: 帳戶金鑰。
    pub fn new(config: AcmeConfig, key: Arc<dyn AccountKey>) -> Result<Self> {
        config.validate()?;
        let http = ReqwestClient::new(config.request_timeout(), &config.user_agent)?;
        Self::with_http(config, key, Arc::new(http))
    }

    /// 使用自訂的 HTTP 客戶端。
    pub fn with_http(config: AcmeConfig, key: Arc<dyn AccountKey>, http: Arc<dyn HttpClient>) -> Result<Self> {
        config.validate()?;
        let session = Session::connect(http, &config.directory_url, key)?;
        Ok(Self {
            config,
            session,
            sleeper: Arc::new(ThreadSleeper),
            account: Mutex::new(None),
            cancel: CancelSignal::new(),
        })
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn config(&self) -> &AcmeConfig {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// 取消訊號；取消後進行中的流程會在下一個請求或等待前停止。
    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// 建立或取得帳戶，結果會被快取。
    pub fn ensure_account(&self) -> Result<Account> {
        let mut cached = self.account.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(account) = cached.as_ref() {
            return Ok(account.clone());
        }

        let account = account::ensure_account(&self.session, self.config.contacts.as_slice())?;
        *cached = Some(account.clone());
        Ok(account)
    }

    /// 依設定建立的訂單協調器。
    pub fn orchestrator(&self) -> Result<Orchestrator<'_>> {
        Ok(Orchestrator::new(&self.session, self.config.challenge()?)
            .with_policy(self.config.poll_policy())
            .with_sleeper(self.sleeper.as_ref())
            .concurrent(self.config.concurrent_authorizations)
            .with_cancel(self.cancel.clone()))
    }

    /// 為 `identifiers` 簽發證書。
    pub fn issue(
        &self,
        identifiers: &[Identifier],
        csr: &dyn CsrProvider,
        responder: &dyn ChallengeResponder,
    ) -> Result<CertificateChain> {
        self.ensure_account()?;
        self.orchestrator()?.issue(identifiers, csr, responder)
    }

    /// 只憑 CSR 簽發證書，識別項取自 CSR 的 CommonName 與 SAN。
    pub fn issue_from_csr(&self, csr: &DerCsr, responder: &dyn ChallengeResponder) -> Result<CertificateChain> {
        let identifiers = csr.identifiers();
        info!(count = identifiers.len(), "Issuing for names found in CSR");
        self.issue(&identifiers, csr, responder)
    }

    /// 建立訂單並取得挑戰，不做佈署。
    pub fn prepare(&self, identifiers: &[Identifier]) -> Result<PendingOrder> {
        self.ensure_account()?;
        self.orchestrator()?.prepare(identifiers)
    }

    /// 從訂單 URL 繼續。
    pub fn resume(&self, order_url: &str) -> Result<PendingOrder> {
        self.ensure_account()?;
        self.orchestrator()?.resume(order_url)
    }

    pub fn complete(
        &self,
        pending: &PendingOrder,
        csr: &dyn CsrProvider,
        responder: &dyn ChallengeResponder,
    ) -> Result<CertificateChain> {
        self.ensure_account()?;
        self.orchestrator()?.complete(pending, csr, responder)
    }

    /// 證書剩餘天數少於 `threshold_days` 時重新簽發。
    ///
    /// # 回傳
    ///
    /// 不需要續約時回傳 `None`，不會對 CA 發出任何請求。
    pub fn renew_if_due(
        &self,
        existing: &CertificateChain,
        threshold_days: u32,
        identifiers: &[Identifier],
        csr: &dyn CsrProvider,
        responder: &dyn ChallengeResponder,
    ) -> Result<Option<CertificateChain>> {
        let not_after = existing.not_after()?;
        if !existing.should_renew(threshold_days)? {
            info!(%not_after, threshold_days, "Certificate not due for renewal");
            return Ok(None);
        }

        info!(%not_after, threshold_days, "Renewing certificate");
        self.issue(identifiers, csr, responder).map(Some)
    }
}
