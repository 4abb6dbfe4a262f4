//! 訂單流程：建立訂單、完成每個授權的挑戰、送出 CSR 並下載證書。
//!
//! 狀態機：`pending → ready → processing → valid`，任何非終止狀態都可能轉為 `invalid`。
//! 任何一個授權失敗都會放棄整張訂單。

use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    authorization::{Authorization, AuthorizationStatus},
    certificate::CertificateChain,
    challenge::{ChallengeStatus, ChallengeType, KeyAuthorization},
    csr::CsrProvider,
    error::{Error, Problem, Result},
    payload::{ChallengeReadyPayload, FinalizeOrderPayload, Identifier, NewOrderPayload, PayloadT},
    poll::{CancelSignal, PollPolicy, Pollable, Poller, Progress, Sleeper, ThreadSleeper},
    responder::{ChallengeResponder, Provision},
    session::Session,
};

/// 訂單狀態，目前支援的狀態有 pending、ready、processing、valid 與 invalid。
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Processing => "processing",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Ready => 1,
            Self::Processing => 2,
            Self::Valid | Self::Invalid => 3,
        }
    }
}

/// CA 回傳的訂單資源。
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Order {
    /// 訂單當前狀態
    pub status: OrderStatus,
    /// 過期時間（RFC 3339 字串）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
    pub identifiers: Vec<Identifier>,
    /// 授權 URL 列表
    #[serde(default)]
    pub authorizations: Vec<String>,
    /// 最終確認 URL
    pub finalize: String,
    /// 憑證 URL（僅在有效時存在）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,
}

impl Order {
    /// 輪詢最終化結果時使用的進度判斷。
    pub fn progress(&self) -> Progress {
        match self.status {
            OrderStatus::Valid => Progress::Done,
            OrderStatus::Invalid => Progress::Failed {
                status: self.status.as_str().to_string(),
                detail: self
                    .error
                    .as_ref()
                    .map(|p| p.detail.clone())
                    .unwrap_or_else(|| "order is invalid".to_string()),
                problem: self.error.clone(),
            },
            _ => Progress::Pending,
        }
    }
}

impl Pollable for Order {
    fn status_label(&self) -> &str {
        self.status.as_str()
    }

    fn status_rank(&self) -> u8 {
        self.status.rank()
    }
}

/// 為某個授權選定的挑戰。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedChallenge {
    pub challenge_type: ChallengeType,
    pub url: String,
    pub token: String,
    pub key_authorization: KeyAuthorization,
}

impl SelectedChallenge {
    pub fn provision(&self, identifier: &Identifier) -> Provision {
        Provision {
            identifier: identifier.clone(),
            challenge_type: self.challenge_type.clone(),
            token: self.token.clone(),
            key_authorization: self.key_authorization.clone(),
        }
    }
}

/// 授權還需要做什麼。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", content = "challenge", rename_all = "camelCase")]
pub enum AuthorizationStep {
    /// 取得時已經是 `valid`，不需佈署也不需通知。
    AlreadyValid,
    /// 需要佈署挑戰並通知 CA。
    Provision(SelectedChallenge),
    /// CA 已在驗證中，只需等待結果。
    AwaitValidation(SelectedChallenge),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAuthorization {
    pub identifier: Identifier,
    pub authorization_url: String,
    pub step: AuthorizationStep,
}

impl PendingAuthorization {
    /// 交給回應者的佈署資訊；已驗證的授權沒有。
    pub fn provision(&self) -> Option<Provision> {
        match &self.step {
            AuthorizationStep::AlreadyValid => None,
            AuthorizationStep::Provision(challenge) | AuthorizationStep::AwaitValidation(challenge) => {
                Some(challenge.provision(&self.identifier))
            }
        }
    }
}

/// 已建立但尚未完成的訂單。
///
/// 可以序列化成 JSON，讓「取得挑戰」與「完成驗證」在不同行程中進行。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOrder {
    pub order_url: String,
    pub order: Order,
    pub authorizations: Vec<PendingAuthorization>,
}

impl PendingOrder {
    /// 所有仍需佈署的挑戰。
    pub fn provisions(&self) -> Vec<Provision> {
        self.authorizations
            .iter()
            .filter(|a| matches!(a.step, AuthorizationStep::Provision(_)))
            .filter_map(PendingAuthorization::provision)
            .collect()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// 驅動訂單完成的協調器。
pub struct Orchestrator<'a> {
    session: &'a Session,
    challenge_type: ChallengeType,
    policy: PollPolicy,
    sleeper: &'a dyn Sleeper,
    concurrent: bool,
    cancel: CancelSignal,
}

impl<'a> Orchestrator<'a> {
    /// 建立協調器，使用預設輪詢參數與 `thread::sleep`。
    ///
    /// # 參數
    ///
    /// - `session`: 已建立帳戶的工作階段。
    /// - `challenge_type`: 每個授權要使用的挑戰類型，CA 沒提供時不會改用其他類型。
    pub fn new(session: &'a Session, challenge_type: ChallengeType) -> Self {
        Self {
            session,
            challenge_type,
            policy: PollPolicy::default(),
            sleeper: &ThreadSleeper,
            concurrent: false,
            cancel: CancelSignal::new(),
        }
    }

    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_sleeper(mut self, sleeper: &'a dyn Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// 是否以多個執行緒同時處理授權。
    pub fn concurrent(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// 建立新訂單。
    ///
    /// # 回傳
    ///
    /// 訂單 URL（`Location` 標頭）與訂單內容。
    pub fn create_order(&self, identifiers: &[Identifier]) -> Result<(String, Order)> {
        self.cancel.check()?;
        let payload = NewOrderPayload::new(identifiers).to_payload()?;
        let response = self
            .session
            .post(&self.session.directory().new_order, &payload)?;

        let order_url = response
            .location()
            .ok_or_else(|| Error::Protocol("newOrder response has no Location header".into()))?
            .to_string();
        let order: Order = response.json()?;
        info!(url = %order_url, status = order.status.as_str(), "Order created");
        Ok((order_url, order))
    }

    pub fn fetch_order(&self, url: &str) -> Result<Order> {
        self.cancel.check()?;
        Ok(self.session.post_as_get(url)?.json()?)
    }

    pub fn fetch_authorization(&self, url: &str) -> Result<Authorization> {
        self.cancel.check()?;
        Ok(self.session.post_as_get(url)?.json()?)
    }

    /// 建立訂單並取得每個授權需要的挑戰，不做任何佈署。
    pub fn prepare(&self, identifiers: &[Identifier]) -> Result<PendingOrder> {
        let (order_url, order) = self.create_order(identifiers)?;
        self.plan(order_url, order)
    }

    /// 重新取得既有訂單並從目前狀態繼續。
    pub fn resume(&self, order_url: &str) -> Result<PendingOrder> {
        let order = self.fetch_order(order_url)?;
        self.plan(order_url.to_string(), order)
    }

    /// 完成挑戰、最終化並下載證書。
    ///
    /// # 參數
    ///
    /// - `pending`: [`Orchestrator::prepare`] 或 [`Orchestrator::resume`] 的結果。
    /// - `csr`: 提供 DER 格式 CSR。
    /// - `responder`: 佈署挑戰內容的回應者。
    pub fn complete(
        &self,
        pending: &PendingOrder,
        csr: &dyn CsrProvider,
        responder: &dyn ChallengeResponder,
    ) -> Result<CertificateChain> {
        if pending.order.status == OrderStatus::Invalid {
            return Err(order_failed(&pending.order_url, &pending.order));
        }

        self.settle_all(&pending.authorizations, responder)?;
        let order = self.finalize(pending, csr)?;
        self.download(&order)
    }

    /// 從建立訂單到下載證書的完整流程。
    pub fn issue(
        &self,
        identifiers: &[Identifier],
        csr: &dyn CsrProvider,
        responder: &dyn ChallengeResponder,
    ) -> Result<CertificateChain> {
        let pending = self.prepare(identifiers)?;
        self.complete(&pending, csr, responder)
    }

    fn plan(&self, order_url: String, order: Order) -> Result<PendingOrder> {
        if order.status == OrderStatus::Invalid {
            return Err(order_failed(&order_url, &order));
        }

        let thumbprint = self.session.signer().thumbprint()?;
        let mut authorizations = Vec::with_capacity(order.authorizations.len());
        for url in &order.authorizations {
            let authorization = self.fetch_authorization(url)?;
            let step = self.select_step(url, &authorization, &thumbprint)?;
            authorizations.push(PendingAuthorization {
                identifier: authorization.identifier,
                authorization_url: url.clone(),
                step,
            });
        }

        Ok(PendingOrder {
            order_url,
            order,
            authorizations,
        })
    }

    fn select_step(&self, url: &str, authorization: &Authorization, thumbprint: &str) -> Result<AuthorizationStep> {
        match authorization.status {
            AuthorizationStatus::Valid => {
                debug!(identifier = %authorization.identifier, "Authorization already valid");
                return Ok(AuthorizationStep::AlreadyValid);
            }
            status if status.is_failure() => {
                return Err(challenge_failed(
                    authorization,
                    url,
                    authorization.failure_detail(),
                    authorization.failure_problem().cloned(),
                ))
            }
            _ => {}
        }

        let challenge = authorization
            .find_challenge(&self.challenge_type)
            .ok_or_else(|| Error::UnsupportedChallenge {
                identifier: authorization.identifier.value.clone(),
                wanted: self.challenge_type.to_string(),
                offered: authorization.offered_types(),
            })?;

        if challenge.status == ChallengeStatus::Invalid {
            let problem = challenge.error.clone();
            let detail = problem
                .as_ref()
                .map(|p| p.detail.clone())
                .unwrap_or_else(|| format!("{} challenge is invalid", challenge.challenge_type));
            return Err(challenge_failed(authorization, url, detail, problem));
        }

        let selected = SelectedChallenge {
            challenge_type: challenge.challenge_type.clone(),
            url: challenge.url.clone(),
            token: challenge.token.clone(),
            key_authorization: challenge.key_authorization(thumbprint),
        };
        if challenge.status.is_submitted() {
            Ok(AuthorizationStep::AwaitValidation(selected))
        } else {
            Ok(AuthorizationStep::Provision(selected))
        }
    }

    fn settle_all(&self, authorizations: &[PendingAuthorization], responder: &dyn ChallengeResponder) -> Result<()> {
        let outstanding = authorizations
            .iter()
            .filter(|a| a.step != AuthorizationStep::AlreadyValid)
            .count();
        if !self.concurrent || outstanding < 2 {
            for authorization in authorizations {
                self.settle(authorization, responder, &self.cancel)?;
            }
            return Ok(());
        }

        let siblings = self.cancel.child();
        let results: Vec<Result<()>> = thread::scope(|scope| {
            let handles: Vec<_> = authorizations
                .iter()
                .map(|authorization| {
                    let siblings = siblings.clone();
                    scope.spawn(move || {
                        let result = self.settle(authorization, responder, &siblings);
                        if result.is_err() {
                            siblings.cancel();
                        }
                        result
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(Error::Protocol("authorization worker panicked".into())))
                })
                .collect()
        });

        first_failure(results)
    }

    fn settle(
        &self,
        authorization: &PendingAuthorization,
        responder: &dyn ChallengeResponder,
        cancel: &CancelSignal,
    ) -> Result<()> {
        let challenge = match &authorization.step {
            AuthorizationStep::AlreadyValid => {
                responder.validated(&authorization.identifier);
                return Ok(());
            }
            AuthorizationStep::AwaitValidation(_) => {
                return self.await_valid(authorization, responder, cancel);
            }
            AuthorizationStep::Provision(challenge) => challenge,
        };

        let provision = challenge.provision(&authorization.identifier);
        cancel.check()?;
        responder.provision(&provision)?;
        debug!(identifier = %authorization.identifier, "Challenge provisioned");

        let result = self
            .notify(&challenge.url, cancel)
            .and_then(|()| self.await_valid(authorization, responder, cancel));

        if let Err(e) = responder.cleanup(&provision) {
            warn!(identifier = %authorization.identifier, error = %e, "Challenge cleanup failed");
        }
        result
    }

    fn notify(&self, challenge_url: &str, cancel: &CancelSignal) -> Result<()> {
        cancel.check()?;
        self.session
            .post(challenge_url, &ChallengeReadyPayload::new().to_payload()?)?;
        Ok(())
    }

    fn await_valid(
        &self,
        authorization: &PendingAuthorization,
        responder: &dyn ChallengeResponder,
        cancel: &CancelSignal,
    ) -> Result<()> {
        let url = &authorization.authorization_url;
        let result = Poller::new(self.session, self.policy, self.sleeper)
            .with_cancel(cancel.clone())
            .wait_for(url, Authorization::progress);

        match result {
            Ok(_authorization) => {
                info!(identifier = %authorization.identifier, "Authorization valid");
                responder.validated(&authorization.identifier);
                Ok(())
            }
            Err(Error::PollFailed { detail, problem, .. }) => Err(Error::ChallengeFailed {
                identifier: authorization.identifier.value.clone(),
                authorization: url.clone(),
                detail,
                problem,
            }),
            Err(e) => Err(e),
        }
    }

    fn finalize(&self, pending: &PendingOrder, csr: &dyn CsrProvider) -> Result<Order> {
        let order_url = &pending.order_url;
        match pending.order.status {
            OrderStatus::Valid => return Ok(pending.order.clone()),
            OrderStatus::Processing => return self.poll_order(order_url),
            _ => {}
        }

        self.cancel.check()?;
        let der = csr.csr_der(&pending.order.identifiers)?;
        let payload = FinalizeOrderPayload::new(&der).to_payload()?;
        let order: Order = self.session.post(&pending.order.finalize, &payload)?.json()?;
        info!(url = %order_url, status = order.status.as_str(), "Order finalized");

        match order.status {
            OrderStatus::Valid if order.certificate.is_some() => Ok(order),
            OrderStatus::Invalid => Err(order_failed(order_url, &order)),
            _ => self.poll_order(order_url),
        }
    }

    fn poll_order(&self, order_url: &str) -> Result<Order> {
        Poller::new(self.session, self.policy, self.sleeper)
            .with_cancel(self.cancel.clone())
            .wait_for(order_url, Order::progress)
    }

    fn download(&self, order: &Order) -> Result<CertificateChain> {
        let url = order
            .certificate
            .as_deref()
            .ok_or_else(|| Error::Protocol("valid order has no certificate URL".into()))?;

        self.cancel.check()?;
        let response = self.session.post_as_get(url)?;
        if let Some(content_type) = response.header("content-type") {
            if !content_type.starts_with("application/pem-certificate-chain") {
                debug!(content_type, "Unexpected certificate content type");
            }
        }
        if response.body.is_empty() {
            return Err(Error::Protocol("certificate response body is empty".into()));
        }

        let chain = CertificateChain::new(response.text())?;
        info!(url, "Certificate downloaded");
        Ok(chain)
    }
}

fn challenge_failed(authorization: &Authorization, url: &str, detail: String, problem: Option<Problem>) -> Error {
    Error::ChallengeFailed {
        identifier: authorization.identifier.value.clone(),
        authorization: url.to_string(),
        detail,
        problem,
    }
}

fn order_failed(url: &str, order: &Order) -> Error {
    match order.progress() {
        Progress::Failed {
            status,
            detail,
            problem,
        } => Error::PollFailed {
            url: url.to_string(),
            status,
            detail,
            problem,
        },
        _ => Error::Protocol(format!("order {} is {}", url, order.status.as_str())),
    }
}

/// 取第一個真正的錯誤；被兄弟工作取消的結果只在沒有其他錯誤時回報。
fn first_failure(results: Vec<Result<()>>) -> Result<()> {
    let mut cancelled = false;
    for result in results {
        match result {
            Ok(()) => {}
            Err(Error::Cancelled) => cancelled = true,
            Err(e) => return Err(e),
        }
    }
    if cancelled {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}
