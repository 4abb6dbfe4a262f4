//! 等待資源進入終止狀態的通用輪詢機制。
//!
//! 排程邏輯是一個純狀態機 [`PollState::next`]，睡眠透過 [`Sleeper`] 注入，
//! 因此可以換成其他排程方式而不影響協議邏輯。授權與訂單輪詢都使用 [`Poller::wait_for`]。

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::Duration,
};

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{
    error::{Error, Problem, Result},
    session::Session,
};

/// 預設最多輪詢次數。
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
/// 預設第一次等待時間。
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(2);
/// 預設等待時間上限。
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);
/// `Retry-After` 可以要求的最長等待時間，超過的值以此為準。
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(600);

/// 判斷一次輪詢結果的進度。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// 尚未到達終止狀態。
    Pending,
    /// 成功的終止狀態。
    Done,
    /// 失敗的終止狀態。
    Failed {
        status: String,
        detail: String,
        problem: Option<Problem>,
    },
}

/// 輪詢次數與退避參數。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

/// 狀態機的下一步。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStep {
    /// 等待指定時間後再取一次。
    Continue(Duration),
    Done,
    Failed {
        status: String,
        detail: String,
        problem: Option<Problem>,
    },
    /// 已用完所有次數。
    TimedOut { attempts: u32 },
}

/// 輪詢狀態：已取得的次數與下一次退避時間。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollState {
    attempts: u32,
    backoff: Duration,
}

impl PollState {
    pub fn new(policy: &PollPolicy) -> Self {
        Self {
            attempts: 0,
            backoff: policy.initial_delay.min(policy.max_delay),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// 記錄一次取得的結果並決定下一步。
    ///
    /// 不做任何 I/O。退避時間從 `initial_delay` 開始每次加倍，不超過 `max_delay`；
    /// `retry_after` 存在時取代這一次的等待時間（上限 [`MAX_RETRY_AFTER`]）。
    /// 最後一次取得之後不會再等待。
    ///
    /// # 參數
    ///
    /// - `policy`: 輪詢參數。
    /// - `progress`: 這次取得的資源進度。
    /// - `retry_after`: 回應中的 `Retry-After`。
    pub fn next(&mut self, policy: &PollPolicy, progress: &Progress, retry_after: Option<Duration>) -> PollStep {
        self.attempts += 1;
        match progress {
            Progress::Done => PollStep::Done,
            Progress::Failed {
                status,
                detail,
                problem,
            } => PollStep::Failed {
                status: status.clone(),
                detail: detail.clone(),
                problem: problem.clone(),
            },
            Progress::Pending if self.attempts >= policy.max_attempts => PollStep::TimedOut {
                attempts: self.attempts,
            },
            Progress::Pending => {
                let computed = self.backoff;
                self.backoff = computed.saturating_mul(2).min(policy.max_delay);
                PollStep::Continue(retry_after.map_or(computed, |d| d.min(MAX_RETRY_AFTER)))
            }
        }
    }
}

/// 可被輪詢的資源必須提供的狀態資訊。
pub trait Pollable {
    /// 狀態名稱，用於記錄與錯誤訊息。
    fn status_label(&self) -> &str;

    /// 狀態在狀態機中的順序，終止狀態最大。觀察到的順序不可倒退。
    fn status_rank(&self) -> u8;
}

/// 睡眠的抽象，讓排程方式可以替換。
pub trait Sleeper: Send + Sync + fmt::Debug {
    fn sleep(&self, duration: Duration);
}

/// 以 `thread::sleep` 實作。
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// 只記錄等待時間、不真正睡眠的實作，適合測試與模擬。
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.sleeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(duration);
    }
}

/// 合作式取消訊號。
///
/// [`CancelSignal::child`] 建立的子訊號會在自己或任何上層被取消時視為已取消，
/// 用來讓一個失敗的工作取消同一批的其他工作而不影響呼叫端。
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
    parent: Option<Box<CancelSignal>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Box::new(self.clone())),
        }
    }

    /// 已取消時回傳 [`Error::Cancelled`]。
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// 以 POST-as-GET 反覆取得資源直到終止狀態。
pub struct Poller<'a> {
    session: &'a Session,
    policy: PollPolicy,
    sleeper: &'a dyn Sleeper,
    cancel: CancelSignal,
}

impl<'a> Poller<'a> {
    pub fn new(session: &'a Session, policy: PollPolicy, sleeper: &'a dyn Sleeper) -> Self {
        Self {
            session,
            policy,
            sleeper,
            cancel: CancelSignal::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// 輪詢 `url` 直到 `predicate` 回報終止狀態。
    ///
    /// 每次請求與每次睡眠之前都會檢查取消訊號；觀察到取消後不再發出任何請求。
    ///
    /// # 回傳
    ///
    /// - `Done`：最後取得的資源。
    /// - `Failed`：[`Error::PollFailed`]。
    /// - 次數用完：[`Error::PollTimeout`]。
    /// - 狀態倒退：[`Error::StatusRegression`]。
    pub fn wait_for<T, F>(&self, url: &str, predicate: F) -> Result<T>
    where
        T: DeserializeOwned + Pollable,
        F: Fn(&T) -> Progress,
    {
        let mut state = PollState::new(&self.policy);
        let mut last: Option<(u8, String)> = None;

        loop {
            self.cancel.check()?;
            let response = self.session.post_as_get(url)?;
            let resource: T = response.json()?;

            let rank = resource.status_rank();
            if let Some((last_rank, last_label)) = &last {
                if rank < *last_rank {
                    return Err(Error::StatusRegression {
                        url: url.to_string(),
                        from: last_label.clone(),
                        to: resource.status_label().to_string(),
                    });
                }
            }
            last = Some((rank, resource.status_label().to_string()));

            match state.next(&self.policy, &predicate(&resource), response.retry_after()) {
                PollStep::Done => return Ok(resource),
                PollStep::Failed {
                    status,
                    detail,
                    problem,
                } => {
                    return Err(Error::PollFailed {
                        url: url.to_string(),
                        status,
                        detail,
                        problem,
                    })
                }
                PollStep::TimedOut { attempts } => {
                    return Err(Error::PollTimeout {
                        url: url.to_string(),
                        attempts,
                    })
                }
                PollStep::Continue(delay) => {
                    debug!(url, status = resource.status_label(), ?delay, "Resource not settled yet");
                    self.cancel.check()?;
                    self.sleeper.sleep(delay);
                }
            }
        }
    }
}
