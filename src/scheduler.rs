//! Outbound API call scheduling under Telegram's published quotas.
//!
//! Telegram admits roughly 30 requests per second globally and 20 messages
//! per minute per group chat. [`QuotaScheduler`] keeps both as true sliding
//! windows: every admission records expiry events, and the capacity frees
//! exactly one window after each charge. A fixed-window counter reset is not
//! equivalent, it bursts to twice the limit across a reset boundary.
//!
//! Callers poll for admission on a ticker. The request future runs while the
//! state lock is held, so concurrent callers cannot pass the admission check
//! together and overshoot a window.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use smol_str::SmolStr;
use tokio::sync::Mutex;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::constants::{
    API_QUOTA, API_QUOTA_PER_CHAT, API_QUOTA_PER_CHAT_WINDOW, API_QUOTA_WINDOW,
    DEFAULT_POLLING_RATE,
};

/// An opaque unit of outbound work: one API request, producing the raw
/// response body.
pub type RawFunc = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<Bytes>> + Send>;

/// Box a plain async closure into a [`RawFunc`].
pub fn raw_func<F, Fut>(f: F) -> RawFunc
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
{
    Box::new(move || f().boxed())
}

/// Errors produced by a [`Scheduler`].
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// The caller cancelled before the request was admitted. The request was
    /// never executed and no quota was spent.
    #[error("request cancelled while waiting for quota")]
    Cancelled,
    /// The dispatched request itself failed. The quota was spent regardless:
    /// the request went out on the wire.
    #[error(transparent)]
    Dispatch(#[from] anyhow::Error),
}

/// Gatekeeper for outbound API calls.
///
/// Implementations decide when a request may run; [`QuotaScheduler`] enforces
/// Telegram's quotas, [`NilScheduler`] is a pass-through for callers that do
/// their own pacing.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Block until `count` units fit into every applicable quota window for
    /// `chat`, then run `f` exactly once and return its result.
    ///
    /// `chat` is the destination chat id in decimal; a non-negative id is a
    /// personal chat and only the global window applies. An empty string
    /// also skips per-chat accounting.
    async fn sync_func(&self, count: u32, chat: &str, f: RawFunc) -> Result<Bytes, ScheduleError>;

    /// Like [`Scheduler::sync_func`], but aborts with
    /// [`ScheduleError::Cancelled`] if `cancel` fires before admission.
    /// Cancellation never executes `f` and never mutates quota accounting.
    async fn sync_func_cancellable(
        &self,
        count: u32,
        chat: &str,
        f: RawFunc,
        cancel: CancellationToken,
    ) -> Result<Bytes, ScheduleError>;
}

/// All tuning knobs of a [`QuotaScheduler`].
#[derive(Debug, Clone, Copy)]
pub struct QuotaLimits {
    pub global_limit: u32,
    pub global_window: Duration,
    pub chat_limit: u32,
    pub chat_window: Duration,
    pub polling_rate: Duration,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            global_limit: API_QUOTA,
            global_window: API_QUOTA_WINDOW,
            chat_limit: API_QUOTA_PER_CHAT,
            chat_window: API_QUOTA_PER_CHAT_WINDOW,
            polling_rate: DEFAULT_POLLING_RATE,
        }
    }
}

/// Dual sliding-window rate limiter for the Telegram API.
pub struct QuotaScheduler {
    limits: QuotaLimits,
    state: Mutex<QuotaState>,
}

impl QuotaScheduler {
    /// Stock Telegram limits: 30/second globally, 20/minute per group chat.
    pub fn new() -> Self {
        Self::with_limits(QuotaLimits::default())
    }

    /// 20% headroom against the stock limits, for when something else also
    /// talks to the same bot token.
    pub fn conservative() -> Self {
        Self::custom(
            API_QUOTA * 4 / 5,
            API_QUOTA_PER_CHAT * 4 / 5,
            DEFAULT_POLLING_RATE * 10,
        )
    }

    /// Half the stock limits with a lazy polling loop, for multi-instance
    /// deployments sharing a token.
    pub fn extra_conservative() -> Self {
        Self::custom(
            API_QUOTA / 2,
            API_QUOTA_PER_CHAT / 2,
            DEFAULT_POLLING_RATE * 100,
        )
    }

    /// Custom limits over the stock windows.
    pub fn custom(global_limit: u32, chat_limit: u32, polling_rate: Duration) -> Self {
        Self::with_limits(QuotaLimits {
            global_limit,
            chat_limit,
            polling_rate,
            ..QuotaLimits::default()
        })
    }

    pub fn with_limits(limits: QuotaLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(QuotaState::default()),
        }
    }

    async fn run(
        &self,
        count: u32,
        chat: &str,
        f: RawFunc,
        cancel: CancellationToken,
    ) -> Result<Bytes, ScheduleError> {
        let mut ticker = interval(self.limits.polling_rate);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ScheduleError::Cancelled),
                _ = ticker.tick() => {}
            }

            let mut state = self.state.lock().await;
            state.expire(Instant::now());
            if !state.ready(count, chat, &self.limits) {
                tracing::trace!(count, chat, global_used = state.global_used, "quota not ready");
                continue;
            }

            // The lock stays held across the dispatch: capacity is charged
            // atomically with execution, so no two callers can pass the
            // admission check for the same capacity.
            let ret = f().await;
            state.charge(count, chat, &self.limits);
            return ret.map_err(ScheduleError::Dispatch);
        }
    }
}

impl Default for QuotaScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scheduler for QuotaScheduler {
    async fn sync_func(&self, count: u32, chat: &str, f: RawFunc) -> Result<Bytes, ScheduleError> {
        self.run(count, chat, f, CancellationToken::new()).await
    }

    async fn sync_func_cancellable(
        &self,
        count: u32,
        chat: &str,
        f: RawFunc,
        cancel: CancellationToken,
    ) -> Result<Bytes, ScheduleError> {
        self.run(count, chat, f, cancel).await
    }
}

/// Pass-through scheduler: requests run immediately with no accounting.
pub struct NilScheduler;

#[async_trait]
impl Scheduler for NilScheduler {
    async fn sync_func(&self, _count: u32, _chat: &str, f: RawFunc) -> Result<Bytes, ScheduleError> {
        f().await.map_err(ScheduleError::Dispatch)
    }

    async fn sync_func_cancellable(
        &self,
        _count: u32,
        _chat: &str,
        f: RawFunc,
        cancel: CancellationToken,
    ) -> Result<Bytes, ScheduleError> {
        if cancel.is_cancelled() {
            return Err(ScheduleError::Cancelled);
        }
        f().await.map_err(ScheduleError::Dispatch)
    }
}

/// One charged unit of quota, due to be released at `expires_at`.
struct QuotaEvent {
    expires_at: Instant,
    count: u32,
    /// Empty for global-window events, the chat id for per-chat events.
    chat: SmolStr,
}

#[derive(Default)]
struct QuotaState {
    global_used: u32,
    per_chat_used: HashMap<SmolStr, u32>,
    // Sorted by expires_at ascending, so expiration is a prefix scan.
    events: Vec<QuotaEvent>,
}

impl QuotaState {
    fn ready(&self, count: u32, chat: &str, limits: &QuotaLimits) -> bool {
        if self.global_used + count > limits.global_limit {
            return false;
        }
        // Only chats with a live entry are checked; an oversized count is
        // admitted into an empty window rather than blocking forever.
        if let Some(&used) = self.per_chat_used.get(chat) {
            if used + count > limits.chat_limit {
                return false;
            }
        }
        true
    }

    fn charge(&mut self, count: u32, chat: &str, limits: &QuotaLimits) {
        let now = Instant::now();

        self.global_used += count;
        self.events.push(QuotaEvent {
            expires_at: now + limits.global_window,
            count,
            chat: SmolStr::default(),
        });

        if is_throttled_chat(chat) {
            *self.per_chat_used.entry(SmolStr::new(chat)).or_insert(0) += count;
            self.events.push(QuotaEvent {
                expires_at: now + limits.chat_window,
                count,
                chat: SmolStr::new(chat),
            });
        }

        self.events.sort_by_key(|ev| ev.expires_at);
    }

    fn expire(&mut self, now: Instant) {
        let mut handled = 0;
        for ev in &self.events {
            if ev.expires_at > now {
                break;
            }
            handled += 1;

            if ev.chat.is_empty() {
                self.global_used = self.global_used.saturating_sub(ev.count);
                continue;
            }
            if let Some(used) = self.per_chat_used.get_mut(&ev.chat) {
                *used = used.saturating_sub(ev.count);
                if *used == 0 {
                    self.per_chat_used.remove(&ev.chat);
                }
            }
        }
        self.events.drain(..handled);
    }
}

/// A chat id parseable as a non-negative integer denotes a personal chat;
/// Telegram group chats carry negative ids. Non-parseable, non-empty ids are
/// treated as groups.
fn is_personal(chat: &str) -> bool {
    chat.parse::<i64>().map_or(false, |id| id >= 0)
}

/// Whether `chat` is subject to the per-chat window.
fn is_throttled_chat(chat: &str) -> bool {
    !chat.is_empty() && !is_personal(chat)
}
