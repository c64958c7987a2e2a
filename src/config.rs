use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::constants::{ALBUM_DELAY, API_QUOTA, API_QUOTA_PER_CHAT, DEFAULT_POLLING_RATE};
use crate::scheduler::{NilScheduler, QuotaLimits, QuotaScheduler, Scheduler};

/// Projection of a larger config type onto the section a component needs,
/// so an embedding bot can feed telebatch from its own config struct.
pub trait Param<T> {
    fn param(&self) -> T;
}

impl<T: Clone> Param<T> for T {
    fn param(&self) -> T {
        self.clone()
    }
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub album: AlbumConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
}

impl Config {
    pub fn load_from<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let config_context = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&config_context)?;
        Ok(config)
    }
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct AlbumConfig {
    /// Per-group deadline (deadline mode) or quiet period (single-flight
    /// mode), in milliseconds.
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub delivery: DeliveryMode,
}

impl AlbumConfig {
    pub fn delay(&self) -> Duration {
        self.delay_ms.map(Duration::from_millis).unwrap_or(ALBUM_DELAY)
    }
}

/// How coalesced albums are handed to the aggregate handler.
#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryMode {
    /// A deadline per group, sliding with each new member. Concurrent groups
    /// coalesce independently.
    #[default]
    Deadline,
    /// One group in flight at a time, closed by the next group's first
    /// member or by a quiet period. Groups are delivered in arrival order.
    SingleFlight,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct ThrottleConfig {
    #[serde(default)]
    pub profile: ThrottleProfile,
    pub global_limit: Option<u32>,
    pub chat_limit: Option<u32>,
    pub poll_interval_ms: Option<u64>,
}

#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ThrottleProfile {
    /// Stock Telegram limits.
    #[default]
    Default,
    /// 20% headroom, 10x lazier polling.
    Conservative,
    /// Half the limits, 100x lazier polling, for shared bot tokens.
    ExtraConservative,
    /// No throttling at all.
    None,
}

impl ThrottleConfig {
    /// Materialize the configured scheduler. Explicit knobs override the
    /// profile's presets.
    pub fn build(&self) -> Arc<dyn Scheduler> {
        let mut limits = match self.profile {
            ThrottleProfile::None => return Arc::new(NilScheduler),
            ThrottleProfile::Default => QuotaLimits::default(),
            ThrottleProfile::Conservative => QuotaLimits {
                global_limit: API_QUOTA * 4 / 5,
                chat_limit: API_QUOTA_PER_CHAT * 4 / 5,
                polling_rate: DEFAULT_POLLING_RATE * 10,
                ..QuotaLimits::default()
            },
            ThrottleProfile::ExtraConservative => QuotaLimits {
                global_limit: API_QUOTA / 2,
                chat_limit: API_QUOTA_PER_CHAT / 2,
                polling_rate: DEFAULT_POLLING_RATE * 100,
                ..QuotaLimits::default()
            },
        };
        if let Some(global_limit) = self.global_limit {
            limits.global_limit = global_limit;
        }
        if let Some(chat_limit) = self.chat_limit {
            limits.chat_limit = chat_limit;
        }
        if let Some(poll_ms) = self.poll_interval_ms {
            limits.polling_rate = Duration::from_millis(poll_ms);
        }
        Arc::new(QuotaScheduler::with_limits(limits))
    }
}

impl Param<AlbumConfig> for Config {
    fn param(&self) -> AlbumConfig {
        self.album.clone()
    }
}

impl Param<ThrottleConfig> for Config {
    fn param(&self) -> ThrottleConfig {
        self.throttle.clone()
    }
}
