//! telebatch: the concurrency layer between a teloxide bot and the Telegram
//! API.
//!
//! Two coupled pieces:
//!
//! - [`album`] coalesces the per-message callbacks Telegram delivers for a
//!   media group into one aggregated callback, deterministically ordered by
//!   message id.
//! - [`scheduler`] serializes outbound API calls under Telegram's global
//!   (~30/s) and per-group-chat (~20/min) quotas, releasing callers as
//!   sliding-window capacity frees.
//!
//! [`register`] wires a coalescer into a teloxide dispatch tree, and
//! [`config`] carries the toml knobs for both. Neither core performs any
//! I/O itself; they are in-memory coordinators around opaque callbacks.

pub mod album;
pub mod config;
pub mod constants;
pub mod register;
pub mod scheduler;

pub use album::{
    album_handler, singleton_handler, AlbumCoalescer, AlbumHandler, DeadlineCoalescer,
    MediaContext, SingleFlightCoalescer,
};
pub use config::{AlbumConfig, Config, DeliveryMode, Param, ThrottleConfig, ThrottleProfile};
pub use register::{
    AlbumBranch, AlbumRegistration, ErrorReporter, HandlerResult, MediaEndpoint, TgAlbumContext,
};
pub use scheduler::{
    raw_func, NilScheduler, QuotaLimits, QuotaScheduler, RawFunc, ScheduleError, Scheduler,
};
