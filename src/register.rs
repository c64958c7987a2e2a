//! Wiring the album coalescer into a teloxide dispatcher.
//!
//! [`AlbumRegistration`] builds a `dptree` branch that filters media
//! messages by endpoint and feeds them into the configured coalescer:
//!
//! ```ignore
//! let album_branch = AlbumRegistration::new()
//!     .endpoint(MediaEndpoint::Photo)
//!     .delivery(DeliveryMode::Deadline)
//!     .build(album_handler(|album: Vec<TgAlbumContext>| async move {
//!         // one callback per media group
//!         Ok(())
//!     }))?;
//!
//! let handler = dptree::entry()
//!     .branch(album_branch)
//!     .branch(Update::filter_message().endpoint(other_handler));
//! ```

use std::sync::Arc;
use std::time::Duration;

use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;

use crate::album::{
    AlbumCoalescer, AlbumHandler, DeadlineCoalescer, MediaContext, SingleFlightCoalescer,
};
use crate::config::DeliveryMode;
use crate::constants::ALBUM_DELAY;

/// Error type of the produced dispatcher branch, matching the common
/// teloxide handler signature.
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync + 'static>>;

/// The dispatcher branch type produced by [`AlbumRegistration::build`].
pub type AlbumBranch = UpdateHandler<Box<dyn std::error::Error + Send + Sync + 'static>>;

/// Update kinds an album registration can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaEndpoint {
    Photo,
    Video,
    Document,
    /// Any of the above.
    AnyMedia,
}

impl MediaEndpoint {
    fn matches(self, msg: &Message) -> bool {
        match self {
            Self::Photo => msg.photo().is_some(),
            Self::Video => msg.video().is_some(),
            Self::Document => msg.document().is_some(),
            Self::AnyMedia => {
                msg.photo().is_some() || msg.video().is_some() || msg.document().is_some()
            }
        }
    }

    fn overlaps(self, other: Self) -> bool {
        self == other || self == Self::AnyMedia || other == Self::AnyMedia
    }
}

/// Callback for album deliveries that failed after the per-message callback
/// already returned; the context is the first member of the failed batch.
pub type ErrorReporter = Arc<dyn Fn(anyhow::Error, &TgAlbumContext) + Send + Sync>;

fn log_reporter() -> ErrorReporter {
    Arc::new(|err, ctx| {
        tracing::error!(
            chat = ctx.chat_id(),
            message = ctx.message_id(),
            "album handler failed: {err:#}"
        );
    })
}

/// [`MediaContext`] implementation carrying a teloxide bot and message.
#[derive(Clone)]
pub struct TgAlbumContext {
    bot: Bot,
    msg: Message,
    reporter: ErrorReporter,
}

impl TgAlbumContext {
    pub fn new(bot: Bot, msg: Message, reporter: ErrorReporter) -> Self {
        Self { bot, msg, reporter }
    }

    pub fn bot(&self) -> &Bot {
        &self.bot
    }

    pub fn message(&self) -> &Message {
        &self.msg
    }
}

impl MediaContext for TgAlbumContext {
    fn message_id(&self) -> i32 {
        self.msg.id.0
    }

    fn chat_id(&self) -> i64 {
        self.msg.chat.id.0
    }

    fn album_id(&self) -> Option<&str> {
        self.msg.media_group_id()
    }

    fn report_error(&self, err: anyhow::Error) {
        (self.reporter)(err, self);
    }
}

/// Builder installing an album handler on one or more media update kinds.
///
/// One registration owns its update kinds outright: endpoints within a
/// registration may not overlap, and installing a separate per-message media
/// handler on the same kinds is unsupported (the album handler already
/// receives standalone media as singleton batches).
pub struct AlbumRegistration {
    endpoints: Vec<MediaEndpoint>,
    delivery: DeliveryMode,
    delay: Duration,
    reporter: ErrorReporter,
    middleware: Vec<AlbumBranch>,
}

impl AlbumRegistration {
    pub fn new() -> Self {
        Self {
            endpoints: Vec::new(),
            delivery: DeliveryMode::default(),
            delay: ALBUM_DELAY,
            reporter: log_reporter(),
            middleware: Vec::new(),
        }
    }

    /// Attach to an update kind. May be called multiple times; defaults to
    /// [`MediaEndpoint::AnyMedia`] when never called.
    pub fn endpoint(mut self, endpoint: MediaEndpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn delivery(mut self, mode: DeliveryMode) -> Self {
        self.delivery = mode;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn on_error(mut self, reporter: ErrorReporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// Chain a `dptree` handler in front of the per-message endpoint, the
    /// usual teloxide middleware shape (filters, `inspect`, `map`).
    pub fn middleware(mut self, handler: AlbumBranch) -> Self {
        self.middleware.push(handler);
        self
    }

    /// Build the dispatcher branch feeding matching media updates into the
    /// coalescer. Must run inside a tokio runtime; the single-flight mode
    /// spawns its quiet-period worker here.
    pub fn build(self, handler: AlbumHandler<TgAlbumContext>) -> anyhow::Result<AlbumBranch> {
        let Self {
            endpoints,
            delivery,
            delay,
            reporter,
            middleware,
        } = self;

        let endpoints = if endpoints.is_empty() {
            vec![MediaEndpoint::AnyMedia]
        } else {
            endpoints
        };
        for (i, a) in endpoints.iter().enumerate() {
            for b in &endpoints[i + 1..] {
                if a.overlaps(*b) {
                    anyhow::bail!("album endpoints {a:?} and {b:?} overlap in one registration");
                }
            }
        }

        let coalescer: Arc<dyn AlbumCoalescer<TgAlbumContext>> = match delivery {
            DeliveryMode::Deadline => Arc::new(DeadlineCoalescer::with_delay(handler, delay)),
            DeliveryMode::SingleFlight => {
                Arc::new(SingleFlightCoalescer::with_delay(handler, delay))
            }
        };

        let mut branch = Update::filter_message()
            .filter(move |msg: Message| endpoints.iter().any(|endpoint| endpoint.matches(&msg)));
        for mw in middleware {
            branch = branch.chain(mw);
        }
        Ok(branch.endpoint(move |bot: Bot, msg: Message| {
            let coalescer = coalescer.clone();
            let reporter = reporter.clone();
            async move {
                coalescer.add(TgAlbumContext::new(bot, msg, reporter)).await;
                HandlerResult::Ok(())
            }
        }))
    }
}

impl Default for AlbumRegistration {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::album::album_handler;

    fn noop() -> AlbumHandler<TgAlbumContext> {
        album_handler(|_batch: Vec<TgAlbumContext>| async { Ok(()) })
    }

    #[test]
    fn endpoint_overlap_matrix() {
        use MediaEndpoint::*;
        assert!(Photo.overlaps(Photo));
        assert!(!Photo.overlaps(Video));
        assert!(AnyMedia.overlaps(Photo));
        assert!(Document.overlaps(AnyMedia));
    }

    #[test]
    fn duplicate_endpoints_rejected() {
        let err = match AlbumRegistration::new()
            .endpoint(MediaEndpoint::Photo)
            .endpoint(MediaEndpoint::Photo)
            .build(noop())
        {
            Ok(_) => panic!("expected overlap error"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn any_media_conflicts_with_specific_endpoint() {
        let err = match AlbumRegistration::new()
            .endpoint(MediaEndpoint::AnyMedia)
            .endpoint(MediaEndpoint::Video)
            .build(noop())
        {
            Ok(_) => panic!("expected overlap error"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn default_registration_builds() {
        assert!(AlbumRegistration::new().build(noop()).is_ok());
    }

    #[test]
    fn disjoint_endpoints_build() {
        assert!(AlbumRegistration::new()
            .endpoint(MediaEndpoint::Photo)
            .endpoint(MediaEndpoint::Document)
            .build(noop())
            .is_ok());
    }

    #[test]
    fn middleware_chains_into_branch() {
        let branch = AlbumRegistration::new()
            .middleware(teloxide::dptree::filter(|msg: Message| {
                !msg.chat.is_channel()
            }))
            .build(noop());
        assert!(branch.is_ok());
    }
}
