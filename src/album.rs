//! Album coalescing: turning per-message media-group callbacks into a single
//! aggregated delivery.
//!
//! Telegram dispatches every photo/video/document of a user-sent media group
//! as its own update, out of order and spaced by tens of milliseconds. The
//! coalescers here collect those per-message callbacks under their group key
//! and hand the whole album to one aggregate handler, sorted ascending by
//! message id. Two delivery modes exist behind the [`AlbumCoalescer`] trait;
//! the application picks one at registration time.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use crate::constants::ALBUM_DELAY;

/// The per-message token handed to a coalescer by the update dispatcher.
///
/// Implementations are cheap to clone; the coalescer clones the first member
/// of a batch for error reporting and retains nothing past the handler
/// invocation.
pub trait MediaContext: Clone + Send + Sync + 'static {
    fn message_id(&self) -> i32;
    fn chat_id(&self) -> i64;
    /// Telegram's media-group id; `None` or empty for standalone media.
    fn album_id(&self) -> Option<&str>;
    /// Out-of-band error reporting, the bot's `on_error` equivalent.
    fn report_error(&self, err: anyhow::Error);
}

/// The aggregate handler invoked once per coalesced album.
pub type AlbumHandler<C> =
    Arc<dyn Fn(Vec<C>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap a plain async closure into an [`AlbumHandler`].
pub fn album_handler<C, F, Fut>(f: F) -> AlbumHandler<C>
where
    C: MediaContext,
    F: Fn(Vec<C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |batch| f(batch).boxed())
}

/// Adapt an album handler into a per-message handler that delivers singleton
/// batches, for update kinds that never form albums.
pub fn singleton_handler<C: MediaContext>(
    handler: AlbumHandler<C>,
) -> impl Fn(C) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static {
    move |ctx| handler(vec![ctx])
}

/// Mode-agnostic coalescer capability.
#[async_trait]
pub trait AlbumCoalescer<C: MediaContext>: Send + Sync {
    /// Per-message entry point. Aggregate delivery happens asynchronously;
    /// `add` itself only blocks when the single-flight mode closes a
    /// previous group synchronously.
    async fn add(&self, ctx: C);
}

fn has_album<C: MediaContext>(ctx: &C) -> bool {
    ctx.album_id().is_some_and(|id| !id.is_empty())
}

/// Group key: the album id when present, otherwise a synthetic key unique to
/// the message, so standalone media share the dispatch path as albums of one.
fn group_key<C: MediaContext>(ctx: &C) -> SmolStr {
    match ctx.album_id() {
        Some(id) if !id.is_empty() => SmolStr::new(id),
        _ => SmolStr::new(format!("{}_{}", ctx.chat_id(), ctx.message_id())),
    }
}

/// Sort a finished batch and run the aggregate handler, reporting failures
/// and panics through the first member's reporter.
async fn deliver<C: MediaContext>(handler: AlbumHandler<C>, mut members: Vec<C>) {
    debug_assert!(!members.is_empty());
    members.sort_by_key(|ctx| ctx.message_id());
    let Some(first) = members.first().cloned() else {
        return;
    };

    let result = match tokio::spawn(handler(members)).await {
        Ok(result) => result,
        Err(err) if err.is_panic() => Err(anyhow::anyhow!("album handler panicked: {err}")),
        // Runtime shutdown; nothing left to report to.
        Err(_) => return,
    };
    if let Err(err) = result {
        first.report_error(err);
    }
}

struct PendingAlbum<C> {
    members: Vec<C>,
    pending_timers: usize,
}

/// Mode A: deadline-per-group coalescing.
///
/// Every arriving member schedules one more timer; the timer that brings the
/// pending count to zero closes the group. The deadline therefore slides
/// forward while stragglers keep arriving. A fixed deadline from the first
/// member would race against Telegram's out-of-order delivery.
///
/// Standalone media cannot gain further members and skip the wait entirely.
pub struct DeadlineCoalescer<C: MediaContext> {
    inner: Arc<DeadlineInner<C>>,
}

impl<C: MediaContext> Clone for DeadlineCoalescer<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct DeadlineInner<C> {
    handler: AlbumHandler<C>,
    delay: Duration,
    albums: Mutex<HashMap<SmolStr, PendingAlbum<C>>>,
}

impl<C: MediaContext> DeadlineCoalescer<C> {
    pub fn new(handler: AlbumHandler<C>) -> Self {
        Self::with_delay(handler, ALBUM_DELAY)
    }

    pub fn with_delay(handler: AlbumHandler<C>, delay: Duration) -> Self {
        Self {
            inner: Arc::new(DeadlineInner {
                handler,
                delay,
                albums: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Number of albums currently waiting on their deadline.
    pub fn pending(&self) -> usize {
        self.inner.albums.lock().len()
    }

    fn register(&self, ctx: C) {
        let key = group_key(&ctx);
        let delay = if has_album(&ctx) {
            self.inner.delay
        } else {
            Duration::ZERO
        };

        {
            let mut albums = self.inner.albums.lock();
            let entry = albums.entry(key.clone()).or_insert_with(|| PendingAlbum {
                members: Vec::new(),
                pending_timers: 0,
            });
            entry.members.push(ctx);
            entry.pending_timers += 1;
            tracing::trace!(key = %key, size = entry.members.len(), "album member queued");
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let batch = {
                let mut albums = inner.albums.lock();
                let Some(entry) = albums.get_mut(&key) else {
                    return;
                };
                entry.pending_timers -= 1;
                let last_timer = entry.pending_timers == 0;
                if last_timer {
                    albums.remove(&key).map(|entry| entry.members)
                } else {
                    // A later member re-armed the deadline.
                    None
                }
            };
            if let Some(members) = batch {
                deliver(inner.handler.clone(), members).await;
            }
        });
    }
}

#[async_trait]
impl<C: MediaContext> AlbumCoalescer<C> for DeadlineCoalescer<C> {
    async fn add(&self, ctx: C) {
        self.register(ctx);
    }
}

struct CurrentGroup<C> {
    key: SmolStr,
    members: Vec<C>,
    deadline: Instant,
}

/// Mode B: single-flight coalescing.
///
/// Exactly one group accumulates at a time. A member for a different key
/// closes and delivers the current group before the new one starts, so
/// groups go out in the order their first member arrived and never overlap.
/// A background worker closes the current group once no member has arrived
/// for the configured quiet period; the quiet wait is re-armed on every
/// `add`, including the one that turns an empty table non-empty.
pub struct SingleFlightCoalescer<C: MediaContext> {
    inner: Arc<FlightInner<C>>,
    // Keeps the worker alive; dropping the last handle stops it.
    _drop: Arc<oneshot::Receiver<()>>,
}

impl<C: MediaContext> Clone for SingleFlightCoalescer<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _drop: self._drop.clone(),
        }
    }
}

struct FlightInner<C> {
    handler: AlbumHandler<C>,
    delay: Duration,
    state: Mutex<Option<CurrentGroup<C>>>,
    wake: Notify,
}

impl<C: MediaContext> SingleFlightCoalescer<C> {
    /// Must be called from within a tokio runtime: the quiet-period worker
    /// is spawned here.
    pub fn new(handler: AlbumHandler<C>) -> Self {
        Self::with_delay(handler, ALBUM_DELAY)
    }

    pub fn with_delay(handler: AlbumHandler<C>, delay: Duration) -> Self {
        let inner = Arc::new(FlightInner {
            handler,
            delay,
            state: Mutex::new(None),
            wake: Notify::new(),
        });

        let (drop_tx, drop_rx) = oneshot::channel::<()>();
        tokio::spawn(Self::worker(inner.clone(), drop_tx));

        Self {
            inner,
            _drop: Arc::new(drop_rx),
        }
    }

    async fn worker(inner: Arc<FlightInner<C>>, mut drop_tx: oneshot::Sender<()>) {
        tokio::pin! {
            let stopped = drop_tx.closed();
        }
        loop {
            let deadline = inner.state.lock().as_ref().map(|group| group.deadline);
            match deadline {
                None => {
                    tokio::select! {
                        _ = &mut stopped => break,
                        _ = inner.wake.notified() => {}
                    }
                }
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut stopped => break,
                        // Another add moved the deadline; recompute it.
                        _ = inner.wake.notified() => {}
                        _ = tokio::time::sleep_until(deadline) => {
                            let batch = {
                                let mut state = inner.state.lock();
                                let due = state
                                    .as_ref()
                                    .is_some_and(|group| group.deadline <= Instant::now());
                                if due {
                                    state.take().map(|group| group.members)
                                } else {
                                    None
                                }
                            };
                            if let Some(members) = batch {
                                deliver(inner.handler.clone(), members).await;
                            }
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl<C: MediaContext> AlbumCoalescer<C> for SingleFlightCoalescer<C> {
    async fn add(&self, ctx: C) {
        let key = group_key(&ctx);
        let deadline = Instant::now() + self.inner.delay;

        let previous = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                Some(group) if group.key == key => {
                    group.members.push(ctx);
                    group.deadline = deadline;
                    None
                }
                // A new group begins: the previous one is complete.
                current => current.replace(CurrentGroup {
                    key,
                    members: vec![ctx],
                    deadline,
                }),
            }
        };
        self.inner.wake.notify_one();

        if let Some(group) = previous {
            deliver(self.inner.handler.clone(), group.members).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::time::sleep;

    use super::*;

    #[derive(Clone)]
    struct TestContext {
        message_id: i32,
        chat_id: i64,
        album_id: Option<&'static str>,
        errors: Arc<Mutex<Vec<String>>>,
    }

    impl MediaContext for TestContext {
        fn message_id(&self) -> i32 {
            self.message_id
        }
        fn chat_id(&self) -> i64 {
            self.chat_id
        }
        fn album_id(&self) -> Option<&str> {
            self.album_id
        }
        fn report_error(&self, err: anyhow::Error) {
            self.errors.lock().push(format!("{err:#}"));
        }
    }

    type Errors = Arc<Mutex<Vec<String>>>;
    type Deliveries = Arc<Mutex<Vec<Vec<i32>>>>;

    fn ctx(message_id: i32, album: Option<&'static str>, errors: &Errors) -> TestContext {
        TestContext {
            message_id,
            chat_id: 42,
            album_id: album,
            errors: errors.clone(),
        }
    }

    fn recording_handler(deliveries: &Deliveries) -> AlbumHandler<TestContext> {
        let deliveries = deliveries.clone();
        album_handler(move |batch: Vec<TestContext>| {
            let deliveries = deliveries.clone();
            async move {
                deliveries
                    .lock()
                    .push(batch.iter().map(|ctx| ctx.message_id()).collect());
                Ok(())
            }
        })
    }

    #[test]
    fn group_key_falls_back_to_chat_and_message() {
        let errors = Errors::default();
        assert_eq!(group_key(&ctx(7, Some("album-1"), &errors)), "album-1");
        assert_eq!(group_key(&ctx(7, Some(""), &errors)), "42_7");
        assert_eq!(group_key(&ctx(7, None, &errors)), "42_7");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_slides_with_stragglers() {
        let deliveries = Deliveries::default();
        let errors = Errors::default();
        let coalescer = DeadlineCoalescer::with_delay(
            recording_handler(&deliveries),
            Duration::from_millis(100),
        );

        coalescer.add(ctx(7, Some("A"), &errors)).await;
        sleep(Duration::from_millis(30)).await;
        coalescer.add(ctx(5, Some("A"), &errors)).await;
        sleep(Duration::from_millis(30)).await;
        coalescer.add(ctx(9, Some("A"), &errors)).await;

        // The deadline runs from the last member, not the first.
        sleep(Duration::from_millis(90)).await;
        assert!(deliveries.lock().is_empty());
        sleep(Duration::from_millis(20)).await;
        assert_eq!(*deliveries.lock(), vec![vec![5, 7, 9]]);
        assert_eq!(coalescer.pending(), 0);
        assert!(errors.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn standalone_media_delivered_without_delay() {
        let deliveries = Deliveries::default();
        let errors = Errors::default();
        let coalescer = DeadlineCoalescer::with_delay(
            recording_handler(&deliveries),
            Duration::from_millis(100),
        );

        coalescer.add(ctx(1, None, &errors)).await;
        sleep(Duration::from_millis(1)).await;
        assert_eq!(*deliveries.lock(), vec![vec![1]]);
        assert_eq!(coalescer.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_albums_do_not_mix() {
        let deliveries = Deliveries::default();
        let errors = Errors::default();
        let coalescer = DeadlineCoalescer::with_delay(
            recording_handler(&deliveries),
            Duration::from_millis(50),
        );

        coalescer.add(ctx(1, Some("A"), &errors)).await;
        coalescer.add(ctx(10, Some("B"), &errors)).await;
        coalescer.add(ctx(2, Some("A"), &errors)).await;
        coalescer.add(ctx(11, Some("B"), &errors)).await;

        sleep(Duration::from_millis(60)).await;
        let mut got = deliveries.lock().clone();
        got.sort();
        assert_eq!(got, vec![vec![1, 2], vec![10, 11]]);
        assert_eq!(coalescer.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_arrival_opens_a_fresh_batch() {
        let deliveries = Deliveries::default();
        let errors = Errors::default();
        let coalescer = DeadlineCoalescer::with_delay(
            recording_handler(&deliveries),
            Duration::from_millis(50),
        );

        coalescer.add(ctx(1, Some("A"), &errors)).await;
        sleep(Duration::from_millis(60)).await;
        assert_eq!(*deliveries.lock(), vec![vec![1]]);

        // Pathologically late member of "A": a new singleton batch, not a drop.
        coalescer.add(ctx(2, Some("A"), &errors)).await;
        sleep(Duration::from_millis(60)).await;
        assert_eq!(*deliveries.lock(), vec![vec![1], vec![2]]);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_handler_reports_through_first_member() {
        let errors = Errors::default();
        let handler = album_handler(|_batch: Vec<TestContext>| async {
            Err(anyhow::anyhow!("flaky downstream"))
        });
        let coalescer = DeadlineCoalescer::with_delay(handler, Duration::from_millis(50));

        coalescer.add(ctx(3, Some("A"), &errors)).await;
        coalescer.add(ctx(1, Some("A"), &errors)).await;
        sleep(Duration::from_millis(60)).await;

        assert_eq!(errors.lock().len(), 1);
        assert!(errors.lock()[0].contains("flaky downstream"));
        assert_eq!(coalescer.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_handler_reported_and_cleaned_up() {
        let deliveries = Deliveries::default();
        let errors = Errors::default();
        let handler = {
            let deliveries = deliveries.clone();
            album_handler(move |batch: Vec<TestContext>| {
                let deliveries = deliveries.clone();
                async move {
                    if batch[0].album_id() == Some("X") {
                        panic!("album X is cursed");
                    }
                    deliveries
                        .lock()
                        .push(batch.iter().map(|ctx| ctx.message_id()).collect());
                    Ok(())
                }
            })
        };
        let coalescer = DeadlineCoalescer::with_delay(handler, Duration::from_millis(50));

        coalescer.add(ctx(2, Some("X"), &errors)).await;
        coalescer.add(ctx(1, Some("X"), &errors)).await;
        sleep(Duration::from_millis(60)).await;
        assert_eq!(errors.lock().len(), 1);
        assert!(errors.lock()[0].contains("panicked"));
        assert_eq!(coalescer.pending(), 0);

        // The failure is contained; the next album flows normally.
        coalescer.add(ctx(3, Some("Y"), &errors)).await;
        sleep(Duration::from_millis(60)).await;
        assert_eq!(*deliveries.lock(), vec![vec![3]]);
        assert_eq!(errors.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn single_flight_closes_previous_group_on_new_key() {
        let deliveries = Deliveries::default();
        let errors = Errors::default();
        let coalescer = SingleFlightCoalescer::with_delay(
            recording_handler(&deliveries),
            Duration::from_millis(250),
        );

        coalescer.add(ctx(1, Some("A"), &errors)).await;
        sleep(Duration::from_millis(50)).await;
        coalescer.add(ctx(2, Some("A"), &errors)).await;
        sleep(Duration::from_millis(70)).await;

        // The first member of "B" closes "A" synchronously.
        coalescer.add(ctx(3, Some("B"), &errors)).await;
        assert_eq!(*deliveries.lock(), vec![vec![1, 2]]);

        // "B" itself goes out after a quiet period.
        sleep(Duration::from_millis(260)).await;
        assert_eq!(*deliveries.lock(), vec![vec![1, 2], vec![3]]);
    }

    #[tokio::test(start_paused = true)]
    async fn single_flight_quiet_period_rearms_on_every_add() {
        let deliveries = Deliveries::default();
        let errors = Errors::default();
        let coalescer = SingleFlightCoalescer::with_delay(
            recording_handler(&deliveries),
            Duration::from_millis(100),
        );

        coalescer.add(ctx(1, Some("A"), &errors)).await;
        sleep(Duration::from_millis(60)).await;
        coalescer.add(ctx(2, Some("A"), &errors)).await;

        sleep(Duration::from_millis(60)).await;
        assert!(deliveries.lock().is_empty());
        sleep(Duration::from_millis(50)).await;
        assert_eq!(*deliveries.lock(), vec![vec![1, 2]]);
    }

    #[tokio::test(start_paused = true)]
    async fn single_flight_successive_groups_in_arrival_order() {
        let deliveries = Deliveries::default();
        let errors = Errors::default();
        let coalescer = SingleFlightCoalescer::with_delay(
            recording_handler(&deliveries),
            Duration::from_millis(100),
        );

        coalescer.add(ctx(1, Some("A"), &errors)).await;
        sleep(Duration::from_millis(150)).await;
        coalescer.add(ctx(2, Some("B"), &errors)).await;
        sleep(Duration::from_millis(150)).await;

        assert_eq!(*deliveries.lock(), vec![vec![1], vec![2]]);
    }

    #[tokio::test(start_paused = true)]
    async fn single_flight_survives_handler_panic() {
        let deliveries = Deliveries::default();
        let errors = Errors::default();
        let handler = {
            let deliveries = deliveries.clone();
            album_handler(move |batch: Vec<TestContext>| {
                let deliveries = deliveries.clone();
                async move {
                    if batch[0].album_id() == Some("X") {
                        panic!("album X is cursed");
                    }
                    deliveries
                        .lock()
                        .push(batch.iter().map(|ctx| ctx.message_id()).collect());
                    Ok(())
                }
            })
        };
        let coalescer = SingleFlightCoalescer::with_delay(handler, Duration::from_millis(50));

        coalescer.add(ctx(1, Some("X"), &errors)).await;
        sleep(Duration::from_millis(60)).await;
        assert_eq!(errors.lock().len(), 1);

        coalescer.add(ctx(2, Some("Y"), &errors)).await;
        sleep(Duration::from_millis(60)).await;
        assert_eq!(*deliveries.lock(), vec![vec![2]]);
    }
}
