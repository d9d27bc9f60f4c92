use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use http::Version;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, trace};

use super::connect::Target;
use crate::common::exec::Exec;

pub(super) struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

// Before using a pooled connection, make sure the sender is not dead.
//
// This is a trait to allow the `client::pool::tests` to work without
// real connections.
pub(super) trait Poolable: Unpin + Send + Sized + 'static {
    fn is_open(&self) -> bool;
    /// Reserve this connection.
    ///
    /// Allows for HTTP/2 to return a shared reservation.
    fn reserve(self) -> Reservation<Self>;
    fn can_share(&self) -> bool;
}

/// When checking out a pooled connection, it might be that the connection
/// only supports a single reservation, or it might be usable for many.
///
/// Specifically, HTTP/1 requires a unique reservation, but HTTP/2 can be
/// used for multiple requests.
pub(super) enum Reservation<T> {
    /// This connection could be used multiple times, the first one will be
    /// reinserted into the `idle` pool, and the second will be given to
    /// the `Checkout`.
    Shared(T, T),
    /// This connection requires unique access. It will be returned after
    /// use is complete.
    Unique(T),
}

#[derive(Clone, Copy, Debug)]
pub(super) struct Config {
    pub(super) idle_timeout: Option<Duration>,
    pub(super) max_per_target: usize,
    pub(super) max_streams: usize,
}

/// Lifecycle state of a pooled connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// The transport or protocol handshake is still in progress.
    Connecting,
    /// Open, with no request in flight.
    Idle,
    /// Serving at least one request.
    InUse,
    /// Evicted, but streams that were already running may still finish.
    Draining,
    /// Gone for good.
    Closed,
}

impl ConnState {
    fn from_u8(n: u8) -> ConnState {
        match n {
            0 => ConnState::Connecting,
            1 => ConnState::Idle,
            2 => ConnState::InUse,
            3 => ConnState::Draining,
            _ => ConnState::Closed,
        }
    }
}

/// A snapshot of a connection's bookkeeping.
///
/// Successful responses carry one in their extensions, describing the
/// connection (and, for HTTP/2, the stream) that served them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    id: u64,
    version: Option<Version>,
    state: ConnState,
    active_streams: usize,
    stream_id: Option<u32>,
}

impl ConnectionInfo {
    /// Identifies the connection for the lifetime of the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The negotiated protocol, or `None` while still connecting.
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    /// The state when the snapshot was taken.
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Requests in flight when the snapshot was taken.
    pub fn active_streams(&self) -> usize {
        self.active_streams
    }

    /// The HTTP/2 stream that carried the exchange, if any.
    pub fn stream_id(&self) -> Option<u32> {
        self.stream_id
    }

    pub(super) fn with_stream_id(mut self, stream_id: Option<u32>) -> ConnectionInfo {
        self.stream_id = stream_id;
        self
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

const VERSION_UNKNOWN: u8 = 0;
const VERSION_H1: u8 = 1;
const VERSION_H2: u8 = 2;

struct Meta {
    id: u64,
    version: AtomicU8,
    state: AtomicU8,
    streams: AtomicUsize,
}

impl Meta {
    fn new() -> Arc<Meta> {
        Arc::new(Meta {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            version: AtomicU8::new(VERSION_UNKNOWN),
            state: AtomicU8::new(ConnState::Connecting as u8),
            streams: AtomicUsize::new(0),
        })
    }

    fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnState) {
        trace!("connection {} is now {:?}", self.id, state);
        self.state.store(state as u8, Ordering::Release);
    }

    fn set_version(&self, version: Version) {
        let n = if version == Version::HTTP_2 {
            VERSION_H2
        } else {
            VERSION_H1
        };
        self.version.store(n, Ordering::Release);
    }

    fn streams(&self) -> usize {
        self.streams.load(Ordering::Acquire)
    }

    fn info(&self) -> ConnectionInfo {
        let version = match self.version.load(Ordering::Acquire) {
            VERSION_H1 => Some(Version::HTTP_11),
            VERSION_H2 => Some(Version::HTTP_2),
            _ => None,
        };
        ConnectionInfo {
            id: self.id,
            version,
            state: self.state(),
            active_streams: self.streams(),
            stream_id: None,
        }
    }
}

struct PoolInner<T> {
    config: Config,
    entries: Mutex<HashMap<Target, Arc<Entry<T>>>>,
    exec: Exec,
    idle_interval_started: AtomicBool,
}

/// Everything the pool knows about one target.
struct Entry<T> {
    list: Mutex<List<T>>,
    // One permit per connection, live or connecting.
    slots: Arc<Semaphore>,
    // Woken whenever a connection becomes available again.
    released: Notify,
    // Set while a connection that may turn out to be HTTP/2 is opening.
    connecting: AtomicBool,
}

struct List<T> {
    idle: Vec<Idle<T>>,
    live: HashMap<u64, Arc<Meta>>,
}

struct Idle<T> {
    idle_at: Instant,
    slot: Slot<T>,
}

struct Slot<T> {
    value: T,
    meta: Arc<Meta>,
    permit: Arc<OwnedSemaphorePermit>,
}

/// The result of [`Pool::acquire`].
pub(super) enum Acquired<T: Poolable> {
    /// An open connection was found.
    Reused(Pooled<T>),
    /// Nothing usable is pooled, but the caller may open a new connection.
    Connect(Ticket<T>),
}

impl<T> Pool<T> {
    pub(super) fn new(config: Config, exec: Exec) -> Pool<T> {
        Pool {
            inner: Arc::new(PoolInner {
                config,
                entries: Mutex::new(HashMap::new()),
                exec,
                idle_interval_started: AtomicBool::new(false),
            }),
        }
    }
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Pool<T> {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Poolable> Pool<T> {
    /// Returns a connection for `target`.
    ///
    /// Prefers an idle connection (or a shared HTTP/2 one with free stream
    /// capacity). Otherwise, if the target is below its connection limit,
    /// returns a `Ticket` that reserves room for a new connection. If it is
    /// at the limit, waits until a connection is released or closed.
    ///
    /// When `may_share` is set the new connection might negotiate HTTP/2,
    /// so only one caller at a time connects and the rest wait to multiplex
    /// on what it opens.
    pub(super) async fn acquire(&self, target: &Target, may_share: bool) -> crate::Result<Acquired<T>> {
        let entry = self.inner.entry(target);
        loop {
            let released = entry.released.notified();
            tokio::pin!(released);
            // Register before looking, so a release in between isn't missed.
            released.as_mut().enable();

            if let Some(pooled) = self.inner.checkout(target, &entry) {
                return Ok(Acquired::Reused(pooled));
            }

            let wait_for_connect = may_share && entry.connecting.load(Ordering::Acquire);
            if wait_for_connect {
                trace!("waiting on a connection in progress to {}", target);
            }

            tokio::select! {
                biased;
                _ = &mut released => {
                    trace!("connection released for {}, checking again", target);
                }
                permit = entry.slots.clone().acquire_owned(), if !wait_for_connect => {
                    let permit = permit.map_err(|_| crate::Error::new_closed())?;
                    if may_share && entry.connecting.swap(true, Ordering::AcqRel) {
                        // someone else started connecting meanwhile
                        drop(permit);
                        continue;
                    }
                    let meta = Meta::new();
                    entry.list().live.insert(meta.id, meta.clone());
                    trace!("connection {} to {} may connect", meta.id, target);
                    return Ok(Acquired::Connect(Ticket {
                        target: target.clone(),
                        meta,
                        permit: Some(permit),
                        connecting: may_share,
                        entry: entry.clone(),
                    }));
                }
            }
        }
    }

    /// Turns a freshly connected value into a pooled one.
    pub(super) fn pooled(&self, mut ticket: Ticket<T>, value: T, version: Version) -> Pooled<T> {
        let permit = match ticket.permit.take() {
            Some(permit) => Arc::new(permit),
            None => unreachable!("ticket used twice"),
        };
        let meta = ticket.meta.clone();
        let entry = ticket.entry.clone();
        meta.set_version(version);
        meta.streams.fetch_add(1, Ordering::AcqRel);
        meta.set_state(ConnState::InUse);

        let mut shared = false;
        let value = if value.can_share() {
            match value.reserve() {
                Reservation::Shared(to_insert, to_return) => {
                    shared = true;
                    entry.list().idle.push(Idle {
                        idle_at: Instant::now(),
                        slot: Slot {
                            value: to_insert,
                            meta: meta.clone(),
                            permit: permit.clone(),
                        },
                    });
                    to_return
                }
                Reservation::Unique(value) => value,
            }
        } else {
            value
        };
        let was_connecting = std::mem::replace(&mut ticket.connecting, false);
        if was_connecting {
            entry.connecting.store(false, Ordering::Release);
        }
        if shared || was_connecting {
            // Others waiting on this target may multiplex on it, or connect
            // themselves if it turned out to be HTTP/1.1.
            entry.released.notify_waiters();
        }

        debug!("connection {} to {} established ({:?})", meta.id, ticket.target, version);
        self.spawn_idle_interval();

        Pooled {
            slot: Some(Slot {
                value,
                meta,
                permit,
            }),
            is_reused: false,
            healthy: true,
            entry,
        }
    }

    /// Snapshots of the idle connections for `target`.
    pub(super) fn idle(&self, target: &Target) -> Vec<ConnectionInfo> {
        match self.inner.existing(target) {
            Some(entry) => entry
                .list()
                .idle
                .iter()
                .map(|idle| idle.slot.meta.info())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Snapshots of every connection for `target` that isn't closed.
    pub(super) fn connections(&self, target: &Target) -> Vec<ConnectionInfo> {
        match self.inner.existing(target) {
            Some(entry) => {
                let mut infos = entry
                    .list()
                    .live
                    .values()
                    .map(|meta| meta.info())
                    .collect::<Vec<_>>();
                infos.sort_by_key(|info| info.id);
                infos
            }
            None => Vec::new(),
        }
    }

    fn spawn_idle_interval(&self) {
        let dur = match self.inner.config.idle_timeout {
            Some(dur) => dur,
            None => return,
        };
        if self.inner.idle_interval_started.swap(true, Ordering::AcqRel) {
            return;
        }
        // Checking more often than this would mostly find nothing.
        let period = std::cmp::max(dur, Duration::from_millis(90));
        let pool = Arc::downgrade(&self.inner);
        self.inner.exec.execute(idle_interval(pool, period));
    }
}

async fn idle_interval<T: Poolable>(pool: Weak<PoolInner<T>>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    // the first tick completes immediately
    interval.tick().await;
    loop {
        interval.tick().await;
        match pool.upgrade() {
            Some(inner) => inner.clear_expired(),
            None => {
                trace!("pool dropped, idle interval stopping");
                return;
            }
        }
    }
}

impl<T: Poolable> PoolInner<T> {
    fn entries(&self) -> MutexGuard<'_, HashMap<Target, Arc<Entry<T>>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn entry(&self, target: &Target) -> Arc<Entry<T>> {
        let max = self.config.max_per_target;
        self.entries()
            .entry(target.clone())
            .or_insert_with(|| Arc::new(Entry::new(max)))
            .clone()
    }

    fn existing(&self, target: &Target) -> Option<Arc<Entry<T>>> {
        self.entries().get(target).cloned()
    }

    fn is_expired(&self, idle: &Idle<T>, now: Instant) -> bool {
        match self.config.idle_timeout {
            Some(timeout) => {
                idle.slot.meta.streams() == 0 && now.saturating_duration_since(idle.idle_at) > timeout
            }
            None => false,
        }
    }

    fn checkout(&self, target: &Target, entry: &Arc<Entry<T>>) -> Option<Pooled<T>> {
        let now = Instant::now();
        let mut list = entry.list();
        // Most recently released first.
        let mut i = list.idle.len();
        while i > 0 {
            i -= 1;
            let expired = self.is_expired(&list.idle[i], now);
            if expired || !list.idle[i].slot.value.is_open() {
                let idle = list.idle.remove(i);
                trace!(
                    "removing {} connection {} for {}",
                    if expired { "expired" } else { "closed" },
                    idle.slot.meta.id,
                    target
                );
                list.retire(&idle.slot.meta);
                continue;
            }

            if list.idle[i].slot.value.can_share() {
                if list.idle[i].slot.meta.streams() >= self.config.max_streams {
                    continue;
                }
                let Idle { idle_at, slot } = list.idle.remove(i);
                let Slot {
                    value,
                    meta,
                    permit,
                } = slot;
                let value = match value.reserve() {
                    Reservation::Shared(to_keep, to_checkout) => {
                        list.idle.push(Idle {
                            idle_at,
                            slot: Slot {
                                value: to_keep,
                                meta: meta.clone(),
                                permit: permit.clone(),
                            },
                        });
                        to_checkout
                    }
                    Reservation::Unique(value) => value,
                };
                trace!("sharing connection {} for {}", meta.id, target);
                return Some(reused(value, meta, permit, entry));
            }

            let Idle { slot, .. } = list.idle.remove(i);
            trace!("reusing connection {} for {}", slot.meta.id, target);
            return Some(reused(slot.value, slot.meta, slot.permit, entry));
        }
        None
    }

    fn clear_expired(&self) {
        let now = Instant::now();
        let mut entries = self.entries();
        for (target, entry) in entries.iter() {
            let mut list = entry.list();
            let mut retired = Vec::new();
            list.idle.retain(|idle| {
                let keep = !self.is_expired(idle, now) && idle.slot.value.is_open();
                if !keep {
                    trace!("idle interval evicting connection {} for {}", idle.slot.meta.id, target);
                    retired.push(idle.slot.meta.clone());
                }
                keep
            });
            for meta in retired {
                list.retire(&meta);
            }
        }
        // Forget targets nothing refers to anymore.
        entries.retain(|_, entry| Arc::strong_count(entry) > 1 || !entry.list().is_empty());
    }
}

fn reused<T: Poolable>(
    value: T,
    meta: Arc<Meta>,
    permit: Arc<OwnedSemaphorePermit>,
    entry: &Arc<Entry<T>>,
) -> Pooled<T> {
    meta.streams.fetch_add(1, Ordering::AcqRel);
    meta.set_state(ConnState::InUse);
    Pooled {
        slot: Some(Slot {
            value,
            meta,
            permit,
        }),
        is_reused: true,
        healthy: true,
        entry: entry.clone(),
    }
}

impl<T> Entry<T> {
    fn new(max: usize) -> Entry<T> {
        Entry {
            list: Mutex::new(List {
                idle: Vec::new(),
                live: HashMap::new(),
            }),
            slots: Arc::new(Semaphore::new(max)),
            released: Notify::new(),
            connecting: AtomicBool::new(false),
        }
    }

    fn list(&self) -> MutexGuard<'_, List<T>> {
        self.list.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: Poolable> Entry<T> {
    fn release(&self, slot: Slot<T>, healthy: bool) {
        let Slot {
            value,
            meta,
            permit,
        } = slot;
        let open = value.is_open();
        let remaining = meta.streams.fetch_sub(1, Ordering::AcqRel) - 1;

        if value.can_share() {
            let mut list = self.list();
            if !healthy || !open || meta.state() == ConnState::Draining {
                // Take the shared copy out so nobody else picks it up.
                list.idle.retain(|idle| idle.slot.meta.id != meta.id);
                if remaining == 0 {
                    list.retire(&meta);
                } else {
                    debug!("connection {} draining, {} streams left", meta.id, remaining);
                    meta.set_state(ConnState::Draining);
                }
            } else if remaining == 0 {
                let now = Instant::now();
                for idle in list.idle.iter_mut().filter(|idle| idle.slot.meta.id == meta.id) {
                    idle.idle_at = now;
                }
                meta.set_state(ConnState::Idle);
            }
        } else if healthy && open {
            meta.set_state(ConnState::Idle);
            self.list().idle.push(Idle {
                idle_at: Instant::now(),
                slot: Slot {
                    value,
                    meta,
                    permit,
                },
            });
        } else {
            debug!("connection {} is not reusable, closing", meta.id);
            self.list().retire(&meta);
            drop(value);
            // Frees the slot for a new connection.
            drop(permit);
        }

        self.released.notify_waiters();
    }
}

impl<T> List<T> {
    fn retire(&mut self, meta: &Meta) {
        if meta.streams() == 0 {
            meta.set_state(ConnState::Closed);
            self.live.remove(&meta.id);
        } else {
            meta.set_state(ConnState::Draining);
        }
    }

    fn is_empty(&self) -> bool {
        self.idle.is_empty() && self.live.is_empty()
    }
}

/// Room for one new connection to a target.
///
/// Dropping it without handing it to [`Pool::pooled`] gives the room back.
pub(super) struct Ticket<T> {
    target: Target,
    meta: Arc<Meta>,
    permit: Option<OwnedSemaphorePermit>,
    // Holds the target's connecting marker.
    connecting: bool,
    entry: Arc<Entry<T>>,
}

impl<T> Ticket<T> {
    pub(super) fn target(&self) -> &Target {
        &self.target
    }

    pub(super) fn id(&self) -> u64 {
        self.meta.id
    }
}

impl<T> Drop for Ticket<T> {
    fn drop(&mut self) {
        if self.connecting {
            self.entry.connecting.store(false, Ordering::Release);
        }
        if self.permit.take().is_some() {
            trace!("connection {} to {} failed before pooling", self.meta.id, self.target);
            self.meta.set_state(ConnState::Closed);
            self.entry.list().live.remove(&self.meta.id);
            self.entry.released.notify_waiters();
        }
    }
}

/// A wrapped poolable value that tries to reinsert to the Pool on Drop.
// Note: The bounds `T: Poolable` is needed for the Drop impl.
pub(super) struct Pooled<T: Poolable> {
    slot: Option<Slot<T>>,
    is_reused: bool,
    healthy: bool,
    entry: Arc<Entry<T>>,
}

impl<T: Poolable> Pooled<T> {
    pub(super) fn is_reused(&self) -> bool {
        self.is_reused
    }

    /// The connection won't be handed out again once this is dropped.
    pub(super) fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    pub(super) fn info(&self) -> ConnectionInfo {
        self.slot().meta.info()
    }

    fn slot(&self) -> &Slot<T> {
        self.slot.as_ref().expect("not dropped")
    }
}

impl<T: Poolable> Deref for Pooled<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.slot().value
    }
}

impl<T: Poolable> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.slot.as_mut().expect("not dropped").value
    }
}

impl<T: Poolable> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.entry.release(slot, self.healthy);
        }
    }
}

impl<T: Poolable> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("id", &self.slot().meta.id)
            .field("is_reused", &self.is_reused)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use http::Version;

    use super::{Acquired, ConnState, Config, Pool, Poolable, Pooled, Reservation};
    use crate::client::connect::Target;
    use crate::common::exec::Exec;

    /// Test unique reservations.
    #[derive(Debug, PartialEq, Eq)]
    struct Uniq<T>(T);

    impl<T: Send + 'static + Unpin> Poolable for Uniq<T> {
        fn is_open(&self) -> bool {
            true
        }

        fn reserve(self) -> Reservation<Self> {
            Reservation::Unique(self)
        }

        fn can_share(&self) -> bool {
            false
        }
    }

    /// A shareable value whose liveness can be switched off.
    #[derive(Clone, Debug)]
    struct Shared(Arc<AtomicBool>);

    impl Shared {
        fn new() -> Shared {
            Shared(Arc::new(AtomicBool::new(true)))
        }

        fn close(&self) {
            self.0.store(false, Ordering::SeqCst);
        }
    }

    impl Poolable for Shared {
        fn is_open(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }

        fn reserve(self) -> Reservation<Self> {
            Reservation::Shared(self.clone(), self)
        }

        fn can_share(&self) -> bool {
            true
        }
    }

    fn pool_with(max_per_target: usize, idle_timeout: Option<Duration>) -> Pool<Uniq<i32>> {
        Pool::new(
            Config {
                idle_timeout,
                max_per_target,
                max_streams: 2,
            },
            Exec::Default,
        )
    }

    fn pool_no_timer<T>() -> Pool<T> {
        Pool::new(
            Config {
                idle_timeout: None,
                max_per_target: 5,
                max_streams: 2,
            },
            Exec::Default,
        )
    }

    fn target() -> Target {
        Target::http("foo", 80)
    }

    async fn connect<T: Poolable>(pool: &Pool<T>, value: T) -> Pooled<T> {
        match pool.acquire(&target(), false).await.unwrap() {
            Acquired::Connect(ticket) => pool.pooled(ticket, value, Version::HTTP_11),
            Acquired::Reused(_) => panic!("expected to connect"),
        }
    }

    async fn reuse<T: Poolable>(pool: &Pool<T>) -> Pooled<T> {
        match pool.acquire(&target(), false).await.unwrap() {
            Acquired::Reused(pooled) => pooled,
            Acquired::Connect(_) => panic!("expected a pooled connection"),
        }
    }

    #[tokio::test]
    async fn test_pool_checkout_smoke() {
        let pool = pool_no_timer();
        let pooled = connect(&pool, Uniq(41)).await;
        let id = pooled.info().id();
        assert!(!pooled.is_reused());
        assert_eq!(pool.connections(&target())[0].state(), ConnState::InUse);
        drop(pooled);

        let idle = pool.idle(&target());
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].state(), ConnState::Idle);

        let pooled = reuse(&pool).await;
        assert!(pooled.is_reused());
        assert_eq!(*pooled, Uniq(41));
        assert_eq!(pooled.info().id(), id);
        assert!(pool.idle(&target()).is_empty());
    }

    #[tokio::test]
    async fn unhealthy_connection_is_not_returned() {
        let pool = pool_no_timer();
        let mut pooled = connect(&pool, Uniq(5)).await;
        pooled.mark_unhealthy();
        drop(pooled);

        assert!(pool.idle(&target()).is_empty());
        assert!(pool.connections(&target()).is_empty());
        match pool.acquire(&target(), false).await.unwrap() {
            Acquired::Connect(_) => (),
            Acquired::Reused(_) => panic!("evicted connection was handed out"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_checkout_removes_expired() {
        let pool = pool_with(5, Some(Duration::from_millis(100)));
        let a = connect(&pool, Uniq(41)).await;
        drop(a);
        assert_eq!(pool.idle(&target()).len(), 1);

        tokio::time::advance(Duration::from_millis(101)).await;

        // checkout.await should clean out the expired
        match pool.acquire(&target(), false).await.unwrap() {
            Acquired::Connect(_) => (),
            Acquired::Reused(_) => panic!("expired connection was handed out"),
        }
        assert!(pool.idle(&target()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_timer_removes_expired() {
        let pool = pool_with(5, Some(Duration::from_millis(100)));
        let pooled = connect(&pool, Uniq(41)).await;
        drop(pooled);
        assert_eq!(pool.idle(&target()).len(), 1);

        // Let the idle interval tick a couple of times.
        tokio::time::sleep(Duration::from_millis(350)).await;

        assert!(pool.idle(&target()).is_empty());
        assert!(pool.connections(&target()).is_empty());
    }

    #[tokio::test]
    async fn acquire_waits_at_the_limit_and_reuses() {
        let pool = pool_with(1, None);
        let pooled = connect(&pool, Uniq(7)).await;
        let id = pooled.info().id();

        let t = target();
        let mut waiting = tokio_test::task::spawn(pool.acquire(&t, false));
        assert!(waiting.poll().is_pending());

        drop(pooled);
        assert!(waiting.is_woken());
        match waiting.await.unwrap() {
            Acquired::Reused(pooled) => assert_eq!(pooled.info().id(), id),
            Acquired::Connect(_) => panic!("limit exceeded"),
        }
    }

    #[tokio::test]
    async fn failed_connect_gives_back_its_slot() {
        let pool = pool_with(1, None);
        let ticket = match pool.acquire(&target(), false).await.unwrap() {
            Acquired::Connect(ticket) => ticket,
            Acquired::Reused(_) => panic!("empty pool"),
        };
        assert_eq!(pool.connections(&target())[0].state(), ConnState::Connecting);

        let t = target();
        let mut waiting = tokio_test::task::spawn(pool.acquire(&t, false));
        assert!(waiting.poll().is_pending());

        drop(ticket);
        assert!(pool.connections(&target()).is_empty());
        match waiting.await.unwrap() {
            Acquired::Connect(_) => (),
            Acquired::Reused(_) => panic!("nothing to reuse"),
        }
    }

    #[tokio::test]
    async fn targets_do_not_share_connections() {
        let pool = pool_no_timer();
        drop(connect(&pool, Uniq(1)).await);

        match pool.acquire(&Target::https("foo", 80), false).await.unwrap() {
            Acquired::Connect(_) => (),
            Acquired::Reused(_) => panic!("connection crossed targets"),
        }
    }

    #[tokio::test]
    async fn shared_connection_is_multiplexed_up_to_max_streams() {
        let pool = pool_no_timer();
        let first = match pool.acquire(&target(), false).await.unwrap() {
            Acquired::Connect(ticket) => pool.pooled(ticket, Shared::new(), Version::HTTP_2),
            Acquired::Reused(_) => panic!("empty pool"),
        };
        let id = first.info().id();
        assert_eq!(first.info().version(), Some(Version::HTTP_2));

        let second = reuse(&pool).await;
        assert_eq!(second.info().id(), id);
        assert_eq!(second.info().active_streams(), 2);

        // max_streams is 2
        match pool.acquire(&target(), false).await.unwrap() {
            Acquired::Connect(_) => (),
            Acquired::Reused(_) => panic!("stream limit exceeded"),
        }

        drop(first);
        drop(second);
        let idle = pool.idle(&target());
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].state(), ConnState::Idle);
        assert_eq!(idle[0].active_streams(), 0);
    }

    #[tokio::test]
    async fn evicted_shared_connection_drains() {
        let pool = pool_no_timer();
        let mut first = match pool.acquire(&target(), false).await.unwrap() {
            Acquired::Connect(ticket) => pool.pooled(ticket, Shared::new(), Version::HTTP_2),
            Acquired::Reused(_) => panic!("empty pool"),
        };
        let second = reuse(&pool).await;
        let id = second.info().id();

        first.mark_unhealthy();
        drop(first);

        // No longer offered, but the other stream keeps it alive.
        assert!(pool.idle(&target()).is_empty());
        assert_eq!(pool.connections(&target())[0].state(), ConnState::Draining);
        match pool.acquire(&target(), false).await.unwrap() {
            Acquired::Connect(ticket) => assert_ne!(ticket.id(), id),
            Acquired::Reused(_) => panic!("draining connection was handed out"),
        }

        drop(second);
        assert!(pool
            .connections(&target())
            .iter()
            .all(|info| info.id() != id));
    }

    #[tokio::test]
    async fn closed_shared_connection_is_skipped() {
        let pool = pool_no_timer();
        let value = Shared::new();
        let first = match pool.acquire(&target(), false).await.unwrap() {
            Acquired::Connect(ticket) => pool.pooled(ticket, value.clone(), Version::HTTP_2),
            Acquired::Reused(_) => panic!("empty pool"),
        };
        drop(first);

        value.close();
        match pool.acquire(&target(), false).await.unwrap() {
            Acquired::Connect(_) => (),
            Acquired::Reused(_) => panic!("closed connection was handed out"),
        }
    }

    #[tokio::test]
    async fn acquire_waits_for_a_connection_that_may_be_shared() {
        let pool = pool_no_timer();
        let ticket = match pool.acquire(&target(), true).await.unwrap() {
            Acquired::Connect(ticket) => ticket,
            Acquired::Reused(_) => panic!("empty pool"),
        };

        let t = target();
        let mut waiting = tokio_test::task::spawn(pool.acquire(&t, true));
        assert!(waiting.poll().is_pending());
        assert_eq!(pool.connections(&target()).len(), 1);

        let first = pool.pooled(ticket, Shared::new(), Version::HTTP_2);
        assert!(waiting.is_woken());
        match waiting.await.unwrap() {
            Acquired::Reused(second) => assert_eq!(second.info().id(), first.info().id()),
            Acquired::Connect(_) => panic!("opened a second connection"),
        }
    }

    #[tokio::test]
    async fn http11_fallback_lets_waiters_connect() {
        let pool = pool_no_timer();
        let ticket = match pool.acquire(&target(), true).await.unwrap() {
            Acquired::Connect(ticket) => ticket,
            Acquired::Reused(_) => panic!("empty pool"),
        };

        let t = target();
        let mut waiting = tokio_test::task::spawn(pool.acquire(&t, true));
        assert!(waiting.poll().is_pending());

        let first = pool.pooled(ticket, Uniq(1), Version::HTTP_11);
        assert!(waiting.is_woken());
        match waiting.await.unwrap() {
            Acquired::Connect(ticket) => assert_ne!(ticket.id(), first.info().id()),
            Acquired::Reused(_) => panic!("HTTP/1.1 connection was shared"),
        }
    }

    #[tokio::test]
    async fn failed_shareable_connect_lets_waiters_connect() {
        let pool = pool_no_timer::<Shared>();
        let ticket = match pool.acquire(&target(), true).await.unwrap() {
            Acquired::Connect(ticket) => ticket,
            Acquired::Reused(_) => panic!("empty pool"),
        };

        let t = target();
        let mut waiting = tokio_test::task::spawn(pool.acquire(&t, true));
        assert!(waiting.poll().is_pending());

        drop(ticket);
        assert!(waiting.is_woken());
        match waiting.await.unwrap() {
            Acquired::Connect(_) => (),
            Acquired::Reused(_) => panic!("nothing to reuse"),
        }
    }

    #[tokio::test]
    async fn unshareable_targets_connect_concurrently() {
        let pool = pool_no_timer::<Uniq<i32>>();
        let _first = match pool.acquire(&target(), false).await.unwrap() {
            Acquired::Connect(ticket) => ticket,
            Acquired::Reused(_) => panic!("empty pool"),
        };
        match pool.acquire(&target(), false).await.unwrap() {
            Acquired::Connect(_) => (),
            Acquired::Reused(_) => panic!("nothing to reuse"),
        }
    }
}
