//! Reference-counted shared upstream with replay and delayed eviction
//!
//! A generation starts when the first subscriber arrives and ends when the
//! last one leaves and the grace period elapses without a new subscriber, or
//! when its upstream completes, or when it is retired explicitly.

use crate::connection::Connection;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;

/// Latest value of a generation, replayed to late subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntry<T> {
    /// Cached value
    pub value: T,
    /// When the value was published
    pub produced_at: Instant,
}

impl<T> CachedEntry<T> {
    /// Create entry stamped now
    #[inline]
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            value,
            produced_at: Instant::now(),
        }
    }

    /// Time since the value was published
    #[inline]
    #[must_use]
    pub fn age(&self) -> Duration {
        self.produced_at.elapsed()
    }
}

/// Statistics for cache monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Subscribers attached to the live generation
    pub observers: usize,
    /// Id of the live generation, if any
    pub generation: Option<u64>,
    /// Upstream connections started
    pub connects: u64,
    /// Generations ended by the grace timer
    pub evictions: u64,
    /// Generations ended by completion or retirement
    pub retirements: u64,
}

type Connect<T> = Box<dyn Fn(Publisher<T>) -> Connection + Send + Sync>;

struct Generation<T> {
    id: u64,
    observers: usize,
    release_epoch: u64,
    replay: Option<CachedEntry<T>>,
    subscribers: Vec<(u64, UnboundedSender<T>)>,
    connection: Option<Connection>,
}

struct CacheState<T> {
    next_generation: u64,
    next_subscriber: u64,
    connects: u64,
    evictions: u64,
    retirements: u64,
    current: Option<Generation<T>>,
}

impl<T> CacheState<T> {
    fn live(&mut self, generation: Option<u64>) -> Option<&mut Generation<T>> {
        self.current
            .as_mut()
            .filter(|live| generation.map_or(true, |id| live.id == id))
    }
}

struct Shared<T> {
    grace: Duration,
    connect: Connect<T>,
    runtime: Option<Handle>,
    state: Mutex<CacheState<T>>,
}

impl<T> Shared<T>
where
    T: Clone + Send + 'static,
{
    fn publish(&self, generation: Option<u64>, value: T) -> bool {
        let mut state = self.state.lock();
        let Some(live) = state.live(generation) else {
            return false;
        };

        live.subscribers
            .retain(|(_, sender)| sender.unbounded_send(value.clone()).is_ok());
        live.replay = Some(CachedEntry::new(value));
        true
    }

    fn retire(&self, generation: Option<u64>) -> bool {
        let ended = {
            let mut state = self.state.lock();
            if state.live(generation).is_none() {
                return false;
            }
            state.retirements += 1;
            state.current.take()
        };

        if let Some(ended) = ended {
            tracing::debug!(generation = ended.id, observers = ended.observers, "generation retired");
            // Dropping the generation closes subscriber channels and disposes
            // the connection outside the lock
            drop(ended);
        }
        true
    }

    fn release(self: &Arc<Self>, generation: u64, subscriber: u64) {
        let epoch = {
            let mut state = self.state.lock();
            let Some(live) = state.live(Some(generation)) else {
                return;
            };
            live.subscribers.retain(|(id, _)| *id != subscriber);
            live.observers = live.observers.saturating_sub(1);
            if live.observers > 0 {
                return;
            }
            live.release_epoch += 1;
            live.release_epoch
        };

        self.schedule_eviction(generation, epoch);
    }

    fn schedule_eviction(self: &Arc<Self>, generation: u64, epoch: u64) {
        if self.grace.is_zero() {
            self.evict_if_idle(generation, epoch);
            return;
        }

        let runtime = Handle::try_current().ok().or_else(|| self.runtime.clone());
        let Some(runtime) = runtime else {
            self.evict_if_idle(generation, epoch);
            return;
        };

        let weak = Arc::downgrade(self);
        let grace = self.grace;
        runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(shared) = weak.upgrade() {
                shared.evict_if_idle(generation, epoch);
            }
        });
    }

    fn evict_if_idle(&self, generation: u64, epoch: u64) {
        let ended = {
            let mut state = self.state.lock();
            let idle = state
                .live(Some(generation))
                .is_some_and(|live| live.observers == 0 && live.release_epoch == epoch);
            if !idle {
                return;
            }
            state.evictions += 1;
            state.current.take()
        };

        if ended.is_some() {
            tracing::debug!(generation, "generation evicted");
        }
        drop(ended);
    }
}

/// Shares one upstream computation among concurrent subscribers
///
/// The upstream is started by `connect` when the observer count goes from
/// zero to one and disposed once per generation. Late subscribers receive
/// the latest published value first.
pub struct DelayedRefCountCache<T> {
    shared: Arc<Shared<T>>,
}

impl<T> DelayedRefCountCache<T>
where
    T: Clone + Send + 'static,
{
    /// Create cache
    ///
    /// # Arguments
    /// * `grace_period` - How long a generation outlives its last subscriber
    /// * `connect` - Starts the upstream for a new generation
    ///
    /// The tokio runtime current at construction, if any, drives the grace
    /// timer when a subscription is dropped outside of a runtime.
    pub fn new<F>(grace_period: Duration, connect: F) -> Self
    where
        F: Fn(Publisher<T>) -> Connection + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                grace: grace_period,
                connect: Box::new(connect),
                runtime: Handle::try_current().ok(),
                state: Mutex::new(CacheState {
                    next_generation: 0,
                    next_subscriber: 0,
                    connects: 0,
                    evictions: 0,
                    retirements: 0,
                    current: None,
                }),
            }),
        }
    }

    /// Drive grace timers on `runtime` when no runtime is current
    ///
    /// Has no effect once subscriptions exist.
    #[must_use]
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.runtime = Some(runtime);
        }
        self
    }

    /// Grace period
    #[inline]
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        self.shared.grace
    }

    /// Attach a subscriber, starting a generation if none is live
    pub fn subscribe(&self) -> Subscription<T> {
        let (sender, receiver) = mpsc::unbounded();

        let (generation, subscriber, started) = {
            let mut state = self.shared.state.lock();
            let subscriber = state.next_subscriber;
            state.next_subscriber += 1;

            if let Some(live) = state.current.as_mut() {
                if let Some(entry) = &live.replay {
                    // Fresh channel, cannot be closed yet
                    let _ = sender.unbounded_send(entry.value.clone());
                }
                live.observers += 1;
                live.subscribers.push((subscriber, sender));
                (live.id, subscriber, false)
            } else {
                let id = state.next_generation;
                state.next_generation += 1;
                state.connects += 1;
                state.current = Some(Generation {
                    id,
                    observers: 1,
                    release_epoch: 0,
                    replay: None,
                    subscribers: vec![(subscriber, sender)],
                    connection: None,
                });
                (id, subscriber, true)
            }
        };

        if started {
            tracing::debug!(generation, "generation started");
            let connection = (self.shared.connect)(Publisher {
                shared: Arc::downgrade(&self.shared),
                generation,
            });

            let stale = {
                let mut state = self.shared.state.lock();
                match state.live(Some(generation)) {
                    Some(live) => {
                        live.connection = Some(connection);
                        None
                    }
                    None => Some(connection),
                }
            };
            // Generation ended while connecting
            drop(stale);
        }

        Subscription {
            shared: self.shared.clone(),
            generation,
            subscriber,
            receiver,
        }
    }

    /// Publish into the live generation, if any
    pub fn publish(&self, value: T) -> bool {
        self.shared.publish(None, value)
    }

    /// Drop the replay entry of the live generation
    pub fn invalidate(&self) {
        if let Some(live) = self.shared.state.lock().current.as_mut() {
            live.replay = None;
        }
    }

    /// End the live generation immediately
    ///
    /// Attached subscriptions end; the next subscriber starts a new
    /// generation.
    pub fn retire(&self) -> bool {
        self.shared.retire(None)
    }

    /// Replay entry of the live generation
    #[must_use]
    pub fn peek(&self) -> Option<CachedEntry<T>> {
        self.shared
            .state
            .lock()
            .current
            .as_ref()
            .and_then(|live| live.replay.clone())
    }

    /// Snapshot of counters
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = self.shared.state.lock();
        CacheStats {
            observers: state.current.as_ref().map_or(0, |live| live.observers),
            generation: state.current.as_ref().map(|live| live.id),
            connects: state.connects,
            evictions: state.evictions,
            retirements: state.retirements,
        }
    }
}

impl<T> fmt::Debug for DelayedRefCountCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedRefCountCache")
            .field("grace", &self.shared.grace)
            .finish_non_exhaustive()
    }
}

/// Upstream side of one generation
///
/// Holds the cache weakly; publishing after the generation ended is a no-op.
pub struct Publisher<T> {
    shared: Weak<Shared<T>>,
    generation: u64,
}

impl<T> Publisher<T>
where
    T: Clone + Send + 'static,
{
    /// Fan `value` out to the generation and make it the replay entry
    ///
    /// Returns `false` if the generation already ended.
    pub fn publish(&self, value: T) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.publish(Some(self.generation), value))
    }

    /// End the generation without waiting for the grace period
    pub fn complete(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.retire(Some(self.generation));
        }
    }

    /// Check if the generation is still live
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.upgrade().is_some_and(|shared| {
            shared
                .state
                .lock()
                .current
                .as_ref()
                .is_some_and(|live| live.id == self.generation)
        })
    }

    /// Generation this publisher feeds
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            generation: self.generation,
        }
    }
}

impl<T> fmt::Debug for Publisher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// One subscriber's view of a generation
///
/// Yields every value published into its generation, starting with the
/// replay entry. Ends when the generation ends. Dropping it detaches.
pub struct Subscription<T>
where
    T: Clone + Send + 'static,
{
    shared: Arc<Shared<T>>,
    generation: u64,
    subscriber: u64,
    receiver: UnboundedReceiver<T>,
}

impl<T> Subscription<T>
where
    T: Clone + Send + 'static,
{
    /// Generation this subscription is attached to
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl<T> Stream for Subscription<T>
where
    T: Clone + Send + 'static,
{
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.receiver.poll_next_unpin(cx)
    }
}

impl<T> Drop for Subscription<T>
where
    T: Clone + Send + 'static,
{
    fn drop(&mut self) {
        self.shared.release(self.generation, self.subscriber);
    }
}

impl<T> fmt::Debug for Subscription<T>
where
    T: Clone + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("generation", &self.generation)
            .field("subscriber", &self.subscriber)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_pending, assert_ready_eq};

    struct Probe {
        connects: Arc<AtomicUsize>,
        disposals: Arc<AtomicUsize>,
        publishers: Arc<Mutex<Vec<Publisher<u32>>>>,
    }

    fn probe_cache(grace: Duration) -> (DelayedRefCountCache<u32>, Probe) {
        let probe = Probe {
            connects: Arc::new(AtomicUsize::new(0)),
            disposals: Arc::new(AtomicUsize::new(0)),
            publishers: Arc::new(Mutex::new(Vec::new())),
        };
        let connects = probe.connects.clone();
        let disposals = probe.disposals.clone();
        let publishers = probe.publishers.clone();

        let cache = DelayedRefCountCache::new(grace, move |publisher| {
            connects.fetch_add(1, Ordering::SeqCst);
            publishers.lock().push(publisher);
            let disposals = disposals.clone();
            Connection::new(move || {
                disposals.fetch_add(1, Ordering::SeqCst);
            })
        });
        (cache, probe)
    }

    impl Probe {
        fn latest(&self) -> Publisher<u32> {
            self.publishers.lock().last().cloned().unwrap()
        }
    }

    #[test]
    fn concurrent_subscribers_share_one_connect() {
        let (cache, probe) = probe_cache(Duration::ZERO);
        let first = cache.subscribe();
        let second = cache.subscribe();
        let third = cache.subscribe();

        assert_eq!(probe.connects.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().observers, 3);
        assert_eq!(first.generation(), third.generation());
        drop((first, second, third));
    }

    #[test]
    fn late_subscriber_gets_replay() {
        let (cache, probe) = probe_cache(Duration::ZERO);
        let mut first = tokio_test::task::spawn(cache.subscribe());
        assert_pending!(first.poll_next());

        assert!(probe.latest().publish(7));
        assert_ready_eq!(first.poll_next(), Some(7));

        let mut late = tokio_test::task::spawn(cache.subscribe());
        assert_ready_eq!(late.poll_next(), Some(7));
        assert_pending!(late.poll_next());
        assert_eq!(cache.peek().map(|entry| entry.value), Some(7));
    }

    #[test]
    fn zero_grace_evicts_on_last_release() {
        let (cache, probe) = probe_cache(Duration::ZERO);
        let first = cache.subscribe();
        let second = cache.subscribe();

        drop(first);
        assert_eq!(probe.disposals.load(Ordering::SeqCst), 0);
        drop(second);
        assert_eq!(probe.disposals.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.generation, None);
        assert_eq!(stats.evictions, 1);

        let _again = cache.subscribe();
        assert_eq!(probe.connects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn complete_ends_subscriptions() {
        let (cache, probe) = probe_cache(Duration::from_secs(60));
        let mut sub = tokio_test::task::spawn(cache.subscribe());
        let publisher = probe.latest();
        assert!(publisher.is_active());

        publisher.publish(1);
        publisher.complete();

        assert_ready_eq!(sub.poll_next(), Some(1));
        assert_ready_eq!(sub.poll_next(), None);
        assert!(!publisher.is_active());
        assert!(!publisher.publish(2));
        assert_eq!(probe.disposals.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().retirements, 1);

        // Dropping the ended subscription does not touch the next generation
        let next = cache.subscribe();
        drop(sub);
        assert_eq!(cache.stats().observers, 1);
        assert_eq!(cache.stats().generation, Some(next.generation()));
    }

    #[test]
    fn complete_during_connect_disposes_once() {
        let disposals = Arc::new(AtomicUsize::new(0));
        let counter = disposals.clone();
        let cache = DelayedRefCountCache::new(Duration::ZERO, move |publisher: Publisher<u32>| {
            publisher.publish(3);
            publisher.complete();
            let counter = counter.clone();
            Connection::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });

        let mut sub = tokio_test::task::spawn(cache.subscribe());
        assert_ready_eq!(sub.poll_next(), Some(3));
        assert_ready_eq!(sub.poll_next(), None);
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().generation, None);
    }

    #[test]
    fn invalidate_clears_replay_only() {
        let (cache, _probe) = probe_cache(Duration::ZERO);
        let _sub = cache.subscribe();
        assert!(cache.publish(5));
        assert!(cache.peek().is_some());

        cache.invalidate();
        assert!(cache.peek().is_none());
        assert_eq!(cache.stats().observers, 1);
    }

    #[test]
    fn publish_without_generation_is_dropped() {
        let (cache, _probe) = probe_cache(Duration::ZERO);
        assert!(!cache.publish(1));
        assert!(!cache.retire());
    }

    #[test]
    fn no_runtime_evicts_immediately() {
        let (cache, probe) = probe_cache(Duration::from_secs(5));
        drop(cache.subscribe());
        assert_eq!(probe.disposals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribe_within_grace_keeps_generation() {
        let (cache, probe) = probe_cache(Duration::from_millis(1000));
        let first = cache.subscribe();
        let generation = first.generation();
        drop(first);

        tokio::time::sleep(Duration::from_millis(500)).await;
        let second = cache.subscribe();
        assert_eq!(second.generation(), generation);
        assert_eq!(probe.connects.load(Ordering::SeqCst), 1);

        // The first timer fires while observed and must not evict
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(cache.stats().generation, Some(generation));

        drop(second);
        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert_eq!(cache.stats().generation, None);
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(probe.disposals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_release_does_not_evict_newer_release() {
        let (cache, probe) = probe_cache(Duration::from_millis(1000));
        drop(cache.subscribe());
        tokio::time::sleep(Duration::from_millis(800)).await;

        // Second release restarts the grace period
        drop(cache.subscribe());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(cache.stats().generation.is_some());

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(cache.stats().generation.is_none());
        assert_eq!(probe.connects.load(Ordering::SeqCst), 1);
        assert_eq!(probe.disposals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_is_a_stream() {
        let (cache, probe) = probe_cache(Duration::from_millis(10));
        let mut sub = cache.subscribe();
        let publisher = probe.latest();

        tokio::spawn(async move {
            for value in 1..=3 {
                publisher.publish(value);
            }
            publisher.complete();
        });

        let mut seen = Vec::new();
        while let Some(value) = sub.next().await {
            seen.push(value);
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }
}
