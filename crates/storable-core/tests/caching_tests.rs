use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storable_core::{CellConfig, CellError, Executor, ExecutorError, ImmediateExecutor, Job, ObserveStrategy};
use storable_store::{IdentityConverter, JsonConverter, MemoryStore, Store, StoreError};
use storable_test_utils::{init_tracing, test_key, CountingStore};
use tokio_test::{assert_pending, assert_ready};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_gets_share_in_flight_load() {
    for strategy in [ObserveStrategy::CacheActualValue, ObserveStrategy::CacheStoreValue] {
        let store = CountingStore::<String, String>::shared();
        store.seed(test_key("in-flight"), "[7]".to_string());
        store.delay_loads(Duration::from_millis(200));

        let cell = CellConfig::new(test_key("in-flight"), store.clone(), JsonConverter::<Vec<u8>>::new())
            .with_strategy(strategy)
            .build()
            .unwrap();

        let readers: Vec<_> = (0..16)
            .map(|_| {
                let cell = cell.clone();
                tokio::spawn(async move { cell.get().await })
            })
            .collect();
        for reader in readers {
            assert_eq!(reader.await.unwrap().unwrap(), Some(vec![7]), "{strategy:?}");
        }

        assert_eq!(store.loads(), 1, "{strategy:?}");
        assert_eq!(cell.cache_stats().unwrap().connects, 1, "{strategy:?}");
    }
}

#[tokio::test]
async fn test_sequential_observers_share_one_load() {
    init_tracing();
    for strategy in [ObserveStrategy::CacheActualValue, ObserveStrategy::CacheStoreValue] {
        let store = CountingStore::<String, String>::shared();
        store.seed(test_key("shared"), "[1,2,3]".to_string());

        let cell = CellConfig::new(test_key("shared"), store.clone(), JsonConverter::<Vec<u8>>::new())
            .with_strategy(strategy)
            .build()
            .unwrap();

        let mut observers: Vec<_> = (0..8).map(|_| cell.observe()).collect();
        for observer in &mut observers {
            let value = observer.next().await.unwrap().unwrap();
            assert_eq!(value, Some(vec![1, 2, 3]));
        }

        assert_eq!(store.loads(), 1, "{strategy:?}");
        assert_eq!(cell.cache_stats().unwrap().observers, 8);
    }
}

#[tokio::test]
async fn test_no_cache_reads_every_time() {
    let store = CountingStore::<String, u32>::shared();
    let cell = CellConfig::new(test_key("direct"), store.clone(), IdentityConverter::new())
        .with_strategy(ObserveStrategy::NoCache)
        .with_executor(ImmediateExecutor::new())
        .build()
        .unwrap();

    for _ in 0..3 {
        assert_eq!(cell.get().await.unwrap(), None);
    }
    assert_eq!(store.loads(), 3);
    assert!(cell.cache_stats().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_resubscribe_within_grace_skips_load() {
    let store = CountingStore::<String, u32>::shared();
    store.seed(test_key("grace"), 4);
    let cell = CellConfig::new(test_key("grace"), store.clone(), IdentityConverter::new())
        .with_executor(ImmediateExecutor::new())
        .with_grace_period(Duration::from_millis(1000))
        .build()
        .unwrap();

    assert_eq!(cell.get().await.unwrap(), Some(4));
    assert_eq!(store.loads(), 1);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(cell.get().await.unwrap(), Some(4));
    assert_eq!(store.loads(), 1);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(cell.cache_stats().unwrap().generation, None);
    assert_eq!(cell.get().await.unwrap(), Some(4));
    assert_eq!(store.loads(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_write_within_grace_is_replayed() {
    let store = CountingStore::<String, u32>::shared();
    let cell = CellConfig::new(test_key("replay"), store.clone(), IdentityConverter::new())
        .with_executor(ImmediateExecutor::new())
        .build()
        .unwrap();

    cell.set(Some(9)).await.unwrap();
    // The comparison read and the write share one generation
    assert_eq!(store.loads(), 1);
    assert_eq!(cell.get().await.unwrap(), Some(9));
    assert_eq!(store.loads(), 1);
    assert_eq!(cell.cache_stats().unwrap().connects, 1);
}

#[tokio::test]
async fn test_write_failure_retires_generation() {
    let store = CountingStore::<String, u32>::shared();
    store.seed(test_key("retire"), 1);
    let cell = CellConfig::new(test_key("retire"), store.clone(), IdentityConverter::new())
        .with_executor(ImmediateExecutor::new())
        .build()
        .unwrap();

    let mut observer = cell.observe();
    assert_eq!(observer.next().await.unwrap().unwrap(), Some(1));
    assert_eq!(store.loads(), 1);

    store.fail_stores(true);
    let err = cell.set(Some(2)).await.unwrap_err();
    assert!(err.is_store());
    assert_eq!(cell.cache_stats().unwrap().retirements, 1);

    // The observer reconnects and reads the backend again
    assert_eq!(observer.next().await.unwrap().unwrap(), Some(1));
    assert_eq!(store.loads(), 2);
}

#[tokio::test]
async fn test_failed_read_is_not_cached() {
    let store = CountingStore::<String, u32>::shared();
    store.seed(test_key("flaky"), 3);
    let cell = CellConfig::new(test_key("flaky"), store.clone(), IdentityConverter::new())
        .with_executor(ImmediateExecutor::new())
        .build()
        .unwrap();

    store.fail_loads(true);
    let err = cell.get().await.unwrap_err();
    assert!(err.is_store());

    store.fail_loads(false);
    assert_eq!(cell.get().await.unwrap(), Some(3));
    assert_eq!(store.loads(), 2);
}

#[tokio::test]
async fn test_clones_share_cache() {
    let store = CountingStore::<String, String>::shared();
    let cell = CellConfig::new(test_key("clone"), store.clone(), IdentityConverter::new())
        .with_executor(ImmediateExecutor::new())
        .build()
        .unwrap();
    let other = cell.clone();

    let mut observer = cell.observe();
    assert_eq!(observer.next().await.unwrap().unwrap(), None);

    other.set(Some("x".to_string())).await.unwrap();
    assert_eq!(observer.next().await.unwrap().unwrap().as_deref(), Some("x"));
    assert_eq!(Arc::strong_count(&store), 2);
}

/// Store whose first load panics
struct PanicOnce {
    armed: AtomicBool,
    entries: MemoryStore<String, u32>,
}

impl PanicOnce {
    fn new(key: String, value: u32) -> Self {
        let entries = MemoryStore::new();
        entries.insert(key, value);
        Self {
            armed: AtomicBool::new(true),
            entries,
        }
    }
}

impl Store<String, u32> for PanicOnce {
    fn contains(&self, key: &String) -> bool {
        self.entries.contains(key)
    }

    fn load(&self, key: &String) -> Result<Option<u32>, StoreError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            panic!("backend driver crashed");
        }
        self.entries.load(key)
    }

    fn store(&self, key: &String, value: Option<&u32>) -> Result<(), StoreError> {
        self.entries.store(key, value)
    }
}

#[tokio::test]
async fn test_panicking_load_fails_cached_readers() {
    init_tracing();
    for strategy in [ObserveStrategy::CacheActualValue, ObserveStrategy::CacheStoreValue] {
        let cell = CellConfig::new(
            test_key("panic"),
            PanicOnce::new(test_key("panic"), 4),
            IdentityConverter::new(),
        )
        .with_strategy(strategy)
        .build()
        .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), cell.get())
            .await
            .unwrap();
        assert_eq!(first, Err(CellError::Executor(ExecutorError::Dropped)), "{strategy:?}");

        // The failed generation is gone and the worker thread survived
        assert_eq!(cell.cache_stats().unwrap().generation, None);
        assert_eq!(cell.get().await.unwrap(), Some(4), "{strategy:?}");
    }
}

/// Executor that holds jobs until the test runs them
#[derive(Clone, Default)]
struct HeldJobs {
    jobs: Arc<Mutex<Vec<Job>>>,
}

impl HeldJobs {
    fn pending(&self) -> usize {
        self.jobs.lock().len()
    }

    fn run(&self, index: usize) {
        let job = self.jobs.lock().remove(index);
        job();
    }
}

impl Executor for HeldJobs {
    fn execute(&self, job: Job) -> Result<(), ExecutorError> {
        self.jobs.lock().push(job);
        Ok(())
    }
}

/// Store whose loads return a value read before any write
struct StaleReads {
    snapshot: u32,
    entries: MemoryStore<String, u32>,
}

impl Store<String, u32> for StaleReads {
    fn contains(&self, key: &String) -> bool {
        self.entries.contains(key)
    }

    fn load(&self, _key: &String) -> Result<Option<u32>, StoreError> {
        Ok(Some(self.snapshot))
    }

    fn store(&self, key: &String, value: Option<&u32>) -> Result<(), StoreError> {
        self.entries.store(key, value)
    }
}

#[test]
fn test_load_overtaken_by_write_is_discarded() {
    let store = Arc::new(StaleReads {
        snapshot: 1,
        entries: MemoryStore::new(),
    });
    let jobs = HeldJobs::default();
    let cell = CellConfig::new(test_key("overtaken"), store.clone(), IdentityConverter::new())
        .with_executor(jobs.clone())
        .build()
        .unwrap();

    let mut observer = tokio_test::task::spawn(cell.observe());
    assert_pending!(observer.poll_next());
    let mut write = tokio_test::task::spawn(cell.force_set(Some(5)));
    assert_pending!(write.poll());
    assert_eq!(jobs.pending(), 2);

    // The write finishes before the load that read the old value
    jobs.run(1);
    assert_ready!(write.poll()).unwrap();
    jobs.run(0);

    assert_eq!(store.entries.peek(&test_key("overtaken")), Some(5));
    let seen = assert_ready!(observer.poll_next());
    assert_eq!(seen.unwrap().unwrap(), Some(5));
    assert_pending!(observer.poll_next());
    assert_eq!(futures::executor::block_on(cell.get()).unwrap(), Some(5));
    assert_eq!(cell.cache_stats().unwrap().connects, 1);
}

#[test]
fn test_grace_timer_on_supplied_runtime() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_time()
        .build()
        .unwrap();
    let store = CountingStore::<String, u32>::shared();
    store.seed(test_key("off-runtime"), 6);
    let cell = CellConfig::new(test_key("off-runtime"), store.clone(), IdentityConverter::new())
        .with_executor(ImmediateExecutor::new())
        .with_grace_period(Duration::from_millis(300))
        .with_runtime(runtime.handle().clone())
        .build()
        .unwrap();

    assert_eq!(cell.get_sync().unwrap(), Some(6));
    assert_eq!(cell.get_sync().unwrap(), Some(6));
    assert_eq!(store.loads(), 1);

    std::thread::sleep(Duration::from_millis(1500));
    let stats = cell.cache_stats().unwrap();
    assert_eq!(stats.generation, None);
    assert_eq!(stats.evictions, 1);
}

#[test]
fn test_no_runtime_evicts_immediately() {
    let store = CountingStore::<String, u32>::shared();
    let cell = CellConfig::new(test_key("no-runtime"), store.clone(), IdentityConverter::new())
        .with_executor(ImmediateExecutor::new())
        .build()
        .unwrap();

    assert_eq!(cell.get_sync().unwrap(), None);
    assert_eq!(cell.get_sync().unwrap(), None);
    assert_eq!(store.loads(), 2);
    assert_eq!(cell.cache_stats().unwrap().evictions, 2);
}
