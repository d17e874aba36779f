use crate::{
    Backend, BlockAllocator, BlockConfig, BlockState, Error, ExecError, HiLoAllocator, HiLoConfig,
    HiLoStore, HiLoTable, IdAllocator, MemoryBackend, RefillMode, Result, Retirement, Scheme,
    SequenceBlock, SequenceStore,
};
use core::time::Duration;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::scope;

const SEQ: &str = "resource_id_seq";
const KEY: &str = "review";

fn table() -> HiLoTable {
    HiLoTable::new("id_hilo", "table_name", "next_hi")
}

fn block(backend: &MemoryBackend, config: BlockConfig) -> BlockAllocator {
    BlockAllocator::new(SEQ, backend.sequence_store(), config)
}

fn hilo(backend: &MemoryBackend, config: &HiLoConfig) -> HiLoAllocator {
    HiLoAllocator::new(KEY, backend.hilo_store(&table()).unwrap(), config).unwrap()
}

/// Counts every call reaching the wrapped store.
struct CountingStore {
    inner: Arc<dyn SequenceStore>,
    calls: AtomicUsize,
}

impl CountingStore {
    fn new(inner: Arc<dyn SequenceStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    fn tick(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }
}

impl SequenceStore for CountingStore {
    fn read_block(&self, name: &str) -> Result<SequenceBlock> {
        self.tick();
        self.inner.read_block(name)
    }

    fn advance_block(&self, name: &str, new_next_block_start: i64) -> Result<u64> {
        self.tick();
        self.inner.advance_block(name, new_next_block_start)
    }

    fn advance_block_from(&self, name: &str, expected: i64, new_next_block_start: i64) -> Result<u64> {
        self.tick();
        self.inner.advance_block_from(name, expected, new_next_block_start)
    }

    fn mark_exhausted(&self, name: &str) -> Result<u64> {
        self.tick();
        self.inner.mark_exhausted(name)
    }
}

/// Lets another writer reserve a block between every refill's read and its
/// write, for the first `races` refills.
struct RacingStore {
    inner: Arc<dyn SequenceStore>,
    races: AtomicUsize,
}

impl SequenceStore for RacingStore {
    fn read_block(&self, name: &str) -> Result<SequenceBlock> {
        let block = self.inner.read_block(name)?;
        let won = self
            .races
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if won {
            self.inner
                .advance_block(name, block.next_block_start + block.block_size)?;
        }
        Ok(block)
    }

    fn advance_block(&self, name: &str, new_next_block_start: i64) -> Result<u64> {
        self.inner.advance_block(name, new_next_block_start)
    }

    fn advance_block_from(&self, name: &str, expected: i64, new_next_block_start: i64) -> Result<u64> {
        self.inner.advance_block_from(name, expected, new_next_block_start)
    }

    fn mark_exhausted(&self, name: &str) -> Result<u64> {
        self.inner.mark_exhausted(name)
    }
}

/// Blocks inside `read_block` until released, announcing entry first.
struct StallingStore {
    inner: Arc<dyn SequenceStore>,
    entered: mpsc::SyncSender<()>,
    release: parking_lot::Mutex<mpsc::Receiver<()>>,
}

impl SequenceStore for StallingStore {
    fn read_block(&self, name: &str) -> Result<SequenceBlock> {
        let _ = self.entered.send(());
        let _ = self.release.lock().recv();
        self.inner.read_block(name)
    }

    fn advance_block(&self, name: &str, new_next_block_start: i64) -> Result<u64> {
        self.inner.advance_block(name, new_next_block_start)
    }

    fn advance_block_from(&self, name: &str, expected: i64, new_next_block_start: i64) -> Result<u64> {
        self.inner.advance_block_from(name, expected, new_next_block_start)
    }

    fn mark_exhausted(&self, name: &str) -> Result<u64> {
        self.inner.mark_exhausted(name)
    }
}

/// Simulates a second process creating the counter row just before ours.
struct InsertRaceStore {
    inner: Arc<dyn HiLoStore>,
}

impl HiLoStore for InsertRaceStore {
    fn table(&self) -> &HiLoTable {
        self.inner.table()
    }

    fn increment_high(&self, key: &str) -> Result<u64> {
        self.inner.increment_high(key)
    }

    fn insert_initial_row(&self, key: &str) -> Result<u64> {
        self.inner.insert_initial_row(key)?;
        self.inner.insert_initial_row(key)
    }

    fn read_high(&self, key: &str) -> Result<i64> {
        self.inner.read_high(key)
    }

    fn increment_and_read(&self, key: &str) -> Result<Option<i64>> {
        self.inner.increment_and_read(key)
    }
}

/// Forwards only the required methods, so allocators go through the
/// provided two-step `increment_and_read`.
struct TwoStepStore {
    inner: Arc<dyn HiLoStore>,
    reads: AtomicUsize,
}

impl TwoStepStore {
    fn new(backend: &MemoryBackend) -> Arc<Self> {
        Arc::new(Self {
            inner: backend.hilo_store(&table()).unwrap(),
            reads: AtomicUsize::new(0),
        })
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

impl HiLoStore for TwoStepStore {
    fn table(&self) -> &HiLoTable {
        self.inner.table()
    }

    fn increment_high(&self, key: &str) -> Result<u64> {
        self.inner.increment_high(key)
    }

    fn insert_initial_row(&self, key: &str) -> Result<u64> {
        self.inner.insert_initial_row(key)
    }

    fn read_high(&self, key: &str) -> Result<i64> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.inner.read_high(key)
    }
}

fn run_ids_follow<A: IdAllocator>(allocator: &A, expected: impl IntoIterator<Item = i64>) {
    for id in expected {
        assert_eq!(allocator.try_next_id().unwrap(), id);
    }
}

fn run_ids_unique_threaded<A: IdAllocator>(allocator: A) {
    const THREADS: usize = 8;
    const TOTAL_IDS: usize = 4096;
    const IDS_PER_THREAD: usize = TOTAL_IDS / THREADS;

    let seen = parking_lot::Mutex::new(HashSet::with_capacity(TOTAL_IDS));

    scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                let ids = allocator.try_next_ids(IDS_PER_THREAD).unwrap();
                let mut seen = seen.lock();
                for id in ids {
                    assert!(seen.insert(id), "duplicate id {id}");
                }
            });
        }
    });

    assert_eq!(seen.lock().len(), TOTAL_IDS);
}

fn run_ids_unique_across_processes<A: IdAllocator>(make_allocator: impl Fn() -> A) {
    const PROCESSES: usize = 4;
    const IDS_PER_PROCESS: usize = 1000;

    let allocators: Vec<A> = (0..PROCESSES).map(|_| make_allocator()).collect();
    let seen = parking_lot::Mutex::new(HashSet::new());

    scope(|s| {
        for allocator in &allocators {
            let seen = &seen;
            s.spawn(move || {
                for _ in 0..IDS_PER_PROCESS {
                    let id = allocator.try_next_id().unwrap();
                    assert!(seen.lock().insert(id), "duplicate id {id}");
                }
            });
        }
    });

    assert_eq!(seen.lock().len(), PROCESSES * IDS_PER_PROCESS);
}

#[test]
fn block_serves_ranges_in_order() {
    let backend = MemoryBackend::new();
    backend.seed_sequence(SEQ, 1, 10);
    let allocator = block(&backend, BlockConfig::default());

    run_ids_follow(&allocator, 1..11);
    assert_eq!(backend.sequence(SEQ).unwrap().next_block_start, 11);
    assert_eq!(
        allocator.state(),
        BlockState::Serving {
            cursor: 11,
            block_end: 11
        }
    );

    run_ids_follow(&allocator, 11..21);
    assert_eq!(backend.sequence(SEQ).unwrap().next_block_start, 21);
}

#[test]
fn block_refills_once_per_block() {
    let backend = MemoryBackend::new();
    backend.seed_sequence(SEQ, 0, 100);
    let store = CountingStore::new(backend.sequence_store());
    let allocator = BlockAllocator::new(SEQ, store.clone(), BlockConfig::default());

    assert_eq!(allocator.state(), BlockState::Empty);
    run_ids_follow(&allocator, 0..100);
    // One read and one write.
    assert_eq!(store.calls(), 2);
    allocator.try_next_id().unwrap();
    assert_eq!(store.calls(), 4);
}

#[test]
fn block_ids_unique_threaded() {
    let backend = MemoryBackend::new();
    backend.seed_sequence(SEQ, 1, 7);
    run_ids_unique_threaded(block(&backend, BlockConfig::default()));
}

#[test]
fn block_ids_unique_across_processes_with_compare_and_set() {
    let backend = MemoryBackend::new();
    backend.seed_sequence(SEQ, 1, 5);
    // Each clone of the backend stands in for a separate process.
    run_ids_unique_across_processes(|| block(&backend.clone(), BlockConfig::default()));
}

#[test]
fn missing_sequence_is_terminal_without_io() {
    let store = CountingStore::new(MemoryBackend::new().sequence_store());
    let allocator = BlockAllocator::new(SEQ, store.clone(), BlockConfig::default());

    let expected = Err(Error::SequenceNotFound { name: SEQ.into() });
    assert_eq!(allocator.try_next_id(), expected);
    assert_eq!(allocator.state(), BlockState::Retired(Retirement::NotFound));
    let calls = store.calls();

    assert_eq!(allocator.try_next_id(), expected);
    assert_eq!(store.calls(), calls);
}

#[test]
fn exhaustion_is_terminal_without_io() {
    let backend = MemoryBackend::new();
    backend.seed_sequence(SEQ, 1, 10);
    backend.sequence_store().mark_exhausted(SEQ).unwrap();
    let store = CountingStore::new(backend.sequence_store());
    let allocator = BlockAllocator::new(SEQ, store.clone(), BlockConfig::default());

    let expected = Err(Error::SequenceExhausted { name: SEQ.into() });
    assert_eq!(allocator.try_next_id(), expected);
    assert_eq!(store.calls(), 1);
    for _ in 0..3 {
        assert_eq!(allocator.try_next_id(), expected);
    }
    assert_eq!(store.calls(), 1);
}

#[test]
fn exhaustion_observed_mid_stream_stops_issuing() {
    let backend = MemoryBackend::new();
    backend.seed_sequence(SEQ, 1, 3);
    let allocator = block(&backend, BlockConfig::default());

    run_ids_follow(&allocator, 1..4);
    backend.sequence_store().mark_exhausted(SEQ).unwrap();
    assert!(matches!(
        allocator.try_next_id(),
        Err(Error::SequenceExhausted { .. })
    ));
}

#[test]
fn limit_clamps_last_block_and_retires_sequence() {
    let backend = MemoryBackend::new();
    backend.seed_sequence(SEQ, 1, 10);
    let allocator = block(&backend, BlockConfig::default().with_limit(16));

    run_ids_follow(&allocator, 1..16);
    assert_eq!(backend.sequence(SEQ).unwrap().next_block_start, 16);
    assert!(!backend.sequence(SEQ).unwrap().exhausted);

    assert!(matches!(
        allocator.try_next_id(),
        Err(Error::SequenceExhausted { .. })
    ));
    assert!(backend.sequence(SEQ).unwrap().exhausted);
}

#[test]
fn non_positive_block_size_is_rejected() {
    let backend = MemoryBackend::new();
    backend.seed_sequence(SEQ, 1, 0);
    let allocator = block(&backend, BlockConfig::default());

    assert!(matches!(
        allocator.try_next_id(),
        Err(Error::InvalidConfig { .. })
    ));
    assert_eq!(allocator.state(), BlockState::Empty);
}

#[test]
fn compare_and_set_rereads_after_losing_a_race() {
    let backend = MemoryBackend::new();
    backend.seed_sequence(SEQ, 1, 10);
    let store = Arc::new(RacingStore {
        inner: backend.sequence_store(),
        races: AtomicUsize::new(2),
    });
    let allocator = BlockAllocator::new(SEQ, store, BlockConfig::default());

    // The other writer took 1..11 and 11..21.
    run_ids_follow(&allocator, 21..31);
    assert_eq!(backend.sequence(SEQ).unwrap().next_block_start, 31);
}

#[test]
fn unconditioned_refill_reissues_a_raced_range() {
    let backend = MemoryBackend::new();
    backend.seed_sequence(SEQ, 1, 10);
    let store = Arc::new(RacingStore {
        inner: backend.sequence_store(),
        races: AtomicUsize::new(1),
    });
    let config = BlockConfig::default().with_refill(RefillMode::Unconditioned);
    let allocator = BlockAllocator::new(SEQ, store, config);

    // The other writer also holds 1..11; this is the documented hazard.
    run_ids_follow(&allocator, 1..11);
    assert_eq!(backend.sequence(SEQ).unwrap().next_block_start, 11);
}

#[test]
fn refill_gives_up_after_max_attempts() {
    let backend = MemoryBackend::new();
    backend.seed_sequence(SEQ, 1, 10);
    let store = Arc::new(RacingStore {
        inner: backend.sequence_store(),
        races: AtomicUsize::new(usize::MAX),
    });
    let config = BlockConfig {
        max_refill_attempts: 3,
        ..BlockConfig::default()
    };
    let allocator = BlockAllocator::new(SEQ, store, config);

    let err = allocator.try_next_id().unwrap_err();
    assert_eq!(
        err,
        Error::RefillContended {
            name: SEQ.into(),
            attempts: 3
        }
    );
    assert!(err.is_retryable());
    assert_eq!(allocator.state(), BlockState::Empty);
}

#[test]
fn store_failure_caches_nothing() {
    let backend = MemoryBackend::new();
    backend.seed_sequence(SEQ, 1, 2);
    let allocator = block(&backend, BlockConfig::default());
    run_ids_follow(&allocator, 1..3);

    backend.set_unavailable(true);
    let err = allocator.try_next_id().unwrap_err();
    assert!(matches!(
        err,
        Error::StoreUnavailable {
            scheme: Scheme::Block,
            ..
        }
    ));
    assert_eq!(allocator.state(), BlockState::Empty);

    backend.set_unavailable(false);
    run_ids_follow(&allocator, 3..5);
}

#[test]
fn block_restart_never_reissues() {
    let backend = MemoryBackend::new();
    backend.seed_sequence(SEQ, 1, 10);

    let before = block(&backend, BlockConfig::default());
    let issued: Vec<i64> = before.try_next_ids(3).unwrap();
    drop(before);

    // 4..11 were reserved but never issued; they stay lost.
    let after = block(&backend, BlockConfig::default());
    let next = after.try_next_id().unwrap();
    assert_eq!(next, 11);
    assert!(!issued.contains(&next));
}

#[test]
fn lock_timeout_surfaces_as_unavailable() {
    let backend = MemoryBackend::new();
    backend.seed_sequence(SEQ, 1, 10);
    let (entered_tx, entered_rx) = mpsc::sync_channel(1);
    let (release_tx, release_rx) = mpsc::channel();
    let store = Arc::new(StallingStore {
        inner: backend.sequence_store(),
        entered: entered_tx,
        release: parking_lot::Mutex::new(release_rx),
    });
    let allocator = BlockAllocator::new(SEQ, store, BlockConfig::default())
        .with_lock_timeout(Some(Duration::from_millis(20)));

    scope(|s| {
        let refill = s.spawn(|| allocator.try_next_id());
        entered_rx.recv().unwrap();

        let err = allocator.try_next_id().unwrap_err();
        assert_eq!(
            err,
            Error::StoreUnavailable {
                scheme: Scheme::Block,
                identifier: SEQ.into(),
                source: ExecError::Timeout {
                    waited: Duration::from_millis(20)
                },
            }
        );

        release_tx.send(()).unwrap();
        assert_eq!(refill.join().unwrap(), Ok(1));
    });
}

#[test]
fn hilo_composes_high_and_low() {
    let backend = MemoryBackend::new();
    backend.seed_counter("id_hilo", KEY, 4);
    let allocator = hilo(&backend, &HiLoConfig::new(table(), 100, 1_000));

    run_ids_follow(&allocator, 500..600);
    assert_eq!(backend.counter_rows("id_hilo", KEY), vec![5]);
    run_ids_follow(&allocator, 600..700);
    assert_eq!(backend.counter_rows("id_hilo", KEY), vec![6]);
}

#[test]
fn hilo_ids_unique_threaded() {
    let backend = MemoryBackend::new();
    backend.seed_counter("id_hilo", KEY, 0);
    run_ids_unique_threaded(hilo(&backend, &HiLoConfig::new(table(), 10, 1_000_000)));
}

#[test]
fn hilo_ids_unique_across_processes() {
    let backend = MemoryBackend::new();
    let config = HiLoConfig::new(table(), 7, 1_000_000).with_auto_init(true);
    backend.seed_counter("id_hilo", KEY, 0);
    run_ids_unique_across_processes(|| hilo(&backend.clone(), &config));
}

#[test]
fn hilo_high_at_max_is_out_of_range() {
    let backend = MemoryBackend::new();
    backend.seed_counter("id_hilo", KEY, 99);
    let allocator = hilo(&backend, &HiLoConfig::new(table(), 10, 100));

    assert_eq!(
        allocator.try_next_id(),
        Err(Error::OutOfRange {
            identifier: KEY.into(),
            value: 100,
            max: 100
        })
    );
}

#[test]
fn hilo_negative_high_is_out_of_range() {
    let backend = MemoryBackend::new();
    backend.seed_counter("id_hilo", KEY, -5);
    let allocator = hilo(&backend, &HiLoConfig::new(table(), 10, 100));

    assert!(matches!(
        allocator.try_next_id(),
        Err(Error::OutOfRange { value: -4, .. })
    ));
}

#[test]
fn hilo_missing_row_without_auto_init() {
    let backend = MemoryBackend::new();
    let allocator = hilo(&backend, &HiLoConfig::new(table(), 10, 100));

    assert_eq!(
        allocator.try_next_id(),
        Err(Error::RowMissing {
            table: "id_hilo".into(),
            key: KEY.into()
        })
    );
    assert!(backend.counter_rows("id_hilo", KEY).is_empty());
}

#[test]
fn hilo_auto_init_creates_row_once() {
    let backend = MemoryBackend::new();
    let config = HiLoConfig::new(table(), 10, 100).with_auto_init(true);
    let allocator = hilo(&backend, &config);

    // Inserted at 0, then incremented to 1.
    run_ids_follow(&allocator, 10..20);
    assert_eq!(backend.counter_rows("id_hilo", KEY), vec![1]);

    let other = hilo(&backend, &config);
    assert_eq!(other.try_next_id().unwrap(), 20);
    assert_eq!(backend.counter_rows("id_hilo", KEY), vec![2]);
}

#[test]
fn hilo_lost_insert_race_fails_without_duplicating_row() {
    let backend = MemoryBackend::new();
    let store = Arc::new(InsertRaceStore {
        inner: backend.hilo_store(&table()).unwrap(),
    });
    let config = HiLoConfig::new(table(), 10, 100).with_auto_init(true);
    let allocator = HiLoAllocator::new(KEY, store, &config).unwrap();

    assert_eq!(
        allocator.try_next_id(),
        Err(Error::InsertFailed {
            table: "id_hilo".into(),
            key: KEY.into(),
            rows: 0
        })
    );
    assert_eq!(backend.counter_rows("id_hilo", KEY), vec![0]);

    // The row the winner created serves the retry.
    assert_eq!(allocator.try_next_id().unwrap(), 10);
}

#[test]
fn hilo_duplicate_rows_are_reported() {
    let backend = MemoryBackend::new();
    backend.seed_counter("id_hilo", KEY, 1);
    backend.seed_counter("id_hilo", KEY, 1);
    let allocator = hilo(&backend, &HiLoConfig::new(table(), 10, 100));

    assert!(matches!(
        allocator.try_next_id(),
        Err(Error::MultipleRows {
            scheme: Scheme::HiLo,
            count: 2,
            ..
        })
    ));
}

#[test]
fn hilo_uses_configured_key() {
    let backend = MemoryBackend::new();
    backend.seed_counter("id_hilo", "reviews", 2);
    let config = HiLoConfig::new(table(), 10, 100).with_key("reviews");
    let allocator = hilo(&backend, &config);

    assert_eq!(allocator.key(), "reviews");
    assert_eq!(allocator.identifier(), KEY);
    assert_eq!(allocator.scheme(), Scheme::HiLo);
    assert_eq!(allocator.try_next_id().unwrap(), 30);
}

#[test]
fn hilo_store_failure_keeps_previous_state() {
    let backend = MemoryBackend::new();
    backend.seed_counter("id_hilo", KEY, 0);
    let allocator = hilo(&backend, &HiLoConfig::new(table(), 2, 100));
    run_ids_follow(&allocator, 2..4);

    backend.set_unavailable(true);
    assert!(allocator.try_next_id().unwrap_err().is_retryable());
    backend.set_unavailable(false);
    run_ids_follow(&allocator, 4..6);
}

#[test]
fn hilo_restart_never_reissues() {
    let backend = MemoryBackend::new();
    backend.seed_counter("id_hilo", KEY, 0);
    let config = HiLoConfig::new(table(), 100, 1_000);

    let before = hilo(&backend, &config);
    assert_eq!(before.try_next_id().unwrap(), 100);
    drop(before);

    assert_eq!(hilo(&backend, &config).try_next_id().unwrap(), 200);
}

#[test]
fn hilo_rejects_invalid_config() {
    let backend = MemoryBackend::new();
    let config = HiLoConfig::new(table(), 0, 100);
    let store = backend.hilo_store(&table()).unwrap();
    assert!(matches!(
        HiLoAllocator::new(KEY, store, &config),
        Err(Error::InvalidConfig { .. })
    ));
}

#[test]
fn two_step_increment_composes_high_and_low() {
    let backend = MemoryBackend::new();
    backend.seed_counter("id_hilo", KEY, 4);
    let store = TwoStepStore::new(&backend);
    let config = HiLoConfig::new(table(), 100, 1_000);
    let allocator = HiLoAllocator::new(KEY, store.clone(), &config).unwrap();

    run_ids_follow(&allocator, 500..600);
    run_ids_follow(&allocator, 600..700);
    assert_eq!(store.reads(), 2);
    assert_eq!(backend.counter_rows("id_hilo", KEY), vec![6]);
}

#[test]
fn two_step_increment_auto_inits_missing_row() {
    let backend = MemoryBackend::new();
    let store = TwoStepStore::new(&backend);
    let config = HiLoConfig::new(table(), 10, 100).with_auto_init(true);
    let allocator = HiLoAllocator::new(KEY, store.clone(), &config).unwrap();

    run_ids_follow(&allocator, 10..20);
    assert_eq!(store.reads(), 1);
    assert_eq!(backend.counter_rows("id_hilo", KEY), vec![1]);

    let missing = HiLoAllocator::new(
        KEY,
        TwoStepStore::new(&MemoryBackend::new()),
        &HiLoConfig::new(table(), 10, 100),
    )
    .unwrap();
    assert!(matches!(
        missing.try_next_id(),
        Err(Error::RowMissing { .. })
    ));
}

#[test]
fn two_step_increment_reports_duplicate_rows() {
    let backend = MemoryBackend::new();
    backend.seed_counter("id_hilo", KEY, 1);
    backend.seed_counter("id_hilo", KEY, 1);
    let store = TwoStepStore::new(&backend);
    let allocator = HiLoAllocator::new(KEY, store.clone(), &HiLoConfig::new(table(), 10, 100)).unwrap();

    assert_eq!(
        allocator.try_next_id(),
        Err(Error::MultipleRows {
            scheme: Scheme::HiLo,
            key: KEY.into(),
            count: 2
        })
    );
    // The increment count alone rules the call out; nothing is read.
    assert_eq!(store.reads(), 0);
}
