use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use crate::error::SubmitError;

/// Work given to the wheel. `run` executes on the tick thread unless the
/// timer was built with an [`Executor`].
pub trait TimerTask: Send + Sync + 'static {
    fn run(&self, timeout: &Timeout);
}

impl<F> TimerTask for F
where
    F: Fn(&Timeout) + Send + Sync + 'static,
{
    fn run(&self, timeout: &Timeout) {
        self(timeout)
    }
}

/// Offloads fired tasks so a slow body cannot delay subsequent ticks.
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, job: Box<dyn FnOnce() + Send>);
}

const STATE_INIT: u8 = 0;
const STATE_CANCELLED: u8 = 1;
const STATE_EXPIRED: u8 = 2;

const WORKER_INIT: u8 = 0;
const WORKER_STARTED: u8 = 1;
const WORKER_SHUTDOWN: u8 = 2;

/// Placement word for "not linked into any bucket".
const UNPLACED: u64 = u64::MAX;

/// Upper bound on submissions drained per tick, so a submission storm cannot
/// starve expiry processing.
const MAX_PENDING_PER_TICK: usize = 100_000;

/// A cancellable reference to one pending timeout.
///
/// State moves `INIT -> CANCELLED` or `INIT -> EXPIRED`, never back. Clones
/// share the same underlying handle.
#[derive(Clone)]
pub struct Timeout {
    inner: Arc<TimeoutInner>,
}

struct TimeoutInner {
    task: Arc<dyn TimerTask>,
    /// Nanoseconds on the timer's monotonic clock.
    deadline: u64,
    state: AtomicU8,
    /// Packed `bucket << 32 | slot`; written and read only by the worker.
    position: AtomicU64,
    cancellations: Sender<Arc<TimeoutInner>>,
}

impl Timeout {
    /// Prevent an unfired handle from firing. Returns `true` iff this call
    /// performed the cancellation; an already-cancelled or already-expired
    /// handle returns `false`. Never blocks, never interrupts a running body.
    pub fn cancel(&self) -> bool {
        if self
            .inner
            .state
            .compare_exchange(STATE_INIT, STATE_CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // Hand the handle to the worker for O(1) unlink at the next tick.
            let _ = self.inner.cancellations.send(Arc::clone(&self.inner));
            true
        } else {
            false
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == STATE_CANCELLED
    }

    pub fn is_expired(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == STATE_EXPIRED
    }

    pub fn is_pending(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == STATE_INIT
    }

    /// Whether two values refer to the same underlying handle.
    pub fn same_handle(&self, other: &Timeout) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.state.load(Ordering::Acquire) {
            STATE_CANCELLED => "cancelled",
            STATE_EXPIRED => "expired",
            _ => "pending",
        };
        f.debug_struct("Timeout")
            .field("state", &state)
            .field("deadline_nanos", &self.inner.deadline)
            .finish()
    }
}

/// Single-ring hashed wheel timer with a dedicated tick thread.
///
/// Deadlines hash onto a power-of-two ring of buckets; each tick expires one
/// bucket, so insertion and cancellation are O(1) and dispatch accuracy is
/// one tick on the late side. The worker thread starts lazily on the first
/// submission.
pub struct HashedWheelTimer {
    shared: Arc<TimerShared>,
    worker: Mutex<Option<JoinHandle<Vec<Timeout>>>>,
}

struct TimerShared {
    tick: Duration,
    mask: u64,
    /// Zero point of the timer's monotonic clock.
    anchor: Instant,
    worker_state: AtomicU8,
    started: Mutex<bool>,
    start_cv: Condvar,
    sleep_lock: Mutex<()>,
    sleep_cv: Condvar,
    pending_tx: Sender<Arc<TimeoutInner>>,
    pending_rx: Receiver<Arc<TimeoutInner>>,
    cancelled_tx: Sender<Arc<TimeoutInner>>,
    cancelled_rx: Receiver<Arc<TimeoutInner>>,
    executor: Option<Arc<dyn Executor>>,
}

impl HashedWheelTimer {
    /// `wheel_size` is rounded up to a power of two; `tick` is floored at
    /// one millisecond.
    pub fn new(tick: Duration, wheel_size: usize) -> Self {
        Self::build(tick, wheel_size, None)
    }

    pub fn with_executor(tick: Duration, wheel_size: usize, executor: Arc<dyn Executor>) -> Self {
        Self::build(tick, wheel_size, Some(executor))
    }

    fn build(tick: Duration, wheel_size: usize, executor: Option<Arc<dyn Executor>>) -> Self {
        let size = wheel_size.max(1).next_power_of_two();
        let (pending_tx, pending_rx) = unbounded();
        let (cancelled_tx, cancelled_rx) = unbounded();
        HashedWheelTimer {
            shared: Arc::new(TimerShared {
                tick: tick.max(Duration::from_millis(1)),
                mask: size as u64 - 1,
                anchor: Instant::now(),
                worker_state: AtomicU8::new(WORKER_INIT),
                started: Mutex::new(false),
                start_cv: Condvar::new(),
                sleep_lock: Mutex::new(()),
                sleep_cv: Condvar::new(),
                pending_tx,
                pending_rx,
                cancelled_tx,
                cancelled_rx,
                executor,
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn tick_duration(&self) -> Duration {
        self.shared.tick
    }

    pub fn wheel_size(&self) -> usize {
        (self.shared.mask + 1) as usize
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.worker_state.load(Ordering::Acquire) == WORKER_SHUTDOWN
    }

    /// Schedule `task` to fire `delay` from now. Starts the worker thread on
    /// first use.
    pub fn submit(&self, task: Arc<dyn TimerTask>, delay: Duration) -> Result<Timeout, SubmitError> {
        if self.is_shutdown() {
            return Err(SubmitError::Shutdown);
        }
        self.start();
        if self.is_shutdown() {
            return Err(SubmitError::Shutdown);
        }

        let deadline = as_nanos(self.shared.anchor.elapsed() + delay);
        let inner = Arc::new(TimeoutInner {
            task,
            deadline,
            state: AtomicU8::new(STATE_INIT),
            position: AtomicU64::new(UNPLACED),
            cancellations: self.shared.cancelled_tx.clone(),
        });
        let _ = self.shared.pending_tx.send(Arc::clone(&inner));
        trace!(deadline_nanos = deadline, "timeout submitted");
        Ok(Timeout { inner })
    }

    /// Stop the worker at its next tick and reclaim every handle that never
    /// fired. Subsequent submissions are rejected.
    pub fn shutdown(&self) -> Vec<Timeout> {
        let previous = self.shared.worker_state.swap(WORKER_SHUTDOWN, Ordering::AcqRel);
        // Release any submitter parked on the start latch, then wake the worker.
        {
            let mut started = self.shared.started.lock();
            *started = true;
            self.shared.start_cv.notify_all();
        }
        self.shared.sleep_cv.notify_all();

        if previous != WORKER_STARTED {
            // Worker never ran; whatever queued is unprocessed by definition.
            let mut unprocessed = Vec::new();
            while let Ok(inner) = self.shared.pending_rx.try_recv() {
                if inner.state.load(Ordering::Acquire) == STATE_INIT {
                    unprocessed.push(Timeout { inner });
                }
            }
            return unprocessed;
        }

        match self.worker.lock().take() {
            Some(handle) => handle.join().unwrap_or_default(),
            None => Vec::new(),
        }
    }

    fn start(&self) {
        if self.shared.worker_state.load(Ordering::Acquire) == WORKER_INIT {
            let mut slot = self.worker.lock();
            if self
                .shared
                .worker_state
                .compare_exchange(WORKER_INIT, WORKER_STARTED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let shared = Arc::clone(&self.shared);
                let handle = thread::Builder::new()
                    .name("cronwheel-timer".to_string())
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn timer worker thread");
                *slot = Some(handle);
            }
        }

        // Wait until the worker has published its start time (or the timer
        // was shut down before it ever ran).
        let mut started = self.shared.started.lock();
        while !*started {
            self.shared.start_cv.wait(&mut started);
        }
    }
}

impl Drop for HashedWheelTimer {
    fn drop(&mut self) {
        if !self.is_shutdown() {
            self.shutdown();
        }
    }
}

fn as_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

struct Entry {
    inner: Arc<TimeoutInner>,
    remaining_rounds: u64,
    /// Drain order, used to fire same-deadline entries in submission order.
    seq: u64,
}

/// One slot ring position: a slab of entries with a free list, so removal by
/// stored slot index is O(1).
#[derive(Default)]
struct Bucket {
    entries: Vec<Option<Entry>>,
    free: Vec<usize>,
}

impl Bucket {
    fn insert(&mut self, entry: Entry) -> u64 {
        match self.free.pop() {
            Some(slot) => {
                self.entries[slot] = Some(entry);
                slot as u64
            }
            None => {
                self.entries.push(Some(entry));
                (self.entries.len() - 1) as u64
            }
        }
    }

    fn remove(&mut self, slot: usize) {
        if let Some(occupied) = self.entries.get_mut(slot) {
            if occupied.take().is_some() {
                self.free.push(slot);
            }
        }
    }
}

fn pack(bucket: u64, slot: u64) -> u64 {
    (bucket << 32) | slot
}

fn unpack(position: u64) -> (usize, usize) {
    ((position >> 32) as usize, (position & 0xffff_ffff) as usize)
}

/// The tick thread. Owns the bucket ring exclusively; producers reach it
/// only through the two MPSC channels.
fn worker_loop(shared: Arc<TimerShared>) -> Vec<Timeout> {
    let start_time = as_nanos(shared.anchor.elapsed());
    {
        let mut started = shared.started.lock();
        *started = true;
        shared.start_cv.notify_all();
    }
    debug!(start_nanos = start_time, "timer worker started");

    let wheel_len = shared.mask + 1;
    let tick_nanos = as_nanos(shared.tick);
    let mut buckets: Vec<Bucket> = (0..wheel_len).map(|_| Bucket::default()).collect();
    let mut tick: u64 = 0;
    let mut seq: u64 = 0;
    let mut due: Vec<(u64, Arc<TimeoutInner>)> = Vec::new();

    loop {
        if shared.worker_state.load(Ordering::Acquire) == WORKER_SHUTDOWN {
            return drain_unprocessed(&shared, buckets);
        }

        // Sleep to the next tick boundary. The worker only ever catches up
        // to real time, never runs ahead of it.
        let next_deadline = start_time + (tick + 1) * tick_nanos;
        {
            let mut guard = shared.sleep_lock.lock();
            loop {
                if shared.worker_state.load(Ordering::Acquire) == WORKER_SHUTDOWN {
                    break;
                }
                let now = as_nanos(shared.anchor.elapsed());
                if now >= next_deadline {
                    break;
                }
                let wait = Duration::from_nanos(next_deadline - now);
                let _ = shared.sleep_cv.wait_for(&mut guard, wait);
            }
        }
        if shared.worker_state.load(Ordering::Acquire) == WORKER_SHUTDOWN {
            return drain_unprocessed(&shared, buckets);
        }

        tick += 1;
        let idx = (tick & shared.mask) as usize;

        // Place newly submitted handles, bounded per tick.
        for _ in 0..MAX_PENDING_PER_TICK {
            let inner = match shared.pending_rx.try_recv() {
                Ok(inner) => inner,
                Err(_) => break,
            };
            if inner.state.load(Ordering::Acquire) != STATE_INIT {
                continue; // cancelled before placement
            }
            // Ceiling: a handle may fire one tick late, never early.
            let due_tick = inner.deadline.saturating_sub(start_time).div_ceil(tick_nanos);
            let (stop_idx, rounds) = if due_tick <= tick {
                // Already due (misfire): fire on this very tick.
                (idx, 0)
            } else {
                ((due_tick & shared.mask) as usize, (due_tick - tick) / wheel_len)
            };
            seq += 1;
            let slot = buckets[stop_idx].insert(Entry {
                inner: Arc::clone(&inner),
                remaining_rounds: rounds,
                seq,
            });
            inner.position.store(pack(stop_idx as u64, slot), Ordering::Release);
        }

        // Unlink cancelled handles in O(1) via their stored position.
        while let Ok(inner) = shared.cancelled_rx.try_recv() {
            let position = inner.position.swap(UNPLACED, Ordering::AcqRel);
            if position != UNPLACED {
                let (bucket, slot) = unpack(position);
                buckets[bucket].remove(slot);
            }
        }

        // Expire the bucket this tick lands on.
        due.clear();
        {
            let bucket = &mut buckets[idx];
            for slot in 0..bucket.entries.len() {
                let ready = match &mut bucket.entries[slot] {
                    Some(entry) if entry.remaining_rounds == 0 => true,
                    Some(entry) => {
                        entry.remaining_rounds -= 1;
                        false
                    }
                    None => false,
                };
                if !ready {
                    continue;
                }
                if let Some(entry) = bucket.entries[slot].take() {
                    bucket.free.push(slot);
                    entry.inner.position.store(UNPLACED, Ordering::Release);
                    due.push((entry.seq, entry.inner));
                }
            }
        }
        due.sort_by_key(|(seq, _)| *seq);
        for (_, inner) in due.drain(..) {
            if inner
                .state
                .compare_exchange(STATE_INIT, STATE_EXPIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue; // lost the race to a cancellation
            }
            fire(&shared, inner);
        }
    }
}

fn fire(shared: &TimerShared, inner: Arc<TimeoutInner>) {
    let task = Arc::clone(&inner.task);
    let timeout = Timeout { inner };
    match &shared.executor {
        Some(executor) => executor.execute(Box::new(move || run_task(task, timeout))),
        None => run_task(task, timeout),
    }
}

fn run_task(task: Arc<dyn TimerTask>, timeout: Timeout) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| task.run(&timeout)));
    if result.is_err() {
        error!("timer task panicked; timer keeps ticking");
    }
}

fn drain_unprocessed(shared: &TimerShared, buckets: Vec<Bucket>) -> Vec<Timeout> {
    let mut unprocessed = Vec::new();
    for bucket in buckets {
        for entry in bucket.entries.into_iter().flatten() {
            entry.inner.position.store(UNPLACED, Ordering::Release);
            if entry.inner.state.load(Ordering::Acquire) == STATE_INIT {
                unprocessed.push(Timeout { inner: entry.inner });
            }
        }
    }
    while let Ok(inner) = shared.pending_rx.try_recv() {
        if inner.state.load(Ordering::Acquire) == STATE_INIT {
            unprocessed.push(Timeout { inner });
        }
    }
    while shared.cancelled_rx.try_recv().is_ok() {}
    debug!(unprocessed = unprocessed.len(), "timer worker stopped");
    unprocessed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;

    fn timer(tick_ms: u64, size: usize) -> HashedWheelTimer {
        HashedWheelTimer::new(Duration::from_millis(tick_ms), size)
    }

    fn counting_task(counter: Arc<AtomicUsize>) -> Arc<dyn TimerTask> {
        Arc::new(move |_: &Timeout| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn fires_after_delay() {
        let timer = timer(10, 64);
        let fired = Arc::new(AtomicUsize::new(0));
        let begun = Instant::now();
        timer
            .submit(counting_task(fired.clone()), Duration::from_millis(80))
            .unwrap();

        while fired.load(Ordering::SeqCst) == 0 && begun.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Never early: one tick of lateness is allowed, earliness is not.
        assert!(begun.elapsed() >= Duration::from_millis(80));
        timer.shutdown();
    }

    #[test]
    fn rounds_count_multiple_revolutions() {
        // 4 buckets at 10 ms: a 130 ms delay needs three full revolutions.
        let timer = timer(10, 4);
        let fired = Arc::new(AtomicUsize::new(0));
        timer
            .submit(counting_task(fired.clone()), Duration::from_millis(130))
            .unwrap();
        thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 0, "fired a revolution early");
        let begun = Instant::now();
        while fired.load(Ordering::SeqCst) == 0 && begun.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        timer.shutdown();
    }

    #[test]
    fn cancel_before_fire_wins() {
        let timer = timer(10, 64);
        let fired = Arc::new(AtomicUsize::new(0));
        let timeout = timer
            .submit(counting_task(fired.clone()), Duration::from_millis(300))
            .unwrap();

        assert!(timeout.cancel());
        assert!(!timeout.cancel(), "second cancel on the same handle is a no-op");
        assert!(timeout.is_cancelled());

        thread::sleep(Duration::from_millis(500));
        assert_eq!(fired.load(Ordering::SeqCst), 0, "cancelled task must not run");
        timer.shutdown();
    }

    #[test]
    fn cancel_after_fire_returns_false() {
        let timer = timer(10, 64);
        let fired = Arc::new(AtomicUsize::new(0));
        let timeout = timer
            .submit(counting_task(fired.clone()), Duration::from_millis(30))
            .unwrap();
        let begun = Instant::now();
        while fired.load(Ordering::SeqCst) == 0 && begun.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(timeout.is_expired());
        assert!(!timeout.cancel());
        timer.shutdown();
    }

    #[test]
    fn misfire_fires_on_first_tick() {
        // Deadline lands inside the first 200 ms tick; the handle fires as
        // soon as the worker processes it.
        let timer = timer(200, 32);
        let fired = Arc::new(AtomicUsize::new(0));
        let begun = Instant::now();
        timer
            .submit(counting_task(fired.clone()), Duration::from_millis(50))
            .unwrap();
        while fired.load(Ordering::SeqCst) == 0 && begun.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(10));
        }
        let elapsed = begun.elapsed();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(800), "late by {elapsed:?}");
        timer.shutdown();
    }

    #[test]
    fn same_deadline_fires_in_submission_order() {
        let timer = timer(50, 64);
        let order = Arc::new(StdMutex::new(Vec::new()));
        for i in 0..5usize {
            let order = order.clone();
            timer
                .submit(
                    Arc::new(move |_: &Timeout| order.lock().unwrap().push(i)),
                    Duration::from_millis(120),
                )
                .unwrap();
        }
        thread::sleep(Duration::from_millis(500));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        timer.shutdown();
    }

    #[test]
    fn panicking_task_does_not_stop_the_worker() {
        let timer = timer(10, 64);
        let fired = Arc::new(AtomicUsize::new(0));
        timer
            .submit(
                Arc::new(|_: &Timeout| panic!("task blew up")),
                Duration::from_millis(20),
            )
            .unwrap();
        timer
            .submit(counting_task(fired.clone()), Duration::from_millis(100))
            .unwrap();
        let begun = Instant::now();
        while fired.load(Ordering::SeqCst) == 0 && begun.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        timer.shutdown();
    }

    #[test]
    fn shutdown_returns_unfired_handles_and_rejects_submissions() {
        let timer = timer(10, 64);
        let fired = Arc::new(AtomicUsize::new(0));
        timer
            .submit(counting_task(fired.clone()), Duration::from_secs(60))
            .unwrap();
        timer
            .submit(counting_task(fired.clone()), Duration::from_secs(60))
            .unwrap();
        thread::sleep(Duration::from_millis(100));

        let unprocessed = timer.shutdown();
        assert_eq!(unprocessed.len(), 2);
        assert!(unprocessed.iter().all(|t| t.is_pending()));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let rejected = timer.submit(counting_task(fired.clone()), Duration::from_millis(1));
        assert!(matches!(rejected, Err(SubmitError::Shutdown)));
    }

    #[test]
    fn shutdown_before_first_submission_is_empty() {
        let timer = timer(10, 64);
        assert!(timer.shutdown().is_empty());
        assert!(timer.is_shutdown());
    }

    #[test]
    fn executor_receives_fired_tasks() {
        struct Collect(StdMutex<Vec<Box<dyn FnOnce() + Send>>>);
        impl Executor for Collect {
            fn execute(&self, job: Box<dyn FnOnce() + Send>) {
                self.0.lock().unwrap().push(job);
            }
        }

        let executor = Arc::new(Collect(StdMutex::new(Vec::new())));
        let timer =
            HashedWheelTimer::with_executor(Duration::from_millis(10), 64, executor.clone());
        let fired = Arc::new(AtomicUsize::new(0));
        timer
            .submit(counting_task(fired.clone()), Duration::from_millis(30))
            .unwrap();

        let begun = Instant::now();
        while executor.0.lock().unwrap().is_empty() && begun.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
        }
        // The wheel only delegates; nothing ran yet.
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        for job in executor.0.lock().unwrap().drain(..) {
            job();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        timer.shutdown();
    }

    #[test]
    fn accounting_adds_up() {
        let timer = timer(10, 32);
        let fired = Arc::new(AtomicUsize::new(0));
        let mut cancelled = 0usize;
        let submitted = 30usize;
        let mut handles = Vec::new();
        for i in 0..submitted {
            let delay = if i % 3 == 0 { Duration::from_millis(40) } else { Duration::from_secs(60) };
            handles.push(timer.submit(counting_task(fired.clone()), delay).unwrap());
        }
        thread::sleep(Duration::from_millis(400));
        for handle in handles.iter().step_by(2) {
            if handle.cancel() {
                cancelled += 1;
            }
        }
        let unfired = timer.shutdown().len();
        assert_eq!(fired.load(Ordering::SeqCst) + cancelled + unfired, submitted);
    }
}
