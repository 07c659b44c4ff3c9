//! Chunked execution of the accumulator over large record sets.
//!
//! The scheduler splits validated records into fixed-size chunks and
//! runs [`accumulate`] over each one, either serially on the calling
//! thread or on a bounded [`rayon`] pool.  Workers own their chunk and
//! only share the immutable classification config; partial results
//! come back over a channel tagged with their chunk index and are
//! merged strictly in index order, so the report never depends on
//! which worker finished first.
//!
//! A run moves through `Idle → Splitting → Running → Merging → Done`
//! and can drop to `Failed` from any of them.  A failing chunk or a
//! cancellation discards every partial result.

use crate::accumulate::{accumulate, Accumulator, DEFAULT_SAMPLE_LIMIT};
use crate::error::{Result, VatError};
use crate::models::TransactionRecord;
use crate::tax::ClassificationConfig;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 5000;

/// How often a blocking run wakes up to check for cancellation while
/// waiting on workers.
const CANCEL_POLL: Duration = Duration::from_millis(20);

/// Worker pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerPool {
    /// Never use workers; every run is serial.
    Disabled,
    /// One worker per available CPU.
    Auto,
    Fixed(usize),
}

impl WorkerPool {
    fn size(self) -> Option<usize> {
        match self {
            WorkerPool::Disabled => None,
            WorkerPool::Auto => Some(
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1),
            ),
            WorkerPool::Fixed(n) => Some(n),
        }
    }
}

impl FromStr for WorkerPool {
    type Err = VatError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" | "off" | "none" => Ok(WorkerPool::Disabled),
            "auto" | "" => Ok(WorkerPool::Auto),
            other => other
                .parse::<usize>()
                .map(WorkerPool::Fixed)
                .map_err(|_| VatError::InvalidConfig(format!("invalid worker pool size '{s}'"))),
        }
    }
}

/// Tuning knobs for a run.  Nothing here is global; every run gets its
/// options explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Records per chunk.
    pub chunk_size: usize,
    pub workers: WorkerPool,
    /// Record count from which the parallel strategy is used.
    pub parallel_threshold: usize,
    /// Samples kept per category and direction.
    pub sample_limit: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            chunk_size: DEFAULT_CHUNK_SIZE,
            workers: WorkerPool::Auto,
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
            sample_limit: DEFAULT_SAMPLE_LIMIT,
        }
    }
}

impl RunOptions {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(VatError::InvalidConfig("chunk size must be at least 1".into()));
        }
        if self.workers == WorkerPool::Fixed(0) {
            return Err(VatError::InvalidConfig(
                "worker pool size must be at least 1; use `disabled` to turn workers off".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    SerialCooperative,
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Splitting,
    Running,
    Merging,
    Done,
    Failed,
}

impl RunState {
    pub fn can_advance_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, Splitting)
                | (Splitting, Running)
                | (Running, Merging)
                | (Merging, Done)
                | (Idle | Splitting | Running | Merging, Failed)
        )
    }
}

#[derive(Debug)]
struct RunTracker {
    state: RunState,
}

impl RunTracker {
    fn new() -> Self {
        RunTracker { state: RunState::Idle }
    }

    fn advance(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal run transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(from = ?self.state, to = ?next, "run state");
        self.state = next;
    }
}

/// One entry of the progress stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub percent_complete: f64,
    pub message: String,
}

impl ProgressEvent {
    fn chunk_done(index: usize, completed: usize, total: usize) -> Self {
        ProgressEvent {
            percent_complete: completed as f64 / total as f64 * 100.0,
            message: format!("processed chunk {} ({completed} of {total})", index + 1),
        }
    }
}

/// Cooperative cancellation shared between the caller and a run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// What a successful run hands on to the finalizer.
#[derive(Debug, Clone)]
pub struct ScheduledRun {
    pub accumulator: Accumulator,
    pub mode: ExecutionMode,
    pub chunk_count: usize,
}

type ChunkFn = fn(&[TransactionRecord], &ClassificationConfig, usize) -> Result<Accumulator>;

/// Result of one chunk, tagged with its position.
#[derive(Debug)]
struct ChunkOutcome {
    index: usize,
    result: Result<Accumulator>,
}

/// Where workers deliver their outcomes.
trait OutcomeSink: Clone + Send + 'static {
    fn deliver(&self, outcome: ChunkOutcome);
}

impl OutcomeSink for mpsc::Sender<ChunkOutcome> {
    fn deliver(&self, outcome: ChunkOutcome) {
        // A closed receiver means the run already gave up on this chunk.
        let _ = self.send(outcome);
    }
}

impl OutcomeSink for tokio::sync::mpsc::UnboundedSender<ChunkOutcome> {
    fn deliver(&self, outcome: ChunkOutcome) {
        let _ = self.send(outcome);
    }
}

/// Partial accumulators stored by chunk index.
struct PartialResults {
    slots: Vec<Option<Accumulator>>,
    completed: usize,
}

impl PartialResults {
    fn new(total: usize) -> Self {
        PartialResults {
            slots: (0..total).map(|_| None).collect(),
            completed: 0,
        }
    }

    fn insert(&mut self, index: usize, acc: Accumulator) {
        if self.slots[index].replace(acc).is_none() {
            self.completed += 1;
        }
    }

    fn merge_in_order(self, sample_limit: usize) -> Result<Accumulator> {
        self.slots
            .into_iter()
            .enumerate()
            .try_fold(Accumulator::new(sample_limit), |merged, (chunk, slot)| match slot {
                Some(partial) => merged.merge(partial),
                None => Err(VatError::WorkerExecution {
                    chunk,
                    message: "no result was returned for this chunk".into(),
                }),
            })
    }
}

/// Splits `records` into contiguous chunks of at most `size`, in order.
pub fn split_chunks(records: Vec<TransactionRecord>, size: usize) -> Vec<Vec<TransactionRecord>> {
    let size = size.max(1);
    let mut chunks = Vec::with_capacity(records.len().div_ceil(size));
    let mut iter = records.into_iter().peekable();
    while iter.peek().is_some() {
        chunks.push(iter.by_ref().take(size).collect());
    }
    chunks
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Runs `work` over one chunk.  A panic becomes a `WorkerExecution`
/// error for that chunk; ordinary errors pass through unchanged.
fn run_chunk(
    work: ChunkFn,
    index: usize,
    chunk: &[TransactionRecord],
    config: &ClassificationConfig,
    sample_limit: usize,
) -> Result<Accumulator> {
    panic::catch_unwind(AssertUnwindSafe(|| work(chunk, config, sample_limit))).unwrap_or_else(
        |payload| {
            Err(VatError::WorkerExecution {
                chunk: index,
                message: panic_message(payload),
            })
        },
    )
}

/// Drives runs for one classification config and set of options.
pub struct Scheduler {
    config: Arc<ClassificationConfig>,
    options: RunOptions,
    pool: Option<rayon::ThreadPool>,
    work: ChunkFn,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("options", &self.options)
            .field("pool_threads", &self.pool.as_ref().map(|p| p.current_num_threads()))
            .finish()
    }
}

impl Scheduler {
    /// Creates a scheduler, building the worker pool if one is enabled.
    /// A pool that cannot be built leaves the scheduler serial-only.
    pub fn new(config: Arc<ClassificationConfig>, options: RunOptions) -> Result<Self> {
        options.validate()?;
        let pool = options.workers.size().and_then(|threads| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("vat-worker-{i}"))
                .build()
                .map_err(|err| warn!(%err, "worker pool unavailable; runs will be serial"))
                .ok()
        });
        Ok(Scheduler {
            config,
            options,
            pool,
            work: accumulate,
        })
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// The strategy a run over `records` rows would use.
    pub fn mode_for(&self, records: usize) -> ExecutionMode {
        if records >= self.options.parallel_threshold && self.pool.is_some() {
            ExecutionMode::Parallel
        } else {
            ExecutionMode::SerialCooperative
        }
    }

    /// Runs to completion on the calling thread, blocking while workers
    /// are busy.  Serial runs do not yield between chunks.
    pub fn run<P>(
        &self,
        records: Vec<TransactionRecord>,
        mut progress: P,
        cancel: &CancelToken,
    ) -> Result<ScheduledRun>
    where
        P: FnMut(ProgressEvent),
    {
        let mut tracker = RunTracker::new();
        let mode = self.mode_for(records.len());
        let chunks = self.split(&mut tracker, records, mode);
        let chunk_count = chunks.len();

        let collected = match (mode, self.pool.as_ref()) {
            (ExecutionMode::Parallel, Some(pool)) => {
                let (tx, rx) = mpsc::channel::<ChunkOutcome>();
                let mut run = ParallelRun::new(self, pool, tx, cancel, chunks);
                run.fill();
                let mut outcome = Ok(());
                while !run.is_finished() {
                    if cancel.is_cancelled() {
                        outcome = Err(VatError::Cancelled);
                        break;
                    }
                    match rx.recv_timeout(CANCEL_POLL) {
                        Ok(received) => match run.accept(received) {
                            Ok(event) => progress(event),
                            Err(err) => {
                                outcome = Err(err);
                                break;
                            }
                        },
                        Err(mpsc::RecvTimeoutError::Timeout) => continue,
                        Err(mpsc::RecvTimeoutError::Disconnected) => {
                            outcome = Err(run.lost_worker());
                            break;
                        }
                    }
                }
                outcome.and_then(|()| run.finish())
            }
            _ => {
                let mut run = SerialRun::new(self, chunks);
                let mut outcome = Ok(());
                while let Some(step) = run.step(cancel) {
                    match step {
                        Ok(event) => progress(event),
                        Err(err) => {
                            outcome = Err(err);
                            break;
                        }
                    }
                }
                outcome.map(|()| run.into_partials())
            }
        };
        self.finish(tracker, collected, mode, chunk_count)
    }

    /// Async flavour of [`run`](Self::run).  Serial runs yield to the
    /// runtime after every chunk; parallel runs await worker results
    /// without blocking the runtime and stop waiting as soon as the
    /// token is cancelled.
    pub async fn run_async<P>(
        &self,
        records: Vec<TransactionRecord>,
        mut progress: P,
        cancel: &CancelToken,
    ) -> Result<ScheduledRun>
    where
        P: FnMut(ProgressEvent) + Send,
    {
        let mut tracker = RunTracker::new();
        let mode = self.mode_for(records.len());
        let chunks = self.split(&mut tracker, records, mode);
        let chunk_count = chunks.len();

        let collected = match (mode, self.pool.as_ref()) {
            (ExecutionMode::Parallel, Some(pool)) => {
                let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ChunkOutcome>();
                let mut run = ParallelRun::new(self, pool, tx, cancel, chunks);
                run.fill();
                let mut outcome = Ok(());
                while !run.is_finished() {
                    let received = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            outcome = Err(VatError::Cancelled);
                            break;
                        }
                        received = rx.recv() => received,
                    };
                    let Some(received) = received else {
                        outcome = Err(run.lost_worker());
                        break;
                    };
                    match run.accept(received) {
                        Ok(event) => progress(event),
                        Err(err) => {
                            outcome = Err(err);
                            break;
                        }
                    }
                }
                outcome.and_then(|()| run.finish())
            }
            _ => {
                let mut run = SerialRun::new(self, chunks);
                let mut outcome = Ok(());
                while let Some(step) = run.step(cancel) {
                    match step {
                        Ok(event) => progress(event),
                        Err(err) => {
                            outcome = Err(err);
                            break;
                        }
                    }
                    tokio::task::yield_now().await;
                }
                outcome.map(|()| run.into_partials())
            }
        };
        self.finish(tracker, collected, mode, chunk_count)
    }

    fn split(
        &self,
        tracker: &mut RunTracker,
        records: Vec<TransactionRecord>,
        mode: ExecutionMode,
    ) -> Vec<Vec<TransactionRecord>> {
        tracker.advance(RunState::Splitting);
        let rows = records.len();
        let chunks = split_chunks(records, self.options.chunk_size);
        info!(?mode, rows, chunks = chunks.len(), "starting run");
        tracker.advance(RunState::Running);
        chunks
    }

    fn finish(
        &self,
        mut tracker: RunTracker,
        collected: Result<PartialResults>,
        mode: ExecutionMode,
        chunk_count: usize,
    ) -> Result<ScheduledRun> {
        let merged = collected.and_then(|partials| {
            tracker.advance(RunState::Merging);
            partials.merge_in_order(self.options.sample_limit)
        });
        match merged {
            Ok(accumulator) => {
                tracker.advance(RunState::Done);
                info!(
                    records = accumulator.records_seen,
                    skipped = accumulator.skipped,
                    "run complete"
                );
                Ok(ScheduledRun {
                    accumulator,
                    mode,
                    chunk_count,
                })
            }
            Err(err) => {
                tracker.advance(RunState::Failed);
                match &err {
                    VatError::Cancelled => info!("run cancelled; partial results discarded"),
                    other => error!(error = %other, "run failed; partial results discarded"),
                }
                Err(err)
            }
        }
    }

    fn dispatch<S: OutcomeSink>(
        &self,
        pool: &rayon::ThreadPool,
        index: usize,
        chunk: Vec<TransactionRecord>,
        sink: S,
        cancel: CancelToken,
    ) {
        let config = Arc::clone(&self.config);
        let sample_limit = self.options.sample_limit;
        let work = self.work;
        debug!(chunk = index, rows = chunk.len(), "dispatching chunk");
        pool.spawn(move || {
            if cancel.is_cancelled() {
                return;
            }
            let result = run_chunk(work, index, &chunk, &config, sample_limit);
            sink.deliver(ChunkOutcome { index, result });
        });
    }
}

/// Serial strategy: one chunk per step on the calling thread.
struct SerialRun<'a> {
    scheduler: &'a Scheduler,
    chunks: std::iter::Enumerate<std::vec::IntoIter<Vec<TransactionRecord>>>,
    partials: PartialResults,
    total: usize,
}

impl<'a> SerialRun<'a> {
    fn new(scheduler: &'a Scheduler, chunks: Vec<Vec<TransactionRecord>>) -> Self {
        let total = chunks.len();
        SerialRun {
            scheduler,
            chunks: chunks.into_iter().enumerate(),
            partials: PartialResults::new(total),
            total,
        }
    }

    fn step(&mut self, cancel: &CancelToken) -> Option<Result<ProgressEvent>> {
        let (index, chunk) = self.chunks.next()?;
        if cancel.is_cancelled() {
            return Some(Err(VatError::Cancelled));
        }
        let s = self.scheduler;
        let result = run_chunk(s.work, index, &chunk, &s.config, s.options.sample_limit);
        Some(result.map(|acc| {
            self.partials.insert(index, acc);
            ProgressEvent::chunk_done(index, self.partials.completed, self.total)
        }))
    }

    fn into_partials(self) -> PartialResults {
        self.partials
    }
}

/// Parallel strategy: keeps at most one chunk per worker in flight and
/// files results by chunk index as they arrive.
struct ParallelRun<'a, S> {
    scheduler: &'a Scheduler,
    pool: &'a rayon::ThreadPool,
    /// Dropped once every chunk is dispatched, so the channel closes when
    /// the last worker lets go of its sender.
    sink: Option<S>,
    cancel: &'a CancelToken,
    pending: std::iter::Enumerate<std::vec::IntoIter<Vec<TransactionRecord>>>,
    partials: PartialResults,
    total: usize,
    in_flight: usize,
    width: usize,
}

impl<'a, S: OutcomeSink> ParallelRun<'a, S> {
    fn new(
        scheduler: &'a Scheduler,
        pool: &'a rayon::ThreadPool,
        sink: S,
        cancel: &'a CancelToken,
        chunks: Vec<Vec<TransactionRecord>>,
    ) -> Self {
        let total = chunks.len();
        ParallelRun {
            scheduler,
            pool,
            sink: Some(sink),
            cancel,
            pending: chunks.into_iter().enumerate(),
            partials: PartialResults::new(total),
            total,
            in_flight: 0,
            width: pool.current_num_threads().max(1),
        }
    }

    /// Tops the pool up to one chunk per worker.
    fn fill(&mut self) {
        while self.in_flight < self.width && !self.cancel.is_cancelled() {
            let Some(sink) = self.sink.clone() else {
                break;
            };
            let Some((index, chunk)) = self.pending.next() else {
                self.sink = None;
                break;
            };
            self.scheduler.dispatch(self.pool, index, chunk, sink, self.cancel.clone());
            self.in_flight += 1;
        }
    }

    fn is_finished(&self) -> bool {
        self.in_flight == 0
    }

    fn accept(&mut self, outcome: ChunkOutcome) -> Result<ProgressEvent> {
        self.in_flight -= 1;
        let acc = outcome.result.map_err(|err| {
            error!(chunk = outcome.index, error = %err, "worker failed");
            err
        })?;
        self.partials.insert(outcome.index, acc);
        let event = ProgressEvent::chunk_done(outcome.index, self.partials.completed, self.total);
        self.fill();
        Ok(event)
    }

    /// Every sender is gone while chunks are still outstanding.  Workers
    /// skip their chunk without reporting once the run is cancelled.
    fn lost_worker(&self) -> VatError {
        if self.cancel.is_cancelled() {
            return VatError::Cancelled;
        }
        let chunk = self
            .partials
            .slots
            .iter()
            .position(Option::is_none)
            .unwrap_or_default();
        VatError::WorkerExecution {
            chunk,
            message: "worker channel closed before all chunks reported".into(),
        }
    }

    /// All dispatched chunks have reported.  A cancelled run may have
    /// stopped dispatching early, so its partials are not complete.
    fn finish(self) -> Result<PartialResults> {
        if self.cancel.is_cancelled() {
            return Err(VatError::Cancelled);
        }
        Ok(self.partials)
    }
}
