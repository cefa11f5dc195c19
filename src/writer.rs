//! # Persistence Worker Pool
//!
//! Moves buffered samples to durable storage without stalling ingestion.
//!
//! ## Architecture
//! - **Submitters** hand over an owned payload through a rendezvous channel.
//!   With every worker busy the send blocks until one frees up, so at most
//!   `workers` writes are ever in flight.
//! - **Worker threads** write one batch each: ensure the file and header
//!   exist, probe write access, append rows. Transient failures are retried
//!   in place with a fixed delay; fatal ones are not.
//! - **Collector thread** owns the bookkeeping: consecutive-failure counter,
//!   the stash of unwritten rows, the status feed and the failure callback.
//!
//! Appends and annotation rewrites on the same destination are serialized by
//! a shared lock. An annotation first waits for every flush submitted before
//! it, then updates both the stash and the persisted rows.

use crate::broadcast::Broadcaster;
use crate::config::PipelineConfig;
use crate::error::{SessionError, StorageError};
use crate::sample::{self, Annotation, CorrectedSample};
use crate::store::FileStore;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

const LOG_TARGET: &str = "roadscan::persist";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Pending,
    Succeeded,
    Failed,
}

/// One flush of buffered samples, owned by whichever worker runs it
#[derive(Debug, Clone)]
pub struct WriteOperation {
    pub id: u64,
    pub destination: PathBuf,
    pub payload: Vec<CorrectedSample>,
    pub retry_count: u32,
    pub state: WriteState,
}

/// Events on the write-status feed
#[derive(Debug, Clone, PartialEq)]
pub enum WriteStatus {
    Flushed {
        id: u64,
        rows: usize,
        retries: u32,
    },
    Retrying {
        id: u64,
        attempt: u32,
        error: StorageError,
    },
    Failed {
        id: u64,
        rows: usize,
        error: StorageError,
        consecutive_failures: u32,
    },
    /// Access denied or storage full; later flushes are not attempted
    Fatal { id: u64, error: StorageError },
    ThresholdReached { consecutive_failures: u32 },
    Annotated { id: u64, rows_updated: usize },
    AnnotationFailed { id: u64, error: StorageError },
}

/// Snapshot handed to the failure callback
#[derive(Debug, Clone)]
pub struct FlushFailure {
    pub consecutive_failures: u32,
    pub error: StorageError,
    pub fatal: bool,
    /// Every row not yet durably stored, oldest first
    pub unwritten: Vec<CorrectedSample>,
}

pub type FailureCallback = Arc<dyn Fn(&FlushFailure) + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteStats {
    pub batches_written: u64,
    pub rows_persisted: u64,
    pub failed_batches: u64,
    pub annotations_applied: u64,
    pub consecutive_failures: u32,
    pub pending: usize,
    pub fatal: Option<StorageError>,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub workers: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub failure_threshold: u32,
}

impl From<&PipelineConfig> for PoolSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            workers: config.max_concurrent_writes,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            failure_threshold: config.failure_threshold,
        }
    }
}

enum Job {
    Flush(WriteOperation),
    Annotate {
        id: u64,
        destination: PathBuf,
        annotation: Annotation,
    },
}

enum WorkerMessage {
    Retrying {
        id: u64,
        attempt: u32,
        error: StorageError,
    },
    Flushed {
        operation: WriteOperation,
        error: Option<StorageError>,
    },
    Annotated {
        id: u64,
        result: Result<usize, StorageError>,
    },
}

#[derive(Default)]
struct Tracker {
    stats: WriteStats,
    unwritten: Vec<CorrectedSample>,
    /// Flush ids submitted but not yet recorded
    in_flight: BTreeSet<u64>,
}

#[derive(Default)]
struct Shared {
    tracker: Mutex<Tracker>,
    idle: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Tracker> {
        self.tracker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Block until every flush older than `id` has been recorded
    fn wait_for_flushes_before(&self, id: u64) -> MutexGuard<'_, Tracker> {
        let guard = self.lock();
        self.idle
            .wait_while(guard, |tracker| tracker.in_flight.range(..id).next().is_some())
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn finish_one(&self) {
        let mut tracker = self.lock();
        tracker.stats.pending = tracker.stats.pending.saturating_sub(1);
        self.idle.notify_all();
    }
}

/// Bounded pool of persistence workers
pub struct WritePool {
    job_tx: Option<Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
    collector: Option<thread::JoinHandle<()>>,
    shared: Arc<Shared>,
    next_id: u64,
}

impl WritePool {
    pub fn new(
        settings: PoolSettings,
        store: Arc<dyn FileStore>,
        status: Arc<Broadcaster<WriteStatus>>,
        on_failure: Option<FailureCallback>,
    ) -> Self {
        let (job_tx, job_rx) = bounded::<Job>(0);
        let (result_tx, result_rx) = unbounded();
        let destination_lock = Arc::new(Mutex::new(()));
        let shared = Arc::new(Shared::default());

        let workers = (0..settings.workers.max(1))
            .map(|_| {
                let jobs = job_rx.clone();
                let results = result_tx.clone();
                let store = store.clone();
                let lock = destination_lock.clone();
                let shared = shared.clone();
                let settings = settings.clone();
                thread::spawn(move || {
                    Self::worker_loop(jobs, results, store.as_ref(), &lock, &shared, &settings);
                })
            })
            .collect();
        drop(result_tx);

        let collector_shared = shared.clone();
        let threshold = settings.failure_threshold;
        let collector = thread::spawn(move || {
            Self::collector_loop(result_rx, &collector_shared, &status, on_failure, threshold);
        });

        log::debug!(
            target: LOG_TARGET,
            "Started {} persistence workers",
            settings.workers.max(1)
        );

        WritePool {
            job_tx: Some(job_tx),
            workers,
            collector: Some(collector),
            shared,
            next_id: 1,
        }
    }

    /// Queue a batch for writing, blocking while every worker is busy.
    ///
    /// After a fatal storage error the payload goes straight to the unwritten
    /// stash instead.
    pub fn submit_flush(
        &mut self,
        destination: &Path,
        payload: Vec<CorrectedSample>,
    ) -> Result<u64, SessionError> {
        let id = self.allocate_id();
        {
            let mut tracker = self.shared.lock();
            if let Some(fatal) = tracker.stats.fatal.clone() {
                tracker.unwritten.extend(payload);
                return Err(SessionError::Storage(fatal));
            }
            tracker.stats.pending += 1;
            tracker.in_flight.insert(id);
        }

        let operation = WriteOperation {
            id,
            destination: destination.to_path_buf(),
            payload,
            retry_count: 0,
            state: WriteState::Pending,
        };
        log::debug!(
            target: LOG_TARGET,
            "Submitting write {} ({} rows)",
            id,
            operation.payload.len()
        );
        self.send(Job::Flush(operation))?;
        Ok(id)
    }

    /// Queue a late classification of rows that already left the buffer.
    ///
    /// Runs once every earlier flush has finished, so rows of a batch still
    /// being written are covered, and rows parked in the unwritten stash are
    /// updated as well.
    pub fn submit_annotation(
        &mut self,
        destination: &Path,
        annotation: Annotation,
    ) -> Result<u64, SessionError> {
        let id = self.allocate_id();
        self.shared.lock().stats.pending += 1;
        self.send(Job::Annotate {
            id,
            destination: destination.to_path_buf(),
            annotation,
        })?;
        Ok(id)
    }

    /// Block until nothing is pending or `timeout` passes; true when idle
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let guard = self.shared.lock();
        let (guard, _) = self
            .shared
            .idle
            .wait_timeout_while(guard, timeout, |tracker| tracker.stats.pending > 0)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.stats.pending == 0
    }

    pub fn stats(&self) -> WriteStats {
        self.shared.lock().stats.clone()
    }

    pub fn unwritten(&self) -> Vec<CorrectedSample> {
        self.shared.lock().unwritten.clone()
    }

    pub fn take_unwritten(&self) -> Vec<CorrectedSample> {
        std::mem::take(&mut self.shared.lock().unwritten)
    }

    /// Stop accepting work and join every thread. Writes already handed to a
    /// worker finish (including their retries) first.
    pub fn shutdown(&mut self) {
        if self.job_tx.take().is_none() {
            return;
        }

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!(target: LOG_TARGET, "Persistence worker panicked");
            }
        }
        if let Some(handle) = self.collector.take() {
            if handle.join().is_err() {
                log::error!(target: LOG_TARGET, "Persistence collector panicked");
            }
        }
        log::debug!(target: LOG_TARGET, "Persistence workers stopped");
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn send(&self, job: Job) -> Result<(), SessionError> {
        let result = match &self.job_tx {
            Some(tx) => tx.send(job).map_err(|e| e.into_inner()),
            None => Err(job),
        };

        match result {
            Ok(()) => Ok(()),
            Err(job) => {
                let mut tracker = self.shared.lock();
                tracker.stats.pending = tracker.stats.pending.saturating_sub(1);
                if let Job::Flush(operation) = job {
                    tracker.in_flight.remove(&operation.id);
                    tracker.unwritten.extend(operation.payload);
                }
                self.shared.idle.notify_all();
                Err(SessionError::WritePoolClosed)
            }
        }
    }

    fn worker_loop(
        jobs: Receiver<Job>,
        results: Sender<WorkerMessage>,
        store: &dyn FileStore,
        destination_lock: &Mutex<()>,
        shared: &Shared,
        settings: &PoolSettings,
    ) {
        for job in jobs.iter() {
            let message = match job {
                Job::Flush(mut operation) => {
                    let (result, retries) = with_retries(settings, operation.id, &results, || {
                        write_batch(store, destination_lock, &operation)
                    });
                    operation.retry_count = retries;
                    match result {
                        Ok(_) => {
                            operation.state = WriteState::Succeeded;
                            WorkerMessage::Flushed {
                                operation,
                                error: None,
                            }
                        }
                        Err(error) => {
                            operation.state = WriteState::Failed;
                            WorkerMessage::Flushed {
                                operation,
                                error: Some(error),
                            }
                        }
                    }
                }
                Job::Annotate {
                    id,
                    destination,
                    annotation,
                } => {
                    let stashed = {
                        let mut tracker = shared.wait_for_flushes_before(id);
                        annotation.apply_all(&mut tracker.unwritten)
                    };
                    let (result, _) = with_retries(settings, id, &results, || {
                        let _guard = destination_lock
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                        rewrite_annotation(store, &destination, &annotation)
                    });
                    WorkerMessage::Annotated {
                        id,
                        result: result.map(|on_disk| on_disk + stashed),
                    }
                }
            };

            if results.send(message).is_err() {
                break;
            }
        }
    }

    fn collector_loop(
        results: Receiver<WorkerMessage>,
        shared: &Shared,
        status: &Broadcaster<WriteStatus>,
        on_failure: Option<FailureCallback>,
        failure_threshold: u32,
    ) {
        for message in results.iter() {
            match message {
                WorkerMessage::Retrying { id, attempt, error } => {
                    status.publish(WriteStatus::Retrying { id, attempt, error });
                }
                WorkerMessage::Flushed { operation, error } => {
                    let (events, failure) = record_flush(shared, operation, error, failure_threshold);
                    for event in events {
                        status.publish(event);
                    }
                    if let (Some(failure), Some(callback)) = (failure, on_failure.as_ref()) {
                        callback(&failure);
                    }
                    shared.finish_one();
                }
                WorkerMessage::Annotated { id, result } => {
                    match result {
                        Ok(rows_updated) => {
                            shared.lock().stats.annotations_applied += 1;
                            log::info!(
                                target: LOG_TARGET,
                                "Annotation {} updated {} stored rows",
                                id,
                                rows_updated
                            );
                            status.publish(WriteStatus::Annotated { id, rows_updated });
                        }
                        Err(error) => {
                            log::error!(target: LOG_TARGET, "Annotation {} failed: {}", id, error);
                            status.publish(WriteStatus::AnnotationFailed { id, error });
                        }
                    }
                    shared.finish_one();
                }
            }
        }
    }
}

impl Drop for WritePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Update counters for a finished flush; returns the events to publish and
/// the callback payload if the caller must be told
fn record_flush(
    shared: &Shared,
    operation: WriteOperation,
    error: Option<StorageError>,
    failure_threshold: u32,
) -> (Vec<WriteStatus>, Option<FlushFailure>) {
    let mut tracker = shared.lock();
    let id = operation.id;
    let rows = operation.payload.len();
    tracker.in_flight.remove(&id);

    let Some(error) = error else {
        tracker.stats.batches_written += 1;
        tracker.stats.rows_persisted += rows as u64;
        tracker.stats.consecutive_failures = 0;
        log::debug!(
            target: LOG_TARGET,
            "Write {} stored {} rows to {}",
            id,
            rows,
            operation.destination.display()
        );
        return (
            vec![WriteStatus::Flushed {
                id,
                rows,
                retries: operation.retry_count,
            }],
            None,
        );
    };

    tracker.stats.failed_batches += 1;
    tracker.stats.consecutive_failures += 1;
    tracker.unwritten.extend(operation.payload);
    let consecutive_failures = tracker.stats.consecutive_failures;

    let mut events = Vec::new();
    let mut notify = false;
    if error.is_fatal() {
        log::error!(target: LOG_TARGET, "Write {} hit a fatal storage error: {}", id, error);
        tracker.stats.fatal = Some(error.clone());
        events.push(WriteStatus::Fatal {
            id,
            error: error.clone(),
        });
        notify = true;
    } else {
        log::error!(
            target: LOG_TARGET,
            "Write {} failed after {} retries: {}",
            id,
            operation.retry_count,
            error
        );
        events.push(WriteStatus::Failed {
            id,
            rows,
            error: error.clone(),
            consecutive_failures,
        });
        if consecutive_failures >= failure_threshold {
            if consecutive_failures == failure_threshold {
                log::error!(
                    target: LOG_TARGET,
                    "{} consecutive flushes failed, {} rows unwritten",
                    consecutive_failures,
                    tracker.unwritten.len()
                );
                events.push(WriteStatus::ThresholdReached {
                    consecutive_failures,
                });
            }
            notify = true;
        }
    }

    let failure = notify.then(|| FlushFailure {
        consecutive_failures,
        error,
        fatal: tracker.stats.fatal.is_some(),
        unwritten: tracker.unwritten.clone(),
    });
    (events, failure)
}

/// Run `attempt` until it succeeds, fails non-transiently or runs out of
/// retries. Returns the last result and the number of retries used.
fn with_retries<T>(
    settings: &PoolSettings,
    id: u64,
    results: &Sender<WorkerMessage>,
    mut attempt: impl FnMut() -> Result<T, StorageError>,
) -> (Result<T, StorageError>, u32) {
    let mut retries = 0;
    loop {
        match attempt() {
            Ok(value) => return (Ok(value), retries),
            Err(error) if error.is_retryable() && retries < settings.max_retries => {
                retries += 1;
                log::warn!(
                    target: LOG_TARGET,
                    "Write {} failed ({}), retry {}/{}",
                    id,
                    error,
                    retries,
                    settings.max_retries
                );
                let _ = results.send(WorkerMessage::Retrying {
                    id,
                    attempt: retries,
                    error,
                });
                thread::sleep(settings.retry_delay);
            }
            Err(error) => return (Err(error), retries),
        }
    }
}

fn write_batch(
    store: &dyn FileStore,
    destination_lock: &Mutex<()>,
    operation: &WriteOperation,
) -> Result<usize, StorageError> {
    let destination = &operation.destination;
    if let Some(parent) = destination.parent() {
        store.create_dir_all(parent)?;
    }

    // Disposable probe so a read-only or full volume fails before the data file is touched
    let probe = destination.with_file_name(format!(".probe-{}", operation.id));
    store.append(&probe, "probe")?;
    store.remove(&probe)?;

    let rows = sample::encode_rows(&operation.payload)?;

    let _guard = destination_lock
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if !store.exists(destination) {
        store.append(destination, &sample::header_line()?)?;
    }
    store.append(destination, &rows)?;
    Ok(operation.payload.len())
}

/// Rewrite the event flag and feedback of persisted rows inside the
/// annotation window. Returns how many rows changed; a missing file
/// changes nothing.
pub fn rewrite_annotation(
    store: &dyn FileStore,
    destination: &Path,
    annotation: &Annotation,
) -> Result<usize, StorageError> {
    if !store.exists(destination) {
        return Ok(0);
    }

    let text = store.read_to_string(destination)?;
    let mut rows = sample::parse_rows(&text)?;

    let updated = annotation.apply_all(&mut rows);
    if updated > 0 {
        let mut contents = sample::header_line()?;
        contents.push_str(&sample::encode_rows(&rows)?);
        store.overwrite(destination, &contents)?;
    }
    Ok(updated)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::FsStore;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tempfile::tempdir;

    /// In-memory store with scripted failures on data-file appends
    #[derive(Default)]
    pub(crate) struct ScriptedStore {
        files: Mutex<HashMap<PathBuf, String>>,
        failures: Mutex<VecDeque<StorageError>>,
        always_fail: Mutex<Option<StorageError>>,
        probe_delay: Option<Duration>,
        active_probes: AtomicUsize,
        max_active_probes: AtomicUsize,
    }

    impl ScriptedStore {
        pub(crate) fn failing_next(errors: Vec<StorageError>) -> Self {
            Self {
                failures: Mutex::new(errors.into()),
                ..Self::default()
            }
        }

        pub(crate) fn always_failing(error: StorageError) -> Self {
            Self {
                always_fail: Mutex::new(Some(error)),
                ..Self::default()
            }
        }

        fn slow_probes(delay: Duration) -> Self {
            Self {
                probe_delay: Some(delay),
                ..Self::default()
            }
        }

        pub(crate) fn contents(&self, path: &Path) -> Option<String> {
            self.files.lock().unwrap().get(path).cloned()
        }

        fn is_probe(path: &Path) -> bool {
            path.file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with(".probe-"))
        }
    }

    impl FileStore for ScriptedStore {
        fn create_dir_all(&self, _path: &Path) -> Result<(), StorageError> {
            Ok(())
        }

        fn exists(&self, path: &Path) -> bool {
            self.files.lock().unwrap().contains_key(path)
        }

        fn append(&self, path: &Path, text: &str) -> Result<(), StorageError> {
            if Self::is_probe(path) {
                let active = self.active_probes.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_active_probes.fetch_max(active, Ordering::SeqCst);
                if let Some(delay) = self.probe_delay {
                    thread::sleep(delay);
                }
                self.active_probes.fetch_sub(1, Ordering::SeqCst);
                return Ok(());
            }

            if let Some(error) = self.always_fail.lock().unwrap().clone() {
                return Err(error);
            }
            if let Some(error) = self.failures.lock().unwrap().pop_front() {
                return Err(error);
            }

            self.files
                .lock()
                .unwrap()
                .entry(path.to_path_buf())
                .or_default()
                .push_str(text);
            Ok(())
        }

        fn read_to_string(&self, path: &Path) -> Result<String, StorageError> {
            self.contents(path)
                .ok_or_else(|| StorageError::TransientIo("missing".to_string()))
        }

        fn overwrite(&self, path: &Path, text: &str) -> Result<(), StorageError> {
            self.files
                .lock()
                .unwrap()
                .insert(path.to_path_buf(), text.to_string());
            Ok(())
        }

        fn remove(&self, path: &Path) -> Result<(), StorageError> {
            self.files.lock().unwrap().remove(path);
            Ok(())
        }
    }

    pub(crate) fn rows(start_ms: i64, count: usize) -> Vec<CorrectedSample> {
        (0..count)
            .map(|i| CorrectedSample {
                relative_timestamp_ms: start_ms + i as i64 * 10,
                accel_x: 0.0,
                accel_y: 0.0,
                accel_z: 9.81,
                accel_magnitude: 9.81,
                gyro_x: 0.0,
                gyro_y: 0.0,
                gyro_z: 0.0,
                is_event: false,
                user_feedback: String::new(),
            })
            .collect()
    }

    fn settings() -> PoolSettings {
        PoolSettings {
            workers: 3,
            max_retries: 2,
            retry_delay: Duration::from_millis(5),
            failure_threshold: 3,
        }
    }

    fn transient() -> StorageError {
        StorageError::TransientIo("busy".to_string())
    }

    #[test]
    fn test_batches_land_with_single_header() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("session").join("sensor_data.csv");
        let status = Arc::new(Broadcaster::new());
        let mut pool = WritePool::new(settings(), Arc::new(FsStore), status, None);

        pool.submit_flush(&dest, rows(0, 300)).unwrap();
        pool.submit_flush(&dest, rows(3_000, 300)).unwrap();
        assert!(pool.wait_idle(Duration::from_secs(5)));
        pool.shutdown();

        let text = std::fs::read_to_string(&dest).unwrap();
        assert_eq!(text.matches("timestamp_ms").count(), 1);
        let mut parsed = sample::parse_rows(&text).unwrap();
        assert_eq!(parsed.len(), 600);

        // Batches may land in either order, but no row is lost or duplicated
        parsed.sort_by_key(|row| row.relative_timestamp_ms);
        parsed.dedup_by_key(|row| row.relative_timestamp_ms);
        assert_eq!(parsed.len(), 600);

        let stats = pool.stats();
        assert_eq!(stats.rows_persisted, 600);
        assert_eq!(stats.batches_written, 2);
        assert_eq!(stats.pending, 0);
        assert!(!dir.path().join("session").join(".probe-1").exists());
    }

    #[test]
    fn test_in_flight_writes_are_bounded() {
        let store = Arc::new(ScriptedStore::slow_probes(Duration::from_millis(30)));
        let status = Arc::new(Broadcaster::new());
        let mut pool = WritePool::new(settings(), store.clone(), status, None);
        let dest = PathBuf::from("/virtual/sensor_data.csv");

        for i in 0..9 {
            pool.submit_flush(&dest, rows(i * 1_000, 10)).unwrap();
        }
        assert!(pool.wait_idle(Duration::from_secs(5)));

        let max = store.max_active_probes.load(Ordering::SeqCst);
        assert!(max >= 1 && max <= 3, "max in flight was {}", max);
        assert_eq!(pool.stats().rows_persisted, 90);
    }

    #[test]
    fn test_transient_failure_is_retried() {
        let store = Arc::new(ScriptedStore::failing_next(vec![transient(), transient()]));
        let status = Arc::new(Broadcaster::new());
        let events = status.subscribe();
        let mut pool = WritePool::new(
            PoolSettings {
                workers: 1,
                ..settings()
            },
            store.clone(),
            status,
            None,
        );
        let dest = PathBuf::from("/virtual/sensor_data.csv");

        let id = pool.submit_flush(&dest, rows(0, 5)).unwrap();
        assert!(pool.wait_idle(Duration::from_secs(5)));

        let seen: Vec<_> = events.try_iter().collect();
        let retries = seen
            .iter()
            .filter(|e| matches!(e, WriteStatus::Retrying { .. }))
            .count();
        assert_eq!(retries, 2);
        assert!(seen.contains(&WriteStatus::Flushed {
            id,
            rows: 5,
            retries: 2
        }));
        assert!(pool.unwritten().is_empty());
        // The two failures consumed both scripted errors on the header append
        assert!(store.contents(&dest).unwrap().starts_with("timestamp_ms"));
    }

    #[test]
    fn test_threshold_invokes_callback_and_keeps_rows() {
        let store = Arc::new(ScriptedStore::always_failing(transient()));
        let status = Arc::new(Broadcaster::new());
        let events = status.subscribe();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let callback: FailureCallback = Arc::new(move |failure: &FlushFailure| {
            sink.lock().unwrap().push(failure.clone());
        });

        let mut pool = WritePool::new(
            PoolSettings {
                workers: 1,
                ..settings()
            },
            store,
            status,
            Some(callback),
        );
        let dest = PathBuf::from("/virtual/sensor_data.csv");

        for i in 0..2 {
            pool.submit_flush(&dest, rows(i * 100, 4)).unwrap();
        }
        assert!(pool.wait_idle(Duration::from_secs(5)));
        assert!(calls.lock().unwrap().is_empty());

        pool.submit_flush(&dest, rows(200, 4)).unwrap();
        assert!(pool.wait_idle(Duration::from_secs(5)));

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].consecutive_failures, 3);
        assert!(!calls[0].fatal);
        assert_eq!(calls[0].unwritten.len(), 12);

        let seen: Vec<_> = events.try_iter().collect();
        assert!(seen.contains(&WriteStatus::ThresholdReached {
            consecutive_failures: 3
        }));
        let stats = pool.stats();
        assert_eq!(stats.failed_batches, 3);
        assert_eq!(stats.rows_persisted, 0);
        assert_eq!(pool.take_unwritten().len(), 12);
        assert!(pool.unwritten().is_empty());
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let store = Arc::new(ScriptedStore::failing_next(vec![
            transient(),
            transient(),
            transient(),
        ]));
        let status = Arc::new(Broadcaster::new());
        let mut pool = WritePool::new(
            PoolSettings {
                workers: 1,
                ..settings()
            },
            store,
            status,
            None,
        );
        let dest = PathBuf::from("/virtual/sensor_data.csv");

        pool.submit_flush(&dest, rows(0, 3)).unwrap();
        assert!(pool.wait_idle(Duration::from_secs(5)));
        assert_eq!(pool.stats().consecutive_failures, 1);

        pool.submit_flush(&dest, rows(100, 3)).unwrap();
        assert!(pool.wait_idle(Duration::from_secs(5)));
        let stats = pool.stats();
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.rows_persisted, 3);
        assert_eq!(pool.unwritten().len(), 3);
    }

    #[test]
    fn test_fatal_error_is_not_retried() {
        let store = Arc::new(ScriptedStore::always_failing(StorageError::AccessDenied(
            "read-only".to_string(),
        )));
        let status = Arc::new(Broadcaster::new());
        let events = status.subscribe();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let callback: FailureCallback = Arc::new(move |failure: &FlushFailure| {
            assert!(failure.fatal);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut pool = WritePool::new(settings(), store, status, Some(callback));
        let dest = PathBuf::from("/virtual/sensor_data.csv");

        let started = Instant::now();
        pool.submit_flush(&dest, rows(0, 4)).unwrap();
        assert!(pool.wait_idle(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));

        let seen: Vec<_> = events.try_iter().collect();
        assert!(!seen.iter().any(|e| matches!(e, WriteStatus::Retrying { .. })));
        assert!(seen.iter().any(|e| matches!(e, WriteStatus::Fatal { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Later batches are stashed without touching the store
        let result = pool.submit_flush(&dest, rows(100, 4));
        assert!(matches!(result, Err(SessionError::Storage(_))));
        assert_eq!(pool.unwritten().len(), 8);
    }

    #[test]
    fn test_annotation_rewrites_persisted_rows() {
        let store = Arc::new(ScriptedStore::default());
        let status = Arc::new(Broadcaster::new());
        let events = status.subscribe();
        let mut pool = WritePool::new(settings(), store.clone(), status, None);
        let dest = PathBuf::from("/virtual/sensor_data.csv");

        pool.submit_flush(&dest, rows(0, 100)).unwrap();
        assert!(pool.wait_idle(Duration::from_secs(5)));

        let id = pool
            .submit_annotation(
                &dest,
                Annotation {
                    timestamp_ms: 500,
                    window_ms: 20,
                    is_event: true,
                    feedback: "speed bump, \"large\"".to_string(),
                },
            )
            .unwrap();
        assert!(pool.wait_idle(Duration::from_secs(5)));
        assert!(events.try_iter().any(|e| e
            == WriteStatus::Annotated {
                id,
                rows_updated: 5
            }));

        let parsed = sample::parse_rows(&store.contents(&dest).unwrap()).unwrap();
        assert_eq!(parsed.len(), 100);
        let flagged: Vec<_> = parsed.iter().filter(|r| r.is_event).collect();
        assert_eq!(flagged.len(), 5);
        assert!(flagged
            .iter()
            .all(|r| (480..=520).contains(&r.relative_timestamp_ms)));
        assert_eq!(flagged[0].user_feedback, "speed bump, \"large\"");
        assert_eq!(pool.stats().annotations_applied, 1);
    }

    fn pothole(timestamp_ms: i64) -> Annotation {
        Annotation {
            timestamp_ms,
            window_ms: 20,
            is_event: true,
            feedback: "pothole".to_string(),
        }
    }

    #[test]
    fn test_annotation_waits_for_earlier_batch() {
        // The batch is still probing when the annotation is submitted
        let store = Arc::new(ScriptedStore::slow_probes(Duration::from_millis(100)));
        let status = Arc::new(Broadcaster::new());
        let events = status.subscribe();
        let mut pool = WritePool::new(settings(), store.clone(), status, None);
        let dest = PathBuf::from("/virtual/sensor_data.csv");

        pool.submit_flush(&dest, rows(0, 100)).unwrap();
        let id = pool.submit_annotation(&dest, pothole(500)).unwrap();
        assert!(pool.wait_idle(Duration::from_secs(5)));

        assert!(events.try_iter().any(|e| e
            == WriteStatus::Annotated {
                id,
                rows_updated: 5
            }));
        let parsed = sample::parse_rows(&store.contents(&dest).unwrap()).unwrap();
        assert_eq!(parsed.len(), 100);
        assert_eq!(
            parsed
                .iter()
                .filter(|r| r.is_event && r.user_feedback == "pothole")
                .count(),
            5
        );
    }

    #[test]
    fn test_annotation_reaches_unwritten_rows() {
        let store = Arc::new(ScriptedStore::always_failing(transient()));
        let status = Arc::new(Broadcaster::new());
        let events = status.subscribe();
        let mut pool = WritePool::new(
            PoolSettings {
                workers: 1,
                ..settings()
            },
            store,
            status,
            None,
        );
        let dest = PathBuf::from("/virtual/sensor_data.csv");

        pool.submit_flush(&dest, rows(0, 100)).unwrap();
        let id = pool.submit_annotation(&dest, pothole(500)).unwrap();
        assert!(pool.wait_idle(Duration::from_secs(5)));

        assert!(events.try_iter().any(|e| e
            == WriteStatus::Annotated {
                id,
                rows_updated: 5
            }));
        let stashed = pool.take_unwritten();
        assert_eq!(stashed.len(), 100);
        let flagged: Vec<i64> = stashed
            .iter()
            .filter(|r| r.is_event)
            .map(|r| r.relative_timestamp_ms)
            .collect();
        assert_eq!(flagged, vec![480, 490, 500, 510, 520]);
        assert_eq!(stashed[50].user_feedback, "pothole");
    }

    #[test]
    fn test_rewrite_annotation_on_missing_file() {
        let store = ScriptedStore::default();
        let annotation = Annotation {
            timestamp_ms: 0,
            window_ms: 10,
            is_event: false,
            feedback: String::new(),
        };
        let updated =
            rewrite_annotation(&store, Path::new("/virtual/none.csv"), &annotation).unwrap();
        assert_eq!(updated, 0);
    }

    #[test]
    fn test_submit_after_shutdown_keeps_rows() {
        let status = Arc::new(Broadcaster::new());
        let mut pool = WritePool::new(settings(), Arc::new(ScriptedStore::default()), status, None);
        pool.shutdown();

        let result = pool.submit_flush(Path::new("/virtual/x.csv"), rows(0, 7));
        assert!(matches!(result, Err(SessionError::WritePoolClosed)));
        assert_eq!(pool.unwritten().len(), 7);
        assert!(pool.wait_idle(Duration::from_millis(10)));
    }
}
