//! # Recording Session Module
//!
//! Owns the lifecycle of one recording: sensor subscription, conditioning,
//! detection, buffering and hand-off to the persistence workers.
//!
//! ## Architecture
//! - **SessionRecorder**: start/stop/annotate API used by the caller
//! - **Ingest thread**: receives sensor samples and recorder commands; runs the
//!   `Pipeline` synchronously, one sample at a time
//! - **Pipeline**: conditioning → detection → buffer → flush to `WritePool`
//! - **WritePool**: background workers doing the actual file I/O
//!
//! ## Session Layout
//! ```text
//! <output_dir>/session_YYYYMMDD_HHMMSS/
//! ├── sensor_data.csv   (header + one row per conditioned sample)
//! └── session.toml      (stamps, counters, calibration used)
//! ```
//!
//! ## Stop Order
//! 1. Unsubscribe from the sensor
//! 2. Flush whatever is buffered, even a short batch
//! 3. Wait for pending writes up to `stop_timeout_ms`
//! 4. Join the workers and build the `SessionReport`

use crate::broadcast::Broadcaster;
use crate::conditioner::SignalConditioner;
use crate::config::{Config, SignalConfig};
use crate::detector::SpikeDetector;
use crate::error::{SampleStreamError, SessionError, StorageError};
use crate::profile::{CalibrationProfile, Orientation, SessionCalibration};
use crate::sample::{Annotation, CorrectedSample, RawSample};
use crate::sensor::{SensorHub, Subscription};
use crate::store::FileStore;
use crate::timesync::{SessionClock, SessionStamps, TimeSync};
use crate::writer::{self, FailureCallback, FlushFailure, PoolSettings, WritePool, WriteStatus};
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const DATA_FILE: &str = "sensor_data.csv";
pub const METADATA_FILE: &str = "session.toml";

const LOG_TARGET: &str = "roadscan::session";

/// Item on the conditioned-sample feed
pub type SampleFeed = Result<CorrectedSample, SampleStreamError>;

/// Where a session writes
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub session_id: String,
    pub directory: PathBuf,
    pub data_file: PathBuf,
}

/// Stored profile plus the adjustment measured right before recording
#[derive(Debug, Clone, PartialEq)]
pub struct Correction {
    pub profile: CalibrationProfile,
    pub session: SessionCalibration,
}

/// Outcome of a stopped session
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub info: SessionInfo,
    pub samples_ingested: u64,
    pub rows_persisted: u64,
    pub events_detected: u64,
    pub stream_errors: u64,
    pub failed_batches: u64,
    pub all_writes_succeeded: bool,
    /// Pending writes outlived the stop timeout
    pub timed_out: bool,
    pub sampling_rate_hz: f64,
    pub stamps: SessionStamps,
    /// Rows that never reached storage
    pub unwritten: Vec<CorrectedSample>,
}

#[derive(Serialize)]
struct SessionMetadata<'a> {
    session_id: &'a str,
    data_file: &'a str,
    orientation: Orientation,
    event_threshold: f64,
    samples_ingested: u64,
    rows_persisted: u64,
    events_detected: u64,
    sampling_rate_hz: f64,
    all_writes_succeeded: bool,
    timed_out: bool,
    stamps: &'a SessionStamps,
}

/// Shared output feeds, alive across sessions
#[derive(Clone, Default)]
pub struct Feeds {
    pub samples: Arc<Broadcaster<SampleFeed>>,
    pub status: Arc<Broadcaster<WriteStatus>>,
}

/// Conditioner and detector, carried over from one session to the next
#[derive(Debug, Clone)]
pub struct Stages {
    pub conditioner: SignalConditioner,
    pub detector: SpikeDetector,
}

impl Stages {
    pub fn new(config: &SignalConfig) -> Result<Self, SessionError> {
        Ok(Self {
            conditioner: SignalConditioner::new(config.ema_alpha)?,
            detector: SpikeDetector::new(config.default_event_threshold, config.refractory_ms),
        })
    }

    /// Forget filter memory and the last event, then detect at `threshold`
    pub fn rearm(&mut self, threshold: f64, refractory_ms: i64) {
        self.conditioner.reset();
        self.detector.initialize(threshold, refractory_ms);
    }
}

/// Synchronous per-sample core of a session
pub struct Pipeline {
    info: SessionInfo,
    capacity: usize,
    stop_timeout: Duration,
    buffer: Vec<CorrectedSample>,
    stages: Stages,
    correction: Correction,
    pool: WritePool,
    store: Arc<dyn FileStore>,
    clock: SessionClock,
    samples: Arc<Broadcaster<SampleFeed>>,
    first_device_ts: Option<i64>,
    last_relative_ts: i64,
    samples_ingested: u64,
    events_detected: u64,
    stream_errors: u64,
    flushes_submitted: u64,
}

impl Pipeline {
    /// `stages` are re-armed for this session before the first sample
    pub fn new(
        config: &Config,
        info: SessionInfo,
        correction: Correction,
        mut stages: Stages,
        clock: SessionClock,
        store: Arc<dyn FileStore>,
        feeds: Feeds,
        on_failure: Option<FailureCallback>,
    ) -> Self {
        stages.rearm(correction.session.event_threshold, config.signal.refractory_ms);
        let pool = WritePool::new(
            PoolSettings::from(&config.pipeline),
            store.clone(),
            feeds.status,
            on_failure,
        );

        Self {
            info,
            capacity: config.pipeline.buffer_capacity,
            stop_timeout: config.pipeline.stop_timeout(),
            buffer: Vec::with_capacity(config.pipeline.buffer_capacity),
            stages,
            correction,
            pool,
            store,
            clock,
            samples: feeds.samples,
            first_device_ts: None,
            last_relative_ts: 0,
            samples_ingested: 0,
            events_detected: 0,
            stream_errors: 0,
            flushes_submitted: 0,
        }
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn buffered(&self) -> &[CorrectedSample] {
        &self.buffer
    }

    pub fn pool(&self) -> &WritePool {
        &self.pool
    }

    /// Condition, classify and buffer one sample
    pub fn ingest(&mut self, raw: RawSample) -> CorrectedSample {
        let first = *self.first_device_ts.get_or_insert(raw.device_timestamp_ms);
        // Device clock steps backwards must not reorder rows
        let relative = (raw.device_timestamp_ms - first).max(self.last_relative_ts);
        self.last_relative_ts = relative;

        let mut sample = self.stages.conditioner.condition(
            &raw,
            relative,
            &self.correction.profile,
            &self.correction.session,
        );
        sample.is_event = self.stages.detector.detect(&sample);
        if sample.is_event {
            self.events_detected += 1;
            log::info!(
                target: LOG_TARGET,
                "Event at {} ms (magnitude {:.2})",
                relative,
                sample.accel_magnitude
            );
        }

        self.samples_ingested += 1;
        self.samples.publish(Ok(sample.clone()));
        self.buffer.push(sample.clone());
        if self.buffer.len() >= self.capacity {
            self.force_flush();
        }
        sample
    }

    pub fn stream_error(&mut self, error: SampleStreamError) {
        self.stream_errors += 1;
        log::warn!(target: LOG_TARGET, "{}", error);
        self.samples.publish(Err(error));
    }

    /// Hand the current buffer to the workers, however short
    pub fn force_flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let payload = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.capacity));
        self.flushes_submitted += 1;
        if let Err(e) = self.pool.submit_flush(&self.info.data_file, payload) {
            log::error!(target: LOG_TARGET, "Flush not written: {}", e);
        }
    }

    /// Apply a late classification. Buffered rows change in place; if the
    /// window reaches past the oldest buffered row, the rows already handed
    /// to the workers (written, in flight or stashed) are updated too.
    /// Returns the number of buffered rows changed.
    pub fn annotate(&mut self, annotation: Annotation) -> usize {
        let updated = annotation.apply_all(&mut self.buffer);

        let reaches_disk = self
            .buffer
            .first()
            .map_or(true, |oldest| annotation.window_start() < oldest.relative_timestamp_ms);

        log::debug!(
            target: LOG_TARGET,
            "Annotation at {} ms updated {} buffered rows",
            annotation.timestamp_ms,
            updated
        );

        if reaches_disk && self.flushes_submitted > 0 {
            if let Err(e) = self.pool.submit_annotation(&self.info.data_file, annotation) {
                log::error!(target: LOG_TARGET, "Annotation not written: {}", e);
            }
        }
        updated
    }

    /// Final flush, drain the workers and summarize
    pub fn finish(self) -> SessionReport {
        self.finish_with_stages().0
    }

    /// Like `finish`, also handing back the stages for the next session
    pub fn finish_with_stages(mut self) -> (SessionReport, Stages) {
        self.force_flush();

        let timed_out = !self.pool.wait_idle(self.stop_timeout);
        if timed_out {
            log::warn!(
                target: LOG_TARGET,
                "{} writes still pending after {:?}",
                self.pool.stats().pending,
                self.stop_timeout
            );
        }
        self.pool.shutdown();
        self.clock.stop();

        let stats = self.pool.stats();
        let unwritten = self.pool.take_unwritten();
        let elapsed = self.clock.elapsed().as_secs_f64();
        let sampling_rate_hz = if elapsed > 0.0 {
            stats.rows_persisted as f64 / elapsed
        } else {
            0.0
        };
        let all_writes_succeeded =
            stats.failed_batches == 0 && stats.fatal.is_none() && unwritten.is_empty();

        let report = SessionReport {
            info: self.info.clone(),
            samples_ingested: self.samples_ingested,
            rows_persisted: stats.rows_persisted,
            events_detected: self.events_detected,
            stream_errors: self.stream_errors,
            failed_batches: stats.failed_batches,
            all_writes_succeeded,
            timed_out,
            sampling_rate_hz,
            stamps: self.clock.stamps().clone(),
            unwritten,
        };

        if let Err(e) = self.write_metadata(&report) {
            log::warn!(target: LOG_TARGET, "Could not write session metadata: {}", e);
        }
        (report, self.stages)
    }

    fn write_metadata(&self, report: &SessionReport) -> Result<(), StorageError> {
        let metadata = SessionMetadata {
            session_id: &report.info.session_id,
            data_file: DATA_FILE,
            orientation: self.correction.profile.orientation,
            event_threshold: self.stages.detector.threshold(),
            samples_ingested: report.samples_ingested,
            rows_persisted: report.rows_persisted,
            events_detected: report.events_detected,
            sampling_rate_hz: report.sampling_rate_hz,
            all_writes_succeeded: report.all_writes_succeeded,
            timed_out: report.timed_out,
            stamps: &report.stamps,
        };
        let text = toml::to_string_pretty(&metadata)
            .map_err(|e| StorageError::Corrupt(format!("session metadata: {}", e)))?;
        self.store
            .overwrite(&report.info.directory.join(METADATA_FILE), &text)
    }
}

enum IngestCommand {
    Annotate(Annotation),
    ForceFlush,
    Stop,
}

struct ActiveSession {
    info: SessionInfo,
    command_tx: Sender<IngestCommand>,
    ingest_thread: thread::JoinHandle<(SessionReport, Stages)>,
}

/// Records sessions, one at a time
pub struct SessionRecorder {
    config: Config,
    store: Arc<dyn FileStore>,
    time_sync: Option<TimeSync>,
    feeds: Feeds,
    on_failure: Option<FailureCallback>,
    /// Returned by the previous session's ingest thread
    stages: Option<Stages>,
    active: Option<ActiveSession>,
}

impl SessionRecorder {
    pub fn new(config: Config, store: Arc<dyn FileStore>) -> Self {
        Self {
            config,
            store,
            time_sync: None,
            feeds: Feeds::default(),
            on_failure: None,
            stages: None,
            active: None,
        }
    }

    /// Stamp sessions with reference-corrected time
    pub fn with_time_sync(mut self, time_sync: TimeSync) -> Self {
        self.time_sync = Some(time_sync);
        self
    }

    /// Called when flushes keep failing or storage becomes unusable.
    /// Applies from the next session on.
    pub fn on_failure(&mut self, callback: impl Fn(&FlushFailure) + Send + Sync + 'static) {
        self.on_failure = Some(Arc::new(callback));
    }

    pub fn sample_feed(&self) -> Receiver<SampleFeed> {
        self.feeds.samples.subscribe()
    }

    pub fn status_feed(&self) -> Receiver<WriteStatus> {
        self.feeds.status.subscribe()
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub fn current_session(&self) -> Option<&SessionInfo> {
        self.active.as_ref().map(|active| &active.info)
    }

    /// Start recording from `hub`.
    ///
    /// Without a session calibration the detector uses the configured default
    /// threshold and no residual correction.
    pub fn start(
        &mut self,
        hub: &SensorHub,
        profile: CalibrationProfile,
        calibration: Option<SessionCalibration>,
    ) -> Result<SessionInfo, SessionError> {
        if self.active.is_some() {
            return Err(SessionError::AlreadyRecording);
        }
        self.config.validate()?;

        let clock = SessionClock::start(self.time_sync.as_mut());
        let subscription = hub.subscribe()?;

        let directory = self.session_directory();
        self.store.create_dir_all(&directory)?;
        let info = SessionInfo {
            session_id: directory
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            data_file: directory.join(DATA_FILE),
            directory,
        };

        let correction = Correction {
            profile,
            session: calibration.unwrap_or_else(|| {
                SessionCalibration::neutral(self.config.signal.default_event_threshold)
            }),
        };
        let stages = match self.stages.take() {
            Some(stages) => stages,
            None => Stages::new(&self.config.signal)?,
        };
        let pipeline = Pipeline::new(
            &self.config,
            info.clone(),
            correction,
            stages,
            clock,
            self.store.clone(),
            self.feeds.clone(),
            self.on_failure.clone(),
        );

        let (command_tx, command_rx) = unbounded();
        let ingest_thread = thread::spawn(move || Self::ingest_loop(pipeline, subscription, command_rx));

        log::info!(
            target: LOG_TARGET,
            "Starting recording to: {}",
            info.data_file.display()
        );
        self.active = Some(ActiveSession {
            info: info.clone(),
            command_tx,
            ingest_thread,
        });
        Ok(info)
    }

    pub fn annotate(&self, annotation: Annotation) -> Result<(), SessionError> {
        self.send(IngestCommand::Annotate(annotation))
    }

    pub fn force_flush(&self) -> Result<(), SessionError> {
        self.send(IngestCommand::ForceFlush)
    }

    /// Stop the session and wait for its writes
    pub fn stop(&mut self) -> Result<SessionReport, SessionError> {
        let active = self.active.take().ok_or(SessionError::NotRecording)?;
        log::info!(target: LOG_TARGET, "Stopping recording {}", active.info.session_id);

        // The ingest thread may already be gone; join tells us
        let _ = active.command_tx.send(IngestCommand::Stop);
        let (report, stages) = active
            .ingest_thread
            .join()
            .map_err(|_| SessionError::IngestGone)?;
        self.stages = Some(stages);

        log::info!(
            target: LOG_TARGET,
            "Recording stopped: {} rows persisted, {} events, {:.1} Hz, all writes succeeded: {}",
            report.rows_persisted,
            report.events_detected,
            report.sampling_rate_hz,
            report.all_writes_succeeded
        );
        Ok(report)
    }

    fn send(&self, command: IngestCommand) -> Result<(), SessionError> {
        let active = self.active.as_ref().ok_or(SessionError::NotRecording)?;
        active
            .command_tx
            .send(command)
            .map_err(|_| SessionError::IngestGone)
    }

    /// `session_YYYYMMDD_HHMMSS`, suffixed when a session already used it
    fn session_directory(&self) -> PathBuf {
        let base = format!("session_{}", chrono::Local::now().format("%Y%m%d_%H%M%S"));
        let output_dir = &self.config.pipeline.output_dir;
        let mut candidate = output_dir.join(&base);
        let mut suffix = 2;
        while self.store.exists(&candidate) {
            candidate = output_dir.join(format!("{}_{}", base, suffix));
            suffix += 1;
        }
        candidate
    }

    fn ingest_loop(
        mut pipeline: Pipeline,
        subscription: Subscription,
        commands: Receiver<IngestCommand>,
    ) -> (SessionReport, Stages) {
        let mut subscription = Some(subscription);
        let never = crossbeam_channel::never();

        loop {
            let mut stream_closed = false;
            let mut stop = false;
            let samples = subscription.as_ref().map_or(&never, |s| s.receiver());

            select! {
                recv(samples) -> event => match event {
                    Ok(Ok(raw)) => {
                        pipeline.ingest(raw);
                    }
                    Ok(Err(e)) => pipeline.stream_error(e),
                    Err(_) => stream_closed = true,
                },
                recv(commands) -> command => match command {
                    Ok(IngestCommand::Annotate(annotation)) => {
                        pipeline.annotate(annotation);
                    }
                    Ok(IngestCommand::ForceFlush) => pipeline.force_flush(),
                    Ok(IngestCommand::Stop) | Err(_) => stop = true,
                },
            }

            if stop {
                break;
            }
            if stream_closed {
                log::warn!(target: LOG_TARGET, "Sensor stream ended before stop");
                subscription = None;
            }
        }

        if let Some(subscription) = subscription.take() {
            subscription.unsubscribe();
        }
        pipeline.finish_with_stages()
    }
}

impl Drop for SessionRecorder {
    fn drop(&mut self) {
        if self.active.is_some() {
            if let Err(e) = self.stop() {
                log::error!(target: LOG_TARGET, "Failed to stop recording on drop: {}", e);
            }
        }
    }
}

/// Post-hoc annotation of a finished session directory
pub fn annotate_session(
    store: &dyn FileStore,
    session_dir: &Path,
    annotation: &Annotation,
) -> Result<usize, StorageError> {
    let updated = writer::rewrite_annotation(store, &session_dir.join(DATA_FILE), annotation)?;
    log::info!(
        target: LOG_TARGET,
        "Annotated {} rows in {}",
        updated,
        session_dir.display()
    );
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample;
    use crate::sensor::VecSource;
    use crate::store::FsStore;
    use crate::writer::tests::ScriptedStore;
    use tempfile::tempdir;

    fn still(count: usize, start_ms: i64) -> Vec<RawSample> {
        (0..count)
            .map(|i| RawSample::new([0.0, 0.0, 9.81], [0.0; 3], start_ms + i as i64 * 10))
            .collect()
    }

    fn test_config(output_dir: &Path) -> Config {
        let mut config = Config::default();
        config.pipeline.output_dir = output_dir.to_path_buf();
        config.pipeline.retry_delay_ms = 5;
        config.pipeline.stop_timeout_ms = 5_000;
        config
    }

    fn pipeline_with(store: Arc<dyn FileStore>, feeds: Feeds) -> Pipeline {
        let stages = Stages::new(&test_config(Path::new("/virtual")).signal).unwrap();
        pipeline_with_stages(store, feeds, stages)
    }

    fn pipeline_with_stages(store: Arc<dyn FileStore>, feeds: Feeds, stages: Stages) -> Pipeline {
        let directory = PathBuf::from("/virtual/session_test");
        let info = SessionInfo {
            session_id: "session_test".to_string(),
            data_file: directory.join(DATA_FILE),
            directory,
        };
        let correction = Correction {
            profile: CalibrationProfile::default(),
            session: SessionCalibration::neutral(15.0),
        };
        Pipeline::new(
            &test_config(Path::new("/virtual")),
            info,
            correction,
            stages,
            SessionClock::start(None),
            store,
            feeds,
            None,
        )
    }

    fn drain(rx: &Receiver<SampleFeed>, count: usize) -> Vec<SampleFeed> {
        (0..count)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect()
    }

    #[test]
    fn test_buffer_flushes_at_capacity() {
        let store = Arc::new(ScriptedStore::default());
        let mut pipeline = pipeline_with(store.clone(), Feeds::default());

        for raw in still(650, 1_000) {
            pipeline.ingest(raw);
        }
        assert_eq!(pipeline.buffered().len(), 50);
        assert_eq!(pipeline.buffered()[0].relative_timestamp_ms, 6_000);

        let report = pipeline.finish();
        assert_eq!(report.samples_ingested, 650);
        assert_eq!(report.rows_persisted, 650);
        assert!(report.all_writes_succeeded);
        assert!(!report.timed_out);
        assert!(report.unwritten.is_empty());

        let data = store
            .contents(Path::new("/virtual/session_test/sensor_data.csv"))
            .unwrap();
        assert_eq!(sample::parse_rows(&data).unwrap().len(), 650);

        let metadata = store
            .contents(Path::new("/virtual/session_test/session.toml"))
            .unwrap();
        let value: toml::Value = toml::from_str(&metadata).unwrap();
        assert_eq!(value["session_id"].as_str(), Some("session_test"));
        assert_eq!(value["rows_persisted"].as_integer(), Some(650));
        assert_eq!(value["stamps"]["synchronized"].as_bool(), Some(false));
    }

    #[test]
    fn test_relative_timestamps_never_decrease() {
        let mut pipeline = pipeline_with(Arc::new(ScriptedStore::default()), Feeds::default());
        let stamps = [5_000, 5_010, 4_990, 5_030];
        let relative: Vec<i64> = stamps
            .iter()
            .map(|ts| {
                pipeline
                    .ingest(RawSample::new([0.0, 0.0, 9.81], [0.0; 3], *ts))
                    .relative_timestamp_ms
            })
            .collect();
        assert_eq!(relative, vec![0, 10, 10, 30]);
    }

    #[test]
    fn test_annotation_updates_buffer_and_file() {
        let store = Arc::new(ScriptedStore::default());
        let mut pipeline = pipeline_with(store.clone(), Feeds::default());

        for raw in still(400, 0) {
            pipeline.ingest(raw);
        }
        assert!(pipeline.pool().wait_idle(Duration::from_secs(5)));

        // Buffer holds 3000..3990; 2970..2990 are already on disk
        let updated = pipeline.annotate(Annotation {
            timestamp_ms: 2_990,
            window_ms: 20,
            is_event: true,
            feedback: "pothole".to_string(),
        });
        assert_eq!(updated, 2);
        assert!(pipeline.buffered()[0].is_event);

        let report = pipeline.finish();
        assert!(report.all_writes_succeeded);

        let data = store
            .contents(Path::new("/virtual/session_test/sensor_data.csv"))
            .unwrap();
        let rows = sample::parse_rows(&data).unwrap();
        assert_eq!(rows.len(), 400);
        let mut flagged: Vec<i64> = rows
            .iter()
            .filter(|r| r.is_event && r.user_feedback == "pothole")
            .map(|r| r.relative_timestamp_ms)
            .collect();
        flagged.sort();
        assert_eq!(flagged, vec![2_970, 2_980, 2_990, 3_000, 3_010]);
    }

    #[test]
    fn test_buffered_annotation_skips_disk() {
        let store = Arc::new(ScriptedStore::default());
        let feeds = Feeds::default();
        let status = feeds.status.subscribe();
        let mut pipeline = pipeline_with(store, feeds);

        for raw in still(100, 0) {
            pipeline.ingest(raw);
        }
        let updated = pipeline.annotate(Annotation {
            timestamp_ms: 500,
            window_ms: 0,
            is_event: false,
            feedback: "false alarm".to_string(),
        });
        assert_eq!(updated, 1);
        assert_eq!(pipeline.buffered()[50].user_feedback, "false alarm");

        pipeline.finish();
        assert!(!status
            .try_iter()
            .any(|e| matches!(e, WriteStatus::Annotated { .. })));
    }

    #[test]
    fn test_failed_writes_reported_at_stop() {
        let store = Arc::new(ScriptedStore::always_failing(StorageError::TransientIo(
            "busy".to_string(),
        )));
        let mut pipeline = pipeline_with(store, Feeds::default());
        for raw in still(320, 0) {
            pipeline.ingest(raw);
        }

        let report = pipeline.finish();
        assert!(!report.all_writes_succeeded);
        assert_eq!(report.rows_persisted, 0);
        assert_eq!(report.failed_batches, 2);
        assert_eq!(report.unwritten.len(), 320);
    }

    #[test]
    fn test_annotation_reaches_rows_held_after_failures() {
        let store = Arc::new(ScriptedStore::always_failing(StorageError::TransientIo(
            "busy".to_string(),
        )));
        let mut pipeline = pipeline_with(store, Feeds::default());
        for raw in still(320, 0) {
            pipeline.ingest(raw);
        }
        pipeline.annotate(Annotation {
            timestamp_ms: 1_000,
            window_ms: 10,
            is_event: true,
            feedback: "pothole".to_string(),
        });

        let report = pipeline.finish();
        let flagged: Vec<i64> = report
            .unwritten
            .iter()
            .filter(|r| r.user_feedback == "pothole")
            .map(|r| r.relative_timestamp_ms)
            .collect();
        assert_eq!(flagged, vec![990, 1_000, 1_010]);
    }

    #[test]
    fn test_spike_is_flagged_once() {
        let mut pipeline = pipeline_with(Arc::new(ScriptedStore::default()), Feeds::default());
        let mut events = 0;
        for (i, mut raw) in still(200, 0).into_iter().enumerate() {
            if (100..110).contains(&i) {
                raw.accel_z = 40.0;
            }
            if pipeline.ingest(raw).is_event {
                events += 1;
            }
        }
        assert_eq!(events, 1);
        assert_eq!(pipeline.finish().events_detected, 1);
    }

    #[test]
    fn test_carried_stages_are_rearmed() {
        let mut stages = Stages::new(&Config::default().signal).unwrap();
        // Warm filters and a fresh event left over from a previous session
        let leftover = stages.conditioner.condition(
            &RawSample::new([0.0, 0.0, 40.0], [0.0; 3], 0),
            0,
            &CalibrationProfile::default(),
            &SessionCalibration::neutral(15.0),
        );
        assert!(stages.detector.detect(&leftover));

        let mut pipeline =
            pipeline_with_stages(Arc::new(ScriptedStore::default()), Feeds::default(), stages);
        let first = pipeline.ingest(RawSample::new([0.0, 0.0, 30.0], [0.0; 3], 50_000));
        assert_eq!(first.relative_timestamp_ms, 0);
        assert_eq!(first.accel_magnitude, 30.0);
        assert!(first.is_event);

        let (report, stages) = pipeline.finish_with_stages();
        assert_eq!(report.events_detected, 1);
        assert_eq!(stages.detector.threshold(), 15.0);
    }

    #[test]
    fn test_back_to_back_sessions() {
        let dir = tempdir().unwrap();
        let mut recorder = SessionRecorder::new(test_config(dir.path()), Arc::new(FsStore));

        for _ in 0..2 {
            let mut events: Vec<RawSample> = still(100, 0);
            events[0].accel_z = 40.0;
            let hub = SensorHub::new(VecSource::new(events));
            let feed = recorder.sample_feed();
            recorder.start(&hub, CalibrationProfile::default(), None).unwrap();
            drain(&feed, 100);

            let report = recorder.stop().unwrap();
            // The spike opens each session, so the detector must be re-armed
            assert_eq!(report.events_detected, 1);
            assert_eq!(report.rows_persisted, 100);
        }
    }

    #[test]
    fn test_recorder_end_to_end() {
        let dir = tempdir().unwrap();
        let hub = SensorHub::new(VecSource::new(still(500, 10_000)));
        let mut recorder = SessionRecorder::new(test_config(dir.path()), Arc::new(FsStore));
        let feed = recorder.sample_feed();

        let info = recorder.start(&hub, CalibrationProfile::default(), None).unwrap();
        assert!(recorder.is_recording());
        assert!(info.session_id.starts_with("session_"));

        let received = drain(&feed, 500);
        assert!(received.iter().all(|item| item.is_ok()));

        let report = recorder.stop().unwrap();
        assert!(!recorder.is_recording());
        assert!(!hub.is_busy());
        assert_eq!(report.rows_persisted, 500);
        assert!(report.all_writes_succeeded);
        assert!(report.stamps.elapsed_ms.is_some());

        let text = std::fs::read_to_string(&info.data_file).unwrap();
        let rows = sample::parse_rows(&text).unwrap();
        assert_eq!(rows.len(), 500);
        assert_eq!(rows.iter().map(|r| r.relative_timestamp_ms).min(), Some(0));
        assert!(info.directory.join(METADATA_FILE).exists());
    }

    #[test]
    fn test_stream_error_reaches_feed() {
        let dir = tempdir().unwrap();
        let mut events: Vec<_> = still(10, 0).into_iter().map(Ok).collect();
        events.insert(5, Err(SampleStreamError::Failed("sensor glitch".to_string())));
        let hub = SensorHub::new(VecSource::from_events(events));

        let mut recorder = SessionRecorder::new(test_config(dir.path()), Arc::new(FsStore));
        let feed = recorder.sample_feed();
        recorder.start(&hub, CalibrationProfile::default(), None).unwrap();

        let received = drain(&feed, 11);
        assert!(received[5].is_err());

        let report = recorder.stop().unwrap();
        assert_eq!(report.stream_errors, 1);
        assert_eq!(report.rows_persisted, 10);
    }

    #[test]
    fn test_lifecycle_misuse() {
        let dir = tempdir().unwrap();
        let hub = SensorHub::new(VecSource::new(still(10, 0)));
        let mut recorder = SessionRecorder::new(test_config(dir.path()), Arc::new(FsStore));

        assert!(matches!(recorder.stop(), Err(SessionError::NotRecording)));
        assert!(matches!(
            recorder.annotate(Annotation {
                timestamp_ms: 0,
                window_ms: 0,
                is_event: true,
                feedback: String::new(),
            }),
            Err(SessionError::NotRecording)
        ));

        // Calibration holds the sensor
        let held = hub.subscribe().unwrap();
        assert!(matches!(
            recorder.start(&hub, CalibrationProfile::default(), None),
            Err(SessionError::SourceBusy)
        ));
        drop(held);

        recorder.start(&hub, CalibrationProfile::default(), None).unwrap();
        assert!(matches!(
            recorder.start(&hub, CalibrationProfile::default(), None),
            Err(SessionError::AlreadyRecording)
        ));
        recorder.stop().unwrap();
    }

    #[test]
    fn test_invalid_config_refuses_start() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.signal.ema_alpha = 0.0;
        let hub = SensorHub::new(VecSource::new(vec![]));
        let mut recorder = SessionRecorder::new(config, Arc::new(FsStore));
        assert!(matches!(
            recorder.start(&hub, CalibrationProfile::default(), None),
            Err(SessionError::Config(_))
        ));
        assert!(!hub.is_busy());
    }

    #[test]
    fn test_annotate_finished_session() {
        let dir = tempdir().unwrap();
        let session_dir = dir.path().join("session_x");
        std::fs::create_dir_all(&session_dir).unwrap();

        let rows: Vec<CorrectedSample> = (0..20)
            .map(|i| CorrectedSample {
                relative_timestamp_ms: i * 100,
                accel_x: 0.0,
                accel_y: 0.0,
                accel_z: 9.81,
                accel_magnitude: 9.81,
                gyro_x: 0.0,
                gyro_y: 0.0,
                gyro_z: 0.0,
                is_event: i == 10,
                user_feedback: String::new(),
            })
            .collect();
        let mut text = sample::header_line().unwrap();
        text.push_str(&sample::encode_rows(&rows).unwrap());
        std::fs::write(session_dir.join(DATA_FILE), text).unwrap();

        let annotation = Annotation {
            timestamp_ms: 1_000,
            window_ms: 100,
            is_event: false,
            feedback: "manhole cover".to_string(),
        };
        let updated = annotate_session(&FsStore, &session_dir, &annotation).unwrap();
        assert_eq!(updated, 3);

        let parsed =
            sample::parse_rows(&std::fs::read_to_string(session_dir.join(DATA_FILE)).unwrap())
                .unwrap();
        assert!(parsed.iter().all(|r| !r.is_event));
        assert_eq!(
            parsed
                .iter()
                .filter(|r| r.user_feedback == "manhole cover")
                .count(),
            3
        );
    }
}
