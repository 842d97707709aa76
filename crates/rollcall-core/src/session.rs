//! Recognition session: the frame loop that turns matches into attendance.
//!
//! A session runs its loop on a dedicated worker thread that owns the
//! classifier and the capture source. Presentation code receives
//! `Notification`s over an unbounded channel, which closes when the worker
//! exits, and may poll `snapshot()` for counters.

use crate::classifier::{accept, FrameClassifier, RegionOutcome};
use crate::directory::{AttendanceLedger, StudentDirectory};
use crate::labels::LabelMapping;
use crate::marker::{AttendanceMarker, MarkerError};
use crate::types::{ClassSlotId, FacultyId, SessionId, SessionSummary, StudentId};
use chrono::{DateTime, Utc};
use rollcall_hw::{CameraError, Frame, FrameSource};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session is already running")]
    AlreadyActive,
    #[error("session has ended")]
    SessionClosed,
    #[error("no session is running")]
    NoActiveSession,
    #[error("capture source unavailable: {0}")]
    CaptureUnavailable(#[source] CameraError),
    #[error(transparent)]
    Marker(#[from] MarkerError),
    #[error("failed to spawn session worker: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Events emitted by the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A student was marked present for the first time this session.
    Match {
        student: StudentId,
        name: String,
        score: f64,
        /// `100 - score`, floored at 0, for display.
        confidence: f64,
        timestamp: DateTime<Utc>,
    },
    Progress {
        frame_count: u64,
        recognized_count: usize,
        timestamp: DateTime<Utc>,
    },
    /// The worker stopped because of this error.
    Error { message: String },
}

pub type NotificationReceiver = mpsc::UnboundedReceiver<Notification>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    /// A match is accepted only when its score is strictly below this.
    pub confidence_threshold: f64,
    /// Emit a progress notification every N processed frames (0 disables).
    pub progress_interval: u64,
    /// Failed frames tolerated in a row before the worker gives up.
    pub max_consecutive_failures: u32,
    pub skip_dark_frames: bool,
    /// Frames discarded before processing starts, while the camera settles.
    pub warmup_frames: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 40.0,
            progress_interval: 30,
            max_consecutive_failures: 10,
            skip_dark_frames: true,
            warmup_frames: 0,
        }
    }
}

/// Who is running the session, for which class, and how many are expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTarget {
    pub faculty: FacultyId,
    pub class_slot: ClassSlotId,
    pub expected_population: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub frames_processed: u64,
    pub recognized: Vec<StudentId>,
}

#[derive(Default)]
struct Shared {
    cancel: AtomicBool,
    snapshot: RwLock<SessionSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Active,
    Ended,
}

pub struct RecognitionSession<L: AttendanceLedger> {
    classifier: Option<FrameClassifier>,
    mapping: Arc<LabelMapping>,
    marker: Arc<Mutex<AttendanceMarker<L>>>,
    directory: Arc<dyn StudentDirectory>,
    config: SessionConfig,
    target: SessionTarget,
    notify: Option<mpsc::UnboundedSender<Notification>>,
    shared: Arc<Shared>,
    phase: Phase,
    worker: Option<JoinHandle<()>>,
    summary: Option<SessionSummary>,
}

impl<L: AttendanceLedger + 'static> RecognitionSession<L> {
    pub fn new(
        classifier: FrameClassifier,
        mapping: Arc<LabelMapping>,
        marker: Arc<Mutex<AttendanceMarker<L>>>,
        directory: Arc<dyn StudentDirectory>,
        config: SessionConfig,
        target: SessionTarget,
    ) -> (Self, NotificationReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Self {
            classifier: Some(classifier),
            mapping,
            marker,
            directory,
            config,
            target,
            notify: Some(tx),
            shared: Arc::new(Shared::default()),
            phase: Phase::Created,
            worker: None,
            summary: None,
        };
        (session, rx)
    }

    pub fn is_active(&self) -> bool {
        self.phase == Phase::Active
    }

    /// Open the capture source, open the attendance session and start the
    /// worker.
    ///
    /// A capture source that fails to open ends the session for good.
    pub fn start<S, F>(&mut self, open_source: F) -> Result<SessionId, SessionError>
    where
        S: FrameSource + 'static,
        F: FnOnce() -> Result<S, CameraError>,
    {
        match self.phase {
            Phase::Active => return Err(SessionError::AlreadyActive),
            Phase::Ended => return Err(SessionError::SessionClosed),
            Phase::Created => {}
        }

        let source = match open_source() {
            Ok(source) => source,
            Err(e) => {
                tracing::error!(error = %e, "capture source unavailable");
                self.phase = Phase::Ended;
                self.notify = None;
                return Err(SessionError::CaptureUnavailable(e));
            }
        };

        let session_id = lock(&self.marker).start_session(
            self.target.faculty,
            self.target.class_slot,
            self.target.expected_population,
        )?;

        let (Some(classifier), Some(notify)) = (self.classifier.take(), self.notify.take()) else {
            return Err(SessionError::SessionClosed);
        };
        let worker = Worker {
            classifier,
            mapping: Arc::clone(&self.mapping),
            marker: Arc::clone(&self.marker),
            directory: Arc::clone(&self.directory),
            config: self.config,
            class_slot: self.target.class_slot,
            notify,
            shared: Arc::clone(&self.shared),
            recognized: BTreeSet::new(),
            frames: 0,
        };

        let spawned = std::thread::Builder::new()
            .name("rollcall-session".into())
            .spawn(move || worker.run(source));
        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                self.phase = Phase::Active;
                Ok(session_id)
            }
            Err(e) => {
                self.phase = Phase::Ended;
                if let Err(end) = lock(&self.marker).end_session() {
                    tracing::warn!(error = %end, "failed to end attendance session");
                }
                Err(SessionError::Spawn(e))
            }
        }
    }

    /// Stop the worker and end the attendance session.
    ///
    /// Calling this again returns the same summary.
    pub fn stop(&mut self) -> Result<SessionSummary, SessionError> {
        match self.phase {
            Phase::Created => return Err(SessionError::NoActiveSession),
            Phase::Ended => return self.summary.clone().ok_or(SessionError::NoActiveSession),
            Phase::Active => {}
        }

        self.join_worker();
        self.phase = Phase::Ended;
        let summary = lock(&self.marker).end_session()?;
        self.summary = Some(summary.clone());
        Ok(summary)
    }

    /// Alias of [`stop`](Self::stop).
    pub fn end(&mut self) -> Result<SessionSummary, SessionError> {
        self.stop()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared
            .snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<L: AttendanceLedger> RecognitionSession<L> {
    fn join_worker(&mut self) {
        self.shared.cancel.store(true, Ordering::Release);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                tracing::error!("session worker panicked");
            }
        }
    }
}

impl<L: AttendanceLedger> Drop for RecognitionSession<L> {
    /// A session dropped while running is stopped and its attendance session
    /// ended, so the ledger never keeps an open session row.
    fn drop(&mut self) {
        if self.phase != Phase::Active {
            return;
        }
        self.join_worker();
        self.phase = Phase::Ended;
        match lock(&self.marker).end_session() {
            Ok(summary) => tracing::warn!(
                session = %summary.session_id,
                present = summary.present_count,
                "session dropped while running, ended it"
            ),
            Err(e) => tracing::warn!(error = %e, "failed to end dropped session"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum FrameFault {
    /// Counts toward the consecutive-failure limit.
    Recoverable(String),
    /// Ends the run.
    Fatal(String),
}

struct Worker<L> {
    classifier: FrameClassifier,
    mapping: Arc<LabelMapping>,
    marker: Arc<Mutex<AttendanceMarker<L>>>,
    directory: Arc<dyn StudentDirectory>,
    config: SessionConfig,
    class_slot: ClassSlotId,
    notify: mpsc::UnboundedSender<Notification>,
    shared: Arc<Shared>,
    recognized: BTreeSet<StudentId>,
    frames: u64,
}

impl<L: AttendanceLedger> Worker<L> {
    fn run<S: FrameSource>(mut self, mut source: S) {
        tracing::info!(class_slot = %self.class_slot, "session worker started");
        let mut warmup = self.config.warmup_frames;
        let mut failures = 0u32;

        while !self.shared.cancel.load(Ordering::Acquire) {
            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::info!("capture source exhausted");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "capture failed, stopping session worker");
                    self.emit(Notification::Error {
                        message: format!("capture failed: {e}"),
                    });
                    break;
                }
            };
            if warmup > 0 {
                warmup -= 1;
                continue;
            }

            self.frames += 1;
            let outcome = self.process(&frame);
            self.publish_snapshot();

            match outcome {
                Ok(()) => failures = 0,
                Err(FrameFault::Recoverable(message)) => {
                    failures += 1;
                    tracing::warn!(seq = frame.sequence, failures, error = %message, "frame failed");
                    if failures > self.config.max_consecutive_failures {
                        tracing::error!(failures, "too many consecutive failed frames");
                        self.emit(Notification::Error {
                            message: format!(
                                "stopped after {failures} consecutive failed frames: {message}"
                            ),
                        });
                        break;
                    }
                }
                Err(FrameFault::Fatal(message)) => {
                    tracing::error!(seq = frame.sequence, error = %message, "recognition failed");
                    self.emit(Notification::Error { message });
                    break;
                }
            }

            let interval = self.config.progress_interval;
            if interval > 0 && self.frames % interval == 0 {
                self.emit(Notification::Progress {
                    frame_count: self.frames,
                    recognized_count: self.recognized.len(),
                    timestamp: Utc::now(),
                });
            }
        }

        drop(source);
        tracing::info!(
            frames = self.frames,
            recognized = self.recognized.len(),
            "session worker exiting"
        );
    }

    fn process(&mut self, frame: &Frame) -> Result<(), FrameFault> {
        if frame.is_dark && self.config.skip_dark_frames {
            tracing::debug!(seq = frame.sequence, "skipping dark frame");
            return Ok(());
        }

        let regions = self
            .classifier
            .detect_faces(frame)
            .map_err(|e| FrameFault::Recoverable(e.to_string()))?;

        let mut fault = None;
        for region in &regions {
            let prediction = self
                .classifier
                .predict(&region.image)
                .map_err(|e| FrameFault::Fatal(e.to_string()))?;

            match accept(prediction, &self.mapping, self.config.confidence_threshold) {
                RegionOutcome::Matched { student, score } => {
                    if let Err(message) = self.mark(student, score) {
                        fault = Some(message);
                    }
                }
                RegionOutcome::Unknown { label, score } => {
                    tracing::debug!(label, score, "label not in mapping");
                }
                RegionOutcome::LowConfidence { student, score } => {
                    tracing::debug!(%student, score, "match below confidence threshold");
                }
            }
        }

        match fault {
            Some(message) => Err(FrameFault::Recoverable(message)),
            None => Ok(()),
        }
    }

    /// Mark `student` present unless already done this session.
    fn mark(&mut self, student: StudentId, score: f64) -> Result<(), String> {
        if self.recognized.contains(&student) {
            return Ok(());
        }

        let record = match self.directory.get_student(student) {
            Ok(Some(record)) if record.active => record,
            Ok(_) => {
                tracing::debug!(%student, "matched student has no active record, treating as unknown");
                return Ok(());
            }
            Err(e) => return Err(format!("looking up student {student}: {e}")),
        };

        let marked = lock(&self.marker).mark_present(student, self.class_slot, score);
        match marked {
            Ok(row) => {
                self.recognized.insert(student);
                tracing::info!(%student, name = %record.name, score, "student marked present");
                self.emit(Notification::Match {
                    student,
                    name: record.name,
                    score,
                    confidence: (100.0 - score).max(0.0),
                    timestamp: row.timestamp,
                });
                Ok(())
            }
            Err(e) => Err(format!("marking student {student} present: {e}")),
        }
    }

    fn publish_snapshot(&self) {
        let mut snapshot = self
            .shared
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        snapshot.frames_processed = self.frames;
        snapshot.recognized = self.recognized.iter().copied().collect();
    }

    fn emit(&self, notification: Notification) {
        // The receiver may be gone; the run continues regardless.
        let _ = self.notify.send(notification);
    }
}
