//! Attendance marker: session bookkeeping in front of the ledger.

use crate::directory::{AttendanceLedger, StoreError};
use crate::types::{
    AttendanceRecord, ClassSlotId, FacultyId, SessionId, SessionSummary, StudentId,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MarkerError {
    #[error("an attendance session is already active ({0})")]
    AlreadyActive(SessionId),
    #[error("no attendance session is active")]
    NoActiveSession,
    #[error("attendance session has ended")]
    SessionClosed,
    #[error("ledger: {0}")]
    Ledger(#[from] StoreError),
}

#[derive(Debug)]
struct OpenSession {
    id: SessionId,
    class_slot: ClassSlotId,
    expected: u32,
    started_at: DateTime<Utc>,
    recognized: BTreeSet<StudentId>,
}

#[derive(Debug)]
enum State {
    Idle,
    Active(OpenSession),
    Ended,
}

pub struct AttendanceMarker<L> {
    ledger: L,
    state: State,
}

impl<L: AttendanceLedger> AttendanceMarker<L> {
    pub fn new(ledger: L) -> Self {
        Self {
            ledger,
            state: State::Idle,
        }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, State::Active(_))
    }

    /// Open a session. A marker whose previous session ended may open another.
    pub fn start_session(
        &mut self,
        faculty: FacultyId,
        class_slot: ClassSlotId,
        expected: u32,
    ) -> Result<SessionId, MarkerError> {
        if let State::Active(open) = &self.state {
            return Err(MarkerError::AlreadyActive(open.id));
        }
        let started_at = Utc::now();
        let id = self.ledger.create_session(faculty, class_slot, started_at)?;
        tracing::info!(session = %id, %faculty, %class_slot, expected, "attendance session started");
        self.state = State::Active(OpenSession {
            id,
            class_slot,
            expected,
            started_at,
            recognized: BTreeSet::new(),
        });
        Ok(id)
    }

    /// Append one attendance record. Inside a session the student also joins
    /// the session's recognised set.
    pub fn mark_present(
        &mut self,
        student: StudentId,
        class_slot: ClassSlotId,
        score: f64,
    ) -> Result<AttendanceRecord, MarkerError> {
        if matches!(self.state, State::Ended) {
            return Err(MarkerError::SessionClosed);
        }
        let record = AttendanceRecord {
            student,
            class_slot,
            timestamp: Utc::now(),
            match_score: score,
        };
        self.ledger.append_record(&record)?;
        if let State::Active(open) = &mut self.state {
            if open.class_slot != class_slot {
                tracing::warn!(%student, %class_slot, session_slot = %open.class_slot, "marking against a different class slot");
            }
            open.recognized.insert(student);
        }
        tracing::debug!(%student, %class_slot, score, "attendance recorded");
        Ok(record)
    }

    pub fn recognized(&self) -> Vec<StudentId> {
        match &self.state {
            State::Active(open) => open.recognized.iter().copied().collect(),
            _ => Vec::new(),
        }
    }

    /// Close the session and report its counts.
    ///
    /// A ledger failure while closing is logged; the attendance rows are
    /// already stored and the summary is still returned.
    pub fn end_session(&mut self) -> Result<SessionSummary, MarkerError> {
        let open = match std::mem::replace(&mut self.state, State::Ended) {
            State::Active(open) => open,
            previous => {
                self.state = previous;
                return Err(MarkerError::NoActiveSession);
            }
        };

        let summary = SessionSummary::compute(
            open.id,
            open.expected,
            open.recognized.len() as u32,
            open.started_at,
            Utc::now(),
        );
        if let Err(e) = self.ledger.close_session(&summary) {
            tracing::warn!(session = %open.id, error = %e, "failed to close session row");
        }
        tracing::info!(
            session = %summary.session_id,
            present = summary.present_count,
            absent = summary.absent_count,
            total = summary.total,
            "attendance session ended"
        );
        Ok(summary)
    }
}
