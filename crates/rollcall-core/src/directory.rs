//! Record-store seams: student lookup and the attendance ledger.
//!
//! The CLI backs both with SQLite. `MemoryStore` backs both in memory for
//! tests and offline runs.

use crate::types::{
    AttendanceRecord, ClassSlotId, FacultyId, SessionId, SessionSummary, StudentId, StudentRecord,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record store: {0}")]
    Backend(String),
    #[error("unknown attendance session {0}")]
    UnknownSession(SessionId),
}

/// Read access to student records.
pub trait StudentDirectory: Send + Sync {
    /// `Ok(None)` when no student has this id.
    fn get_student(&self, id: StudentId) -> Result<Option<StudentRecord>, StoreError>;
}

/// Append-only attendance storage.
pub trait AttendanceLedger: Send {
    fn create_session(
        &self,
        faculty: FacultyId,
        class_slot: ClassSlotId,
        started_at: DateTime<Utc>,
    ) -> Result<SessionId, StoreError>;

    fn append_record(&self, record: &AttendanceRecord) -> Result<(), StoreError>;

    fn close_session(&self, summary: &SessionSummary) -> Result<(), StoreError>;
}

impl<T: StudentDirectory + ?Sized> StudentDirectory for Arc<T> {
    fn get_student(&self, id: StudentId) -> Result<Option<StudentRecord>, StoreError> {
        (**self).get_student(id)
    }
}

impl<T: AttendanceLedger + Sync + ?Sized> AttendanceLedger for Arc<T> {
    fn create_session(
        &self,
        faculty: FacultyId,
        class_slot: ClassSlotId,
        started_at: DateTime<Utc>,
    ) -> Result<SessionId, StoreError> {
        (**self).create_session(faculty, class_slot, started_at)
    }

    fn append_record(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        (**self).append_record(record)
    }

    fn close_session(&self, summary: &SessionSummary) -> Result<(), StoreError> {
        (**self).close_session(summary)
    }
}

/// A session row as kept by `MemoryStore`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRow {
    pub faculty: FacultyId,
    pub class_slot: ClassSlotId,
    pub started_at: DateTime<Utc>,
    pub summary: Option<SessionSummary>,
}

#[derive(Default)]
struct MemoryTables {
    students: BTreeMap<StudentId, StudentRecord>,
    records: Vec<AttendanceRecord>,
    sessions: BTreeMap<SessionId, SessionRow>,
}

/// In-memory directory and ledger.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
    failing_appends: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_students(students: impl IntoIterator<Item = StudentRecord>) -> Self {
        let store = Self::new();
        for student in students {
            store.insert_student(student);
        }
        store
    }

    pub fn insert_student(&self, student: StudentRecord) {
        self.tables().students.insert(student.id, student);
    }

    pub fn remove_student(&self, id: StudentId) -> Option<StudentRecord> {
        self.tables().students.remove(&id)
    }

    /// Make the next `n` calls to `append_record` fail.
    pub fn fail_next_appends(&self, n: u32) {
        self.failing_appends.store(n, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<AttendanceRecord> {
        self.tables().records.clone()
    }

    pub fn session(&self, id: SessionId) -> Option<SessionRow> {
        self.tables().sessions.get(&id).cloned()
    }

    fn tables(&self) -> MutexGuard<'_, MemoryTables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StudentDirectory for MemoryStore {
    fn get_student(&self, id: StudentId) -> Result<Option<StudentRecord>, StoreError> {
        Ok(self.tables().students.get(&id).cloned())
    }
}

impl AttendanceLedger for MemoryStore {
    fn create_session(
        &self,
        faculty: FacultyId,
        class_slot: ClassSlotId,
        started_at: DateTime<Utc>,
    ) -> Result<SessionId, StoreError> {
        let mut tables = self.tables();
        let id = SessionId(tables.sessions.len() as i64 + 1);
        tables.sessions.insert(
            id,
            SessionRow {
                faculty,
                class_slot,
                started_at,
                summary: None,
            },
        );
        Ok(id)
    }

    fn append_record(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        let injected = self
            .failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Backend("injected append failure".into()));
        }
        self.tables().records.push(record.clone());
        Ok(())
    }

    fn close_session(&self, summary: &SessionSummary) -> Result<(), StoreError> {
        let mut tables = self.tables();
        let row = tables
            .sessions
            .get_mut(&summary.session_id)
            .ok_or(StoreError::UnknownSession(summary.session_id))?;
        row.summary = Some(summary.clone());
        Ok(())
    }
}
