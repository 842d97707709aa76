use chrono::{DateTime, SecondsFormat, Utc};
use rollcall_core::directory::{AttendanceLedger, StoreError, StudentDirectory};
use rollcall_core::{
    AttendanceRecord, ClassSlotId, FacultyId, SessionId, SessionSummary, StudentId, StudentRecord,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// SQLite-backed student directory and attendance ledger.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

/// One row of a session report.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub student: StudentId,
    pub code: String,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub match_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub faculty: FacultyId,
    pub class_slot: ClassSlotId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: String,
    pub total: u32,
    pub present: u32,
    pub rows: Vec<ReportRow>,
}

impl SessionReport {
    pub fn absent(&self) -> u32 {
        self.total.saturating_sub(self.present)
    }

    pub fn attendance_percentage(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            f64::from(self.present) / f64::from(self.total) * 100.0
        }
    }
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn to_sql_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn from_sql_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("bad timestamp {raw:?}: {e}")))
}

const STUDENT_COLUMNS: &str = "id, student_code, name, email, department, is_active";

fn student_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StudentRecord> {
    Ok(StudentRecord {
        id: StudentId(row.get(0)?),
        code: row.get(1)?,
        name: row.get(2)?,
        email: row.get(3)?,
        department: row.get(4)?,
        active: row.get(5)?,
    })
}

impl SqliteStore {
    /// Open (or create) the database at the given path and create the schema.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Backend(format!("{}: {e}", parent.display())))?;
            }
        }

        let conn = Connection::open(db_path).map_err(backend)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             CREATE TABLE IF NOT EXISTS students (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 student_code TEXT UNIQUE NOT NULL,
                 name TEXT NOT NULL,
                 email TEXT UNIQUE NOT NULL,
                 department TEXT NOT NULL,
                 created_at TEXT NOT NULL,
                 is_active INTEGER NOT NULL DEFAULT 1
             );
             CREATE TABLE IF NOT EXISTS attendance (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 student_id INTEGER NOT NULL REFERENCES students(id),
                 class_slot INTEGER NOT NULL,
                 timestamp TEXT NOT NULL,
                 status TEXT NOT NULL DEFAULT 'present',
                 confidence_score REAL
             );
             CREATE INDEX IF NOT EXISTS idx_attendance_slot ON attendance(class_slot, timestamp);
             CREATE TABLE IF NOT EXISTS attendance_sessions (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 faculty_id INTEGER NOT NULL,
                 class_slot INTEGER NOT NULL,
                 session_start TEXT NOT NULL,
                 session_end TEXT,
                 total_students INTEGER,
                 present_count INTEGER NOT NULL DEFAULT 0,
                 status TEXT NOT NULL DEFAULT 'active'
             );",
        )
        .map_err(backend)?;

        tracing::debug!(path = %db_path.display(), "record store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_student(
        &self,
        code: &str,
        name: &str,
        email: &str,
        department: &str,
    ) -> Result<StudentRecord, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO students (student_code, name, email, department, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![code, name, email, department, to_sql_time(Utc::now())],
        )
        .map_err(backend)?;
        Ok(StudentRecord {
            id: StudentId(conn.last_insert_rowid()),
            code: code.to_string(),
            name: name.to_string(),
            email: email.to_string(),
            department: department.to_string(),
            active: true,
        })
    }

    pub fn list_students(&self, include_inactive: bool) -> Result<Vec<StudentRecord>, StoreError> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {STUDENT_COLUMNS} FROM students {} ORDER BY name, id",
            if include_inactive { "" } else { "WHERE is_active = 1" }
        );
        let mut stmt = conn.prepare(&sql).map_err(backend)?;
        let rows = stmt.query_map([], student_from_row).map_err(backend)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(backend)
    }

    /// Soft-delete a student. Returns false when no active student matched.
    pub fn deactivate_student(&self, id: StudentId) -> Result<bool, StoreError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE students SET is_active = 0 WHERE id = ?1 AND is_active = 1",
                [id.0],
            )
            .map_err(backend)?;
        Ok(changed > 0)
    }

    /// Expected population of a class: every active student.
    pub fn count_active_students(&self) -> Result<u32, StoreError> {
        self.conn()
            .query_row(
                "SELECT COUNT(*) FROM students WHERE is_active = 1",
                [],
                |row| row.get(0),
            )
            .map_err(backend)
    }

    /// Session totals plus the attendance rows recorded while it was open.
    pub fn session_report(&self, id: SessionId) -> Result<Option<SessionReport>, StoreError> {
        let conn = self.conn();
        let session = conn
            .query_row(
                "SELECT faculty_id, class_slot, session_start, session_end,
                        total_students, present_count, status
                 FROM attendance_sessions WHERE id = ?1",
                [id.0],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<u32>>(4)?,
                        row.get::<_, u32>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()
            .map_err(backend)?;
        let Some((faculty, slot, start, end, total, present, status)) = session else {
            return Ok(None);
        };

        let upper = end.clone().unwrap_or_else(|| to_sql_time(Utc::now()));
        let mut stmt = conn
            .prepare(
                "SELECT a.student_id, s.student_code, s.name, a.timestamp, a.confidence_score
                 FROM attendance a JOIN students s ON a.student_id = s.id
                 WHERE a.class_slot = ?1 AND a.timestamp >= ?2 AND a.timestamp <= ?3
                 ORDER BY a.timestamp",
            )
            .map_err(backend)?;
        let raw = stmt
            .query_map(params![slot, start, upper], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<f64>>(4)?,
                ))
            })
            .map_err(backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;

        let mut rows = Vec::with_capacity(raw.len());
        for (student, code, name, ts, score) in raw {
            rows.push(ReportRow {
                student: StudentId(student),
                code,
                name,
                timestamp: from_sql_time(&ts)?,
                match_score: score,
            });
        }

        Ok(Some(SessionReport {
            session_id: id,
            faculty: FacultyId(faculty),
            class_slot: ClassSlotId(slot),
            started_at: from_sql_time(&start)?,
            ended_at: end.as_deref().map(from_sql_time).transpose()?,
            status,
            total: total.unwrap_or(0),
            present,
            rows,
        }))
    }
}

impl StudentDirectory for SqliteStore {
    fn get_student(&self, id: StudentId) -> Result<Option<StudentRecord>, StoreError> {
        self.conn()
            .query_row(
                &format!("SELECT {STUDENT_COLUMNS} FROM students WHERE id = ?1"),
                [id.0],
                student_from_row,
            )
            .optional()
            .map_err(backend)
    }
}

impl AttendanceLedger for SqliteStore {
    fn create_session(
        &self,
        faculty: FacultyId,
        class_slot: ClassSlotId,
        started_at: DateTime<Utc>,
    ) -> Result<SessionId, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO attendance_sessions (faculty_id, class_slot, session_start)
             VALUES (?1, ?2, ?3)",
            params![faculty.0, class_slot.0, to_sql_time(started_at)],
        )
        .map_err(backend)?;
        Ok(SessionId(conn.last_insert_rowid()))
    }

    fn append_record(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO attendance (student_id, class_slot, timestamp, status, confidence_score)
                 VALUES (?1, ?2, ?3, 'present', ?4)",
                params![
                    record.student.0,
                    record.class_slot.0,
                    to_sql_time(record.timestamp),
                    record.match_score
                ],
            )
            .map_err(backend)?;
        Ok(())
    }

    fn close_session(&self, summary: &SessionSummary) -> Result<(), StoreError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE attendance_sessions
                 SET session_end = ?1, total_students = ?2, present_count = ?3, status = 'completed'
                 WHERE id = ?4",
                params![
                    to_sql_time(summary.ended_at),
                    summary.total,
                    summary.present_count,
                    summary.session_id.0
                ],
            )
            .map_err(backend)?;
        if changed == 0 {
            return Err(StoreError::UnknownSession(summary.session_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::AttendanceMarker;

    fn store() -> SqliteStore {
        SqliteStore::open(Path::new(":memory:")).unwrap()
    }

    #[test]
    fn test_students_roundtrip() {
        let s = store();
        let ann = s.add_student("CS-001", "Ann", "ann@uni.edu", "CS").unwrap();
        let bob = s.add_student("CS-002", "Bob", "bob@uni.edu", "CS").unwrap();
        assert_eq!(s.get_student(ann.id).unwrap(), Some(ann.clone()));
        assert_eq!(s.count_active_students().unwrap(), 2);

        assert!(s.deactivate_student(bob.id).unwrap());
        assert!(!s.deactivate_student(bob.id).unwrap());
        assert_eq!(s.count_active_students().unwrap(), 1);
        assert_eq!(s.list_students(false).unwrap(), vec![ann]);
        assert_eq!(s.list_students(true).unwrap().len(), 2);
        assert!(!s.get_student(bob.id).unwrap().unwrap().active);
        assert!(s.get_student(StudentId(99)).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_code_is_rejected() {
        let s = store();
        s.add_student("CS-001", "Ann", "ann@uni.edu", "CS").unwrap();
        assert!(matches!(
            s.add_student("CS-001", "Other", "other@uni.edu", "CS"),
            Err(StoreError::Backend(_))
        ));
    }

    #[test]
    fn test_session_report_through_marker() {
        let s = store();
        let ann = s.add_student("CS-001", "Ann", "ann@uni.edu", "CS").unwrap();
        s.add_student("CS-002", "Bob", "bob@uni.edu", "CS").unwrap();

        let mut marker = AttendanceMarker::new(s);
        let id = marker.start_session(FacultyId(4), ClassSlotId(12), 2).unwrap();
        marker.mark_present(ann.id, ClassSlotId(12), 21.5).unwrap();
        // Another class slot never shows up in this report.
        marker.mark_present(ann.id, ClassSlotId(13), 11.0).unwrap();
        let summary = marker.end_session().unwrap();

        let report = marker.ledger().session_report(id).unwrap().unwrap();
        assert_eq!(report.status, "completed");
        assert_eq!(report.total, 2);
        assert_eq!(report.present, 1);
        assert_eq!(report.absent(), 1);
        assert!((report.attendance_percentage() - 50.0).abs() < 1e-9);
        assert_eq!(report.rows.len(), 1);
        assert_eq!(report.rows[0].code, "CS-001");
        assert_eq!(report.rows[0].match_score, Some(21.5));
        assert_eq!(report.ended_at.map(|t| t.timestamp_micros()), Some(summary.ended_at.timestamp_micros()));

        assert!(marker.ledger().session_report(SessionId(77)).unwrap().is_none());
    }

    #[test]
    fn test_close_unknown_session() {
        let s = store();
        let now = Utc::now();
        let summary = SessionSummary::compute(SessionId(5), 1, 0, now, now);
        assert!(matches!(
            s.close_session(&summary),
            Err(StoreError::UnknownSession(_))
        ));
    }
}
