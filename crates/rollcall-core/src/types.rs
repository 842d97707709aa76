use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_newtype!(
    /// Stable external identity of a student (record store primary key).
    StudentId
);
id_newtype!(FacultyId);
id_newtype!(
    /// A scheduled class period attendance is recorded against.
    ClassSlotId
);
id_newtype!(SessionId);

/// Student record as returned by the external record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentRecord {
    pub id: StudentId,
    /// Institution-issued student code (e.g. "CS-2024-017").
    pub code: String,
    pub name: String,
    pub email: String,
    pub department: String,
    pub active: bool,
}

/// One append-only attendance row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub student: StudentId,
    pub class_slot: ClassSlotId,
    pub timestamp: DateTime<Utc>,
    /// LBPH dissimilarity of the accepted match (lower is better).
    pub match_score: f64,
}

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector score in [0, 1].
    pub confidence: f32,
}

/// Classifier output for one face region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    /// Dense label index assigned at training time.
    pub label: u32,
    /// Dissimilarity to the nearest training sample. 0 is a perfect match.
    pub distance: f64,
}

/// Final counts of an ended attendance session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub present_count: u32,
    pub absent_count: u32,
    /// Expected population of the class slot.
    pub total: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration: Duration,
}

impl SessionSummary {
    /// Build a summary, clamping `absent_count` at zero when more students
    /// were recognized than expected.
    pub fn compute(
        session_id: SessionId,
        expected_population: u32,
        present_count: u32,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Self {
        let duration = (ended_at - started_at).to_std().unwrap_or(Duration::ZERO);
        Self {
            session_id,
            present_count,
            absent_count: expected_population.saturating_sub(present_count),
            total: expected_population,
            started_at,
            ended_at,
            duration,
        }
    }

    /// Percentage of the expected population marked present (0 when nobody
    /// was expected).
    pub fn attendance_percentage(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            f64::from(self.present_count) / f64::from(self.total) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_counts_sum_to_expected() {
        for expected in 0..20u32 {
            for present in 0..=expected {
                let s = SessionSummary::compute(SessionId(1), expected, present, at(0), at(5));
                assert_eq!(s.present_count + s.absent_count, expected);
                assert_eq!(s.total, expected);
            }
        }
    }

    #[test]
    fn test_absent_clamps_at_zero() {
        let s = SessionSummary::compute(SessionId(1), 2, 5, at(0), at(1));
        assert_eq!(s.absent_count, 0);
        assert_eq!(s.present_count, 5);
    }

    #[test]
    fn test_duration_and_percentage() {
        let s = SessionSummary::compute(SessionId(7), 4, 1, at(0), at(90));
        assert_eq!(s.duration, Duration::from_secs(90));
        assert!((s.attendance_percentage() - 25.0).abs() < 1e-9);

        let empty = SessionSummary::compute(SessionId(8), 0, 0, at(0), at(0));
        assert_eq!(empty.attendance_percentage(), 0.0);
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let json = serde_json::to_string(&StudentId(42)).unwrap();
        assert_eq!(json, "42");
        assert_eq!(StudentId(42).to_string(), "42");
    }
}
