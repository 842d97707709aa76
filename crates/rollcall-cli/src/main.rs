mod config;
mod store;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use rollcall_core::{
    capture_samples, scan_sample_dir, AttendanceMarker, CapturePlan, ClassSlotId, FacultyId,
    FrameClassifier, ModelArtifacts, Notification, RecognitionSession, ScrfdDetector, SessionId,
    SessionTarget, StudentDirectory, StudentId, Trainer,
};
use rollcall_hw::{Camera, CameraError, Frame, FrameSource, ReplaySource};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use store::SqliteStore;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the student directory
    Student {
        #[command(subcommand)]
        action: StudentCommand,
    },
    /// Capture face samples for a student
    Enroll {
        /// Student id
        #[arg(short, long)]
        student: i64,
        /// Samples to save
        #[arg(short, long, default_value_t = 30)]
        count: usize,
        /// Give up after this many frames
        #[arg(long, default_value_t = 300)]
        max_frames: usize,
        /// Read frames from a directory of images instead of the camera
        #[arg(long)]
        replay: Option<PathBuf>,
    },
    /// Retrain the classifier from all enrolled samples
    Train,
    /// Run an attendance session until the source ends or Ctrl-C
    Run {
        #[arg(long)]
        faculty: i64,
        #[arg(long)]
        class_slot: i64,
        /// Expected class size (default: all active students)
        #[arg(long)]
        expected: Option<u32>,
        /// Read frames from a directory of images instead of the camera
        #[arg(long)]
        replay: Option<PathBuf>,
    },
    /// Show the attendance of a finished session
    Report { session_id: i64 },
    /// List V4L2 capture devices
    Devices {
        /// Also open the configured camera and read one frame from it
        #[arg(long)]
        check: bool,
    },
}

#[derive(Subcommand)]
enum StudentCommand {
    Add {
        #[arg(long)]
        code: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        department: String,
    },
    List {
        /// Include deactivated students
        #[arg(long)]
        all: bool,
    },
    /// Deactivate a student; their samples stop resolving after the next retrain
    Remove { id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    tracing::debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Student { action } => student(&config, action),
        Commands::Enroll {
            student,
            count,
            max_frames,
            replay,
        } => enroll(
            &config,
            StudentId(student),
            CapturePlan { count, max_frames },
            replay.as_deref(),
        ),
        Commands::Train => train(&config),
        Commands::Run {
            faculty,
            class_slot,
            expected,
            replay,
        } => {
            run(
                &config,
                FacultyId(faculty),
                ClassSlotId(class_slot),
                expected,
                replay,
            )
            .await
        }
        Commands::Report { session_id } => report(&config, SessionId(session_id)),
        Commands::Devices { check } => devices(&config, check),
    }
}

fn devices(config: &Config, check: bool) -> Result<()> {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No capture devices found");
    }
    for d in devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
    if !check {
        return Ok(());
    }

    let device = &config.camera_device;
    let mut camera =
        Camera::open(device).with_context(|| format!("opening camera {device}"))?;
    let frame = camera
        .capture_frame()
        .with_context(|| format!("reading a frame from {device}"))?;
    println!("{}", describe_check(device, &frame));
    Ok(())
}

fn describe_check(device: &str, frame: &Frame) -> String {
    let dark = if frame.is_dark {
        " (mostly dark: check lighting or the lens cover)"
    } else {
        ""
    };
    format!(
        "{device}: captured {}x{} frame{dark}",
        frame.width, frame.height
    )
}

fn open_store(config: &Config) -> Result<SqliteStore> {
    SqliteStore::open(&config.db_path)
        .with_context(|| format!("opening record store {}", config.db_path.display()))
}

fn load_detector(config: &Config) -> Result<ScrfdDetector> {
    let path = config.scrfd_model_path();
    ScrfdDetector::load(&path, config.detector_config())
        .with_context(|| format!("loading face detector {}", path.display()))
}

fn open_source(device: &str, replay: Option<&Path>) -> Result<Box<dyn FrameSource>, CameraError> {
    match replay {
        Some(dir) => Ok(Box::new(ReplaySource::open(dir)?)),
        None => Ok(Box::new(Camera::open(device)?)),
    }
}

fn student(config: &Config, action: StudentCommand) -> Result<()> {
    let store = open_store(config)?;
    match action {
        StudentCommand::Add {
            code,
            name,
            email,
            department,
        } => {
            let s = store.add_student(&code, &name, &email, &department)?;
            println!("Added student {} ({}) with id {}", s.name, s.code, s.id);
        }
        StudentCommand::List { all } => {
            let students = store.list_students(all)?;
            if students.is_empty() {
                println!("No students");
            }
            for s in students {
                let flag = if s.active { "" } else { "  [inactive]" };
                println!(
                    "{:>5}  {:<12} {:<24} {:<28} {}{flag}",
                    s.id, s.code, s.name, s.email, s.department
                );
            }
        }
        StudentCommand::Remove { id } => {
            if !store.deactivate_student(StudentId(id))? {
                bail!("no active student with id {id}");
            }
            println!("Deactivated student {id}");
        }
    }
    Ok(())
}

fn enroll(
    config: &Config,
    id: StudentId,
    plan: CapturePlan,
    replay: Option<&Path>,
) -> Result<()> {
    let store = open_store(config)?;
    let student = match store.get_student(id)? {
        Some(s) if s.active => s,
        _ => bail!("no active student with id {id}"),
    };

    let mut detector = load_detector(config)?;
    let mut source = open_source(&config.camera_device, replay)?;
    println!("Capturing {} samples of {}; look at the camera", plan.count, student.name);

    let report = capture_samples(
        &mut source,
        &mut detector,
        &config.training_dir,
        &student.name,
        student.id,
        plan,
    )?;
    println!(
        "Saved {} samples to {} ({} frames read)",
        report.saved.len(),
        report.group_dir.display(),
        report.frames_read
    );
    if !report.is_complete(&plan) {
        println!("Fewer samples than requested; run enroll again to add more");
    }
    Ok(())
}

fn train(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let groups = scan_sample_dir(&config.training_dir)?;
    let artifacts = ModelArtifacts::new(&config.artifact_dir);
    let report = Trainer::new(&store).train_and_save(groups, &artifacts)?;
    println!(
        "Trained on {} samples of {} students; artifacts in {}",
        report.samples,
        report.identities,
        artifacts.dir().display()
    );
    if report.skipped_groups > 0 {
        println!("Skipped {} sample groups of unknown or inactive students", report.skipped_groups);
    }
    if report.unreadable_samples > 0 {
        println!("Unreadable samples: {}", report.unreadable_samples);
    }
    Ok(())
}

async fn run(
    config: &Config,
    faculty: FacultyId,
    class_slot: ClassSlotId,
    expected: Option<u32>,
    replay: Option<PathBuf>,
) -> Result<()> {
    let store = Arc::new(open_store(config)?);
    let expected = match expected {
        Some(n) => n,
        None => store.count_active_students()?,
    };

    let detector = load_detector(config)?;
    let artifacts = ModelArtifacts::new(&config.artifact_dir);
    let (classifier, mapping) = FrameClassifier::load(Box::new(detector), &artifacts)
        .context("loading trained model (run `rollcall train` first)")?;

    let marker = Arc::new(Mutex::new(AttendanceMarker::new(Arc::clone(&store))));
    let (mut session, mut rx) = RecognitionSession::new(
        classifier,
        Arc::new(mapping),
        marker,
        store.clone(),
        config.session_config(),
        SessionTarget {
            faculty,
            class_slot,
            expected_population: expected,
        },
    );

    let device = config.camera_device.clone();
    let id = session.start(move || open_source(&device, replay.as_deref()))?;
    println!("Session {id} started for class slot {class_slot}; Ctrl-C to end");

    loop {
        tokio::select! {
            note = rx.recv() => match note {
                Some(note) => print_notification(&note),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("Ending session...");
                break;
            }
        }
    }

    let summary = tokio::task::spawn_blocking(move || session.stop()).await??;
    println!(
        "Session {}: {} present, {} absent of {} ({:.1}%) in {}s",
        summary.session_id,
        summary.present_count,
        summary.absent_count,
        summary.total,
        summary.attendance_percentage(),
        summary.duration.as_secs()
    );
    Ok(())
}

fn print_notification(note: &Notification) {
    match note {
        Notification::Match {
            student,
            name,
            confidence,
            timestamp,
            ..
        } => println!(
            "{}  present: {name} (id {student}, confidence {confidence:.1})",
            timestamp.format("%H:%M:%S")
        ),
        Notification::Progress {
            frame_count,
            recognized_count,
            ..
        } => println!("  {frame_count} frames, {recognized_count} recognised"),
        Notification::Error { message } => eprintln!("session error: {message}"),
    }
}

fn report(config: &Config, id: SessionId) -> Result<()> {
    let store = open_store(config)?;
    let Some(report) = store.session_report(id)? else {
        bail!("no session with id {id}");
    };
    println!(
        "Session {} (faculty {}, class slot {}) {}",
        report.session_id, report.faculty, report.class_slot, report.status
    );
    println!(
        "  started {}{}",
        report.started_at.to_rfc3339(),
        report
            .ended_at
            .map(|t| format!(", ended {}", t.to_rfc3339()))
            .unwrap_or_default()
    );
    println!(
        "  {} present, {} absent of {} ({:.1}%)",
        report.present,
        report.absent(),
        report.total,
        report.attendance_percentage()
    );
    for row in &report.rows {
        let score = row
            .match_score
            .map(|s| format!("{s:.1}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {}  {:<12} {:<24} score {score}",
            row.timestamp.format("%H:%M:%S"),
            row.code,
            row.name
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    #[test]
    fn test_describe_check() {
        let lit = Frame::from_gray(GrayImage::from_pixel(640, 480, Luma([120])), 1);
        assert_eq!(
            describe_check("/dev/video0", &lit),
            "/dev/video0: captured 640x480 frame"
        );
        let dark = Frame::from_gray(GrayImage::from_pixel(8, 8, Luma([0])), 2);
        assert!(describe_check("/dev/video2", &dark).contains("mostly dark"));
    }
}
