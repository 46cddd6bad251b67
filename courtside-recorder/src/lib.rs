//! Recording session controller: a per-camera state machine driving an
//! external recorder tool over the camera's wired transport.
//!
//! ```text
//! Idle ──start──► Arming ──confirm──► Recording ──stop──► Draining ──► Idle
//!                   │                      │                   │
//!                   └── ArmFailure         └── LostCamera      └── IngestFailure
//! ```
//!
//! Arming snapshots the camera's file set; Draining diffs the post-stop set
//! against it to identify the chapters this session produced. The recorder
//! subprocess is supervised through its line output: a `recording` or
//! `capturing` line confirms the session, error markers are recorded, and an
//! unexpected early exit fails the arm.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use courtside_camera::{CameraAdapter, CameraFleet};
use courtside_types::{sort_chapters, Angle, ChapterRef, SegmentSession};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("camera error: {source}")]
    Camera {
        #[from]
        source: courtside_camera::Error,
    },
    #[error("already recording on {interface}")]
    AlreadyRecording { interface: String },
    #[error("no recording in progress on {interface}")]
    NotRecording { interface: String },
    #[error("recorder failed to arm: {message}")]
    ArmFailure {
        message: String,
        /// Captured tail of the recorder output, for the operator.
        output_tail: String,
    },
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// Where a session currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Arming,
    Recording,
    Draining,
}

/// Per-camera limit on how many "new" files a drain may claim. A diff larger
/// than this means the pre-record snapshot was not captured; trimming to the
/// newest files keeps a bug from claiming the whole SD card.
pub const MAX_NEW_CHAPTERS: usize = 20;

/// Interval the camera needs to finalise its filesystem after a stop.
pub const DRAIN_WAIT: Duration = Duration::from_secs(3);

const TERM_WAIT: Duration = Duration::from_secs(5);
const KILL_WAIT: Duration = Duration::from_secs(2);
const ARM_GRACE: Duration = Duration::from_secs(3);
const OUTPUT_TAIL_BYTES: usize = 500;

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// External recorder executable issuing the shutter commands.
    pub recorder_exe: String,
    /// Maximum record time handed to the recorder tool.
    pub record_time: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        RecorderConfig {
            recorder_exe: "gopro-video".to_string(),
            record_time: Duration::from_secs(18_000),
        }
    }
}

/// Snapshot handed back by [RecordingController::start].
#[derive(Debug, Clone)]
pub struct StartedRecording {
    pub interface: String,
    pub peer: Ipv4Addr,
    pub camera_name: String,
    pub angle: Option<Angle>,
    pub segment_session: SegmentSession,
    pub started_at: DateTime<Utc>,
    pub state: SessionState,
}

/// Artefacts of a completed drain; the orchestrator owns them from here on.
#[derive(Debug, Clone)]
pub struct DrainOutcome {
    pub segment_session: SegmentSession,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub chapters: Vec<ChapterRef>,
    pub total_bytes: u64,
    /// Error markers observed mid-session, if any.
    pub recorded_error: Option<String>,
    /// True when the diff was implausibly large and got trimmed.
    pub trimmed: bool,
}

/// What a stop produced: a drained session, or the cancellation of an arm
/// that never confirmed.
#[derive(Debug, Clone)]
pub enum StopOutcome {
    Drained(DrainOutcome),
    ArmCancelled { error: String },
}

/// Classified recorder output line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LineEvent {
    Confirmed,
    ErrorMarker(&'static str),
    Exiting,
    Other,
}

fn classify_line(line: &str) -> LineEvent {
    let lower = line.to_lowercase();
    if line.contains("ErrorCode.ERROR") || line.contains("Internal Server Error") {
        return LineEvent::ErrorMarker("recorder reported a camera error");
    }
    if lower.contains("recording") || lower.contains("capturing") {
        return LineEvent::Confirmed;
    }
    if lower.contains("exiting") {
        return LineEvent::Exiting;
    }
    LineEvent::Other
}

/// `post \ pre`, restricted to video files, in chapter order, trimmed to the
/// newest [MAX_NEW_CHAPTERS] when the diff is implausibly large.
fn diff_new_chapters(
    pre: &HashSet<String>,
    post: Vec<ChapterRef>,
    max: usize,
) -> (Vec<ChapterRef>, bool) {
    let mut fresh: Vec<ChapterRef> = post
        .into_iter()
        .filter(|c| c.is_mp4() && !pre.contains(&c.filename))
        .collect();
    sort_chapters(&mut fresh);
    if fresh.len() > max {
        let skip = fresh.len() - max;
        (fresh.split_off(skip), true)
    } else {
        (fresh, false)
    }
}

struct ActiveRecording {
    peer: Ipv4Addr,
    camera_name: String,
    angle: Option<Angle>,
    segment_session: SegmentSession,
    started_at: DateTime<Utc>,
    pre_files: HashSet<String>,
    state: SessionState,
    confirmed: bool,
    stopping: bool,
    error: Option<String>,
    output_tail: String,
    child: Option<Child>,
}

type Shared = Arc<tokio::sync::Mutex<ActiveRecording>>;

/// Owns the in-flight recording map; one instance per process.
pub struct RecordingController {
    adapter: Arc<CameraAdapter>,
    config: RecorderConfig,
    active: Mutex<HashMap<String, Shared>>,
}

impl RecordingController {
    pub fn new(adapter: Arc<CameraAdapter>, config: RecorderConfig) -> Self {
        RecordingController {
            adapter,
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_recording(&self, interface: &str) -> bool {
        self.active.lock().unwrap().contains_key(interface)
    }

    /// Current state of a session, if one is active on the interface.
    pub async fn state(&self, interface: &str) -> Option<(SessionState, Option<String>)> {
        let shared = self.active.lock().unwrap().get(interface).cloned()?;
        let rec = shared.lock().await;
        Some((rec.state, rec.error.clone()))
    }

    /// Arm and start a recording on one camera.
    pub async fn start(&self, interface: &str) -> Result<StartedRecording> {
        if self.is_recording(interface) {
            return Err(Error::AlreadyRecording {
                interface: interface.to_string(),
            });
        }

        let peer = self.adapter.peer_address_for(interface).await?;

        // Arming: control mode, preset, then the pre-record snapshot that
        // draining will diff against.
        self.adapter.enable_wired_control(peer).await?;
        self.adapter.set_video_preset(peer).await?;
        let camera_name = self.adapter.friendly_name(peer).await.unwrap_or_default();
        let angle = self.adapter.angle_for_name(&camera_name);

        let pre_files: HashSet<String> = self
            .adapter
            .list_media(peer)
            .await?
            .into_iter()
            .map(|c| c.filename)
            .collect();
        if pre_files.is_empty() {
            warn!("{interface}: empty pre-record file set; diff may over-claim");
        }

        let started_at = Utc::now();
        let segment_session = SegmentSession::new(interface, angle, started_at);

        let mut child = Command::new(&self.config.recorder_exe)
            .arg("--wired")
            .arg("--wifi_interface")
            .arg(interface)
            .arg("--record_time")
            .arg(self.config.record_time.as_secs().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let shared: Shared = Arc::new(tokio::sync::Mutex::new(ActiveRecording {
            peer,
            camera_name: camera_name.clone(),
            angle,
            segment_session: segment_session.clone(),
            started_at,
            pre_files,
            state: SessionState::Arming,
            confirmed: false,
            stopping: false,
            error: None,
            output_tail: String::new(),
            child: Some(child),
        }));

        self.active
            .lock()
            .unwrap()
            .insert(interface.to_string(), shared.clone());

        self.spawn_monitor(interface.to_string(), shared.clone(), stdout, stderr);

        // Give the recorder a short grace window: an exit in this window is
        // an arm failure, a confirmation line moves us to Recording.
        tokio::time::sleep(ARM_GRACE).await;
        {
            let rec = shared.lock().await;
            if rec.child.is_none() && !rec.confirmed {
                let tail = rec.output_tail.clone();
                let message = rec
                    .error
                    .clone()
                    .unwrap_or_else(|| "recorder exited before confirming".to_string());
                drop(rec);
                self.active.lock().unwrap().remove(interface);
                return Err(Error::ArmFailure {
                    message,
                    output_tail: tail,
                });
            }
        }

        let state = shared.lock().await.state;
        info!("{interface}: recording session {segment_session} started");
        Ok(StartedRecording {
            interface: interface.to_string(),
            peer,
            camera_name,
            angle,
            segment_session,
            started_at,
            state,
        })
    }

    fn spawn_monitor(
        &self,
        interface: String,
        shared: Shared,
        stdout: Option<tokio::process::ChildStdout>,
        stderr: Option<tokio::process::ChildStderr>,
    ) {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        if let Some(stdout) = stdout {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
        }

        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                debug!("{interface} recorder: {line}");
                let mut rec = shared.lock().await;
                push_tail(&mut rec.output_tail, &line);
                match classify_line(&line) {
                    LineEvent::Confirmed => {
                        if !rec.confirmed {
                            rec.confirmed = true;
                            rec.state = SessionState::Recording;
                            info!("{interface}: recording confirmed");
                        }
                    }
                    LineEvent::ErrorMarker(msg) => {
                        // Stored, but recording continues until stop.
                        error!("{interface}: {msg}");
                        rec.error = Some(msg.to_string());
                    }
                    LineEvent::Exiting => {
                        if !rec.confirmed {
                            rec.error =
                                Some("recorder exiting before confirmation".to_string());
                        }
                    }
                    LineEvent::Other => {}
                }
            }

            // Output streams closed: the recorder exited.
            let mut rec = shared.lock().await;
            if let Some(mut child) = rec.child.take() {
                let _ = child.wait().await;
            }
            if !rec.stopping {
                if rec.confirmed {
                    rec.error = Some("recorder exited unexpectedly mid-session".to_string());
                    error!("{interface}: lost camera, recorder exited mid-session");
                } else if rec.error.is_none() {
                    rec.error = Some("recorder exited before confirming".to_string());
                }
            }
        });
    }

    /// Stop a session: terminate the recorder, stop the shutter, drain.
    pub async fn stop(&self, interface: &str) -> Result<StopOutcome> {
        let shared = self
            .active
            .lock()
            .unwrap()
            .get(interface)
            .cloned()
            .ok_or_else(|| Error::NotRecording {
                interface: interface.to_string(),
            })?;

        let (peer, confirmed, child) = {
            let mut rec = shared.lock().await;
            rec.stopping = true;
            (rec.peer, rec.confirmed, rec.child.take())
        };

        if let Some(child) = child {
            terminate_with_escalation(child).await;
        }

        if !confirmed {
            // Stop during Arming: cancel, no drain, back to Idle with the
            // arm failure populated.
            let error = {
                let rec = shared.lock().await;
                rec.error
                    .clone()
                    .unwrap_or_else(|| "recording stop before confirmation".to_string())
            };
            self.active.lock().unwrap().remove(interface);
            info!("{interface}: arm cancelled by stop");
            return Ok(StopOutcome::ArmCancelled { error });
        }

        {
            let mut rec = shared.lock().await;
            rec.state = SessionState::Draining;
        }

        if let Err(err) = self.adapter.stop_shutter(peer).await {
            warn!("{interface}: could not send shutter stop: {err}");
        }

        // Let the camera finalise its filesystem before listing.
        tokio::time::sleep(DRAIN_WAIT).await;

        let post = self.adapter.list_media(peer).await?;
        let ended_at = Utc::now();

        let outcome = {
            let rec = shared.lock().await;
            let (chapters, trimmed) =
                diff_new_chapters(&rec.pre_files, post, MAX_NEW_CHAPTERS);
            if trimmed {
                warn!(
                    "{interface}: pre-record snapshot looks unreliable, trimmed diff to last {MAX_NEW_CHAPTERS} files"
                );
            }
            let total_bytes = chapters.iter().map(|c| c.size_bytes).sum();
            DrainOutcome {
                segment_session: rec.segment_session.clone(),
                started_at: rec.started_at,
                ended_at,
                chapters,
                total_bytes,
                recorded_error: rec.error.clone(),
                trimmed,
            }
        };

        self.active.lock().unwrap().remove(interface);
        info!(
            "{interface}: drained {} chapters ({} bytes)",
            outcome.chapters.len(),
            outcome.total_bytes
        );
        Ok(StopOutcome::Drained(outcome))
    }

    /// Camera name and angle of an active session.
    pub async fn session_info(&self, interface: &str) -> Option<(String, Option<Angle>)> {
        let shared = self.active.lock().unwrap().get(interface).cloned()?;
        let rec = shared.lock().await;
        Some((rec.camera_name.clone(), rec.angle))
    }
}

fn push_tail(tail: &mut String, line: &str) {
    tail.push_str(line);
    tail.push('\n');
    if tail.len() > OUTPUT_TAIL_BYTES {
        let cut = tail.len() - OUTPUT_TAIL_BYTES;
        // keep the suffix; char boundaries are respected by finding the next
        // boundary at or after the cut point
        let boundary = (cut..tail.len())
            .find(|&i| tail.is_char_boundary(i))
            .unwrap_or(0);
        tail.drain(..boundary);
    }
}

/// SIGTERM, wait 5 s, SIGKILL, wait 2 s.
async fn terminate_with_escalation(mut child: Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        if tokio::time::timeout(TERM_WAIT, child.wait()).await.is_ok() {
            return;
        }
        warn!("recorder ignored SIGTERM, escalating");
    }
    let _ = child.kill().await;
    let _ = tokio::time::timeout(KILL_WAIT, child.wait()).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chapter(name: &str, size: u64) -> ChapterRef {
        ChapterRef {
            directory: "100GOPRO".to_string(),
            filename: name.to_string(),
            size_bytes: size,
        }
    }

    #[test]
    fn line_classification() {
        assert_eq!(classify_line("Status: recording"), LineEvent::Confirmed);
        assert_eq!(classify_line("now Capturing frames"), LineEvent::Confirmed);
        assert_eq!(
            classify_line("got ErrorCode.ERROR from shutter"),
            LineEvent::ErrorMarker("recorder reported a camera error")
        );
        assert_eq!(
            classify_line("HTTP 500 Internal Server Error"),
            LineEvent::ErrorMarker("recorder reported a camera error")
        );
        assert_eq!(classify_line("exiting now"), LineEvent::Exiting);
        assert_eq!(classify_line("waiting for camera"), LineEvent::Other);
    }

    #[test]
    fn pre_post_diff_finds_new_chapters() {
        let pre: HashSet<String> = ["GX010001.MP4", "GX010002.MP4"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let post = vec![
            chapter("GX010001.MP4", 100),
            chapter("GX010002.MP4", 100),
            chapter("GX010041.MP4", 10_208_434_006),
        ];
        let (fresh, trimmed) = diff_new_chapters(&pre, post, MAX_NEW_CHAPTERS);
        assert!(!trimmed);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].filename, "GX010041.MP4");
    }

    #[test]
    fn diff_excludes_non_video_files() {
        let pre = HashSet::new();
        let post = vec![chapter("GX010041.MP4", 1), chapter("GOPR0001.JPG", 1)];
        let (fresh, _) = diff_new_chapters(&pre, post, MAX_NEW_CHAPTERS);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].filename, "GX010041.MP4");
    }

    #[test]
    fn oversized_diff_is_trimmed_to_newest() {
        let pre = HashSet::new();
        let post: Vec<ChapterRef> = (1..=50)
            .map(|i| chapter(&format!("GX01{i:04}.MP4"), i as u64))
            .collect();
        let (fresh, trimmed) = diff_new_chapters(&pre, post, MAX_NEW_CHAPTERS);
        assert!(trimmed);
        assert_eq!(fresh.len(), MAX_NEW_CHAPTERS);
        // kept the *last* twenty in chapter order
        assert_eq!(fresh.first().unwrap().filename, "GX010031.MP4");
        assert_eq!(fresh.last().unwrap().filename, "GX010050.MP4");
    }

    #[test]
    fn diff_orders_fragments_within_recording() {
        let pre = HashSet::new();
        let post = vec![
            chapter("GX030028.MP4", 3),
            chapter("GX010028.MP4", 1),
            chapter("GX020028.MP4", 2),
        ];
        let (fresh, _) = diff_new_chapters(&pre, post, MAX_NEW_CHAPTERS);
        let names: Vec<_> = fresh.iter().map(|c| c.filename.as_str()).collect();
        assert_eq!(names, vec!["GX010028.MP4", "GX020028.MP4", "GX030028.MP4"]);
    }

    #[test]
    fn output_tail_is_bounded() {
        let mut tail = String::new();
        for i in 0..100 {
            push_tail(&mut tail, &format!("line number {i} with some padding"));
        }
        assert!(tail.len() <= OUTPUT_TAIL_BYTES);
        assert!(tail.contains("line number 99"));
    }
}
