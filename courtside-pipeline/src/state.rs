//! Persisted run state.
//!
//! One JSON document per run at `{state_dir}/{pipeline_id}.json` answers
//! "what's the status of run X?" across process restarts. Every mutation
//! goes through the manager's mutex and is followed by a best-effort atomic
//! write (temp file, then rename), so external observers always see
//! consistent JSON.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use courtside_types::format_utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Initialized,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Initializing,
    UploadingChapters,
    DetectingGames,
    ProcessingGames,
    WaitingEncode,
    Cleanup,
    Completed,
    Failed,
}

/// Progress weighting per stage boundary.
pub fn stage_progress(stage: Stage) -> u8 {
    match stage {
        Stage::Initializing => 0,
        Stage::UploadingChapters => 5,
        Stage::DetectingGames => 40,
        Stage::ProcessingGames => 50,
        Stage::WaitingEncode => 90,
        Stage::Cleanup => 95,
        Stage::Completed | Stage::Failed => 100,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Pending,
    Processing,
    EncodeSubmitted,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AngleStatus {
    Pending,
    Submitted,
    Completed,
    Failed,
    Corrupted,
    Skipped,
}

impl AngleStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AngleStatus::Pending | AngleStatus::Submitted)
    }
}

/// One uploaded chapter, remembered for clip planning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedChapter {
    pub s3_key: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionUploadState {
    pub session_id: String,
    pub segment_session: String,
    pub angle_code: String,
    pub interface_id: String,
    pub status: UploadStatus,
    #[serde(default)]
    pub total_chapters: u32,
    #[serde(default)]
    pub chapters_uploaded: u32,
    #[serde(default)]
    pub bytes_uploaded: u64,
    #[serde(default)]
    pub uploaded_chapters: Vec<UploadedChapter>,
    #[serde(default)]
    pub s3_prefix: Option<String>,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AngleState {
    pub angle_code: String,
    pub session_id: String,
    pub status: AngleStatus,
    #[serde(default)]
    pub s3_key: Option<String>,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub registered: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameState {
    pub game_id: String,
    #[serde(default)]
    pub registry_game_id: Option<String>,
    pub game_number: u32,
    pub status: GameStatus,
    #[serde(default)]
    pub angles: BTreeMap<String, AngleState>,
    #[serde(default)]
    pub error: Option<String>,
}

/// The whole persisted document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub pipeline_id: String,
    pub jetson_id: String,
    pub status: RunStatus,
    pub stage: Stage,
    #[serde(default)]
    pub stage_message: String,
    #[serde(default)]
    pub progress: u8,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub recording_start: Option<String>,
    #[serde(default)]
    pub recording_end: Option<String>,
    #[serde(default)]
    pub session_uploads: BTreeMap<String, SessionUploadState>,
    #[serde(default)]
    pub games: BTreeMap<String, GameState>,
    #[serde(default)]
    pub total_sessions: u32,
    #[serde(default)]
    pub sessions_completed: u32,
    #[serde(default)]
    pub sessions_skipped_unk: u32,
    #[serde(default)]
    pub total_games: u32,
    #[serde(default)]
    pub games_completed: u32,
    #[serde(default)]
    pub encode_jobs_submitted: u32,
    #[serde(default)]
    pub encode_jobs_completed: u32,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl PipelineState {
    fn new(pipeline_id: &str, jetson_id: &str) -> Self {
        let now = format_utc(chrono::Utc::now());
        PipelineState {
            pipeline_id: pipeline_id.to_string(),
            jetson_id: jetson_id.to_string(),
            status: RunStatus::Initialized,
            stage: Stage::Initializing,
            stage_message: String::new(),
            progress: 0,
            created_at: now.clone(),
            updated_at: now,
            completed_at: None,
            recording_start: None,
            recording_end: None,
            session_uploads: BTreeMap::new(),
            games: BTreeMap::new(),
            total_sessions: 0,
            sessions_completed: 0,
            sessions_skipped_unk: 0,
            total_games: 0,
            games_completed: 0,
            encode_jobs_submitted: 0,
            encode_jobs_completed: 0,
            errors: Vec::new(),
        }
    }
}

/// Thread-safe state holder with JSON persistence.
pub struct StateManager {
    state: Mutex<PipelineState>,
    path: PathBuf,
}

impl StateManager {
    /// Load the existing document for this run id, or start fresh. A run
    /// resumed after a restart keeps its counters.
    pub fn load_or_create(state_dir: &Path, pipeline_id: &str, jetson_id: &str) -> Self {
        let path = state_dir.join(format!("{pipeline_id}.json"));
        let state = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<PipelineState>(&contents) {
                Ok(state) => {
                    info!("resuming pipeline state for {pipeline_id}");
                    state
                }
                Err(err) => {
                    warn!("unreadable state file for {pipeline_id}, starting fresh: {err}");
                    PipelineState::new(pipeline_id, jetson_id)
                }
            },
            Err(_) => PipelineState::new(pipeline_id, jetson_id),
        };
        StateManager {
            state: Mutex::new(state),
            path,
        }
    }

    /// Run a mutation under the lock and persist the result.
    pub fn update<R>(&self, f: impl FnOnce(&mut PipelineState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        let out = f(&mut state);
        state.updated_at = format_utc(chrono::Utc::now());
        self.persist(&state);
        out
    }

    pub fn snapshot(&self) -> PipelineState {
        self.state.lock().unwrap().clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Best-effort atomic write: temp file in the same directory, rename
    /// over the target. Persistence failures are logged, never escalated.
    fn persist(&self, state: &PipelineState) {
        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = self.path.with_extension("json.tmp");
            let body = serde_json::to_vec_pretty(state)?;
            std::fs::write(&tmp, body)?;
            std::fs::rename(&tmp, &self.path)?;
            Ok(())
        })();
        if let Err(err) = result {
            warn!("could not persist pipeline state: {err}");
        }
    }

    pub fn set_stage(&self, stage: Stage, message: impl Into<String>) {
        let message = message.into();
        self.update(|state| {
            state.stage = stage;
            state.stage_message = message;
            state.progress = state.progress.max(stage_progress(stage));
        });
    }

    pub fn set_progress(&self, progress: u8) {
        self.update(|state| state.progress = state.progress.max(progress.min(100)));
    }

    pub fn add_error(&self, error: impl Into<String>) {
        let error = error.into();
        self.update(|state| state.errors.push(error));
    }
}

/// Summary row for listing persisted runs.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub pipeline_id: String,
    pub jetson_id: String,
    pub status: RunStatus,
    pub created_at: String,
    pub updated_at: String,
    pub total_sessions: u32,
    pub sessions_completed: u32,
    pub total_games: u32,
    pub games_completed: u32,
}

/// Enumerate persisted runs, newest first; unreadable files are skipped.
pub fn list_runs(state_dir: &Path) -> Vec<RunSummary> {
    let mut runs = Vec::new();
    let Ok(entries) = std::fs::read_dir(state_dir) else {
        return runs;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Ok(contents) = std::fs::read_to_string(&path) else {
            continue;
        };
        match serde_json::from_str::<PipelineState>(&contents) {
            Ok(state) => runs.push(RunSummary {
                pipeline_id: state.pipeline_id,
                jetson_id: state.jetson_id,
                status: state.status,
                created_at: state.created_at,
                updated_at: state.updated_at,
                total_sessions: state.total_sessions,
                sessions_completed: state.sessions_completed,
                total_games: state.total_games,
                games_completed: state.games_completed,
            }),
            Err(err) => {
                warn!("skipping unreadable state file {}: {err}", path.display());
            }
        }
    }
    runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::load_or_create(dir.path(), "run-1", "jetson-1");
        manager.update(|state| {
            state.status = RunStatus::Running;
            state.total_sessions = 2;
            state.sessions_completed = 1;
        });
        manager.set_stage(Stage::UploadingChapters, "uploading");

        // a fresh manager for the same id resumes the counters
        let resumed = StateManager::load_or_create(dir.path(), "run-1", "jetson-1");
        let state = resumed.snapshot();
        assert_eq!(state.status, RunStatus::Running);
        assert_eq!(state.total_sessions, 2);
        assert_eq!(state.sessions_completed, 1);
        assert_eq!(state.stage, Stage::UploadingChapters);
        assert_eq!(state.progress, 5);
    }

    #[test]
    fn persisted_document_has_the_published_schema() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::load_or_create(dir.path(), "run-2", "jetson-1");
        manager.update(|state| {
            state.errors.push("boom".to_string());
        });
        let raw = std::fs::read_to_string(manager.path()).unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        for key in [
            "pipeline_id",
            "jetson_id",
            "status",
            "created_at",
            "updated_at",
            "session_uploads",
            "games",
            "total_sessions",
            "sessions_completed",
            "total_games",
            "games_completed",
            "errors",
        ] {
            assert!(v.get(key).is_some(), "missing {key}");
        }
        assert_eq!(v["errors"][0], "boom");
        assert!(v["created_at"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn progress_is_monotone() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::load_or_create(dir.path(), "run-3", "jetson-1");
        manager.set_progress(42);
        manager.set_progress(17);
        assert_eq!(manager.snapshot().progress, 42);
        manager.set_progress(130);
        assert_eq!(manager.snapshot().progress, 42.max(100));
    }

    #[test]
    fn stage_weights_follow_the_plan() {
        assert_eq!(stage_progress(Stage::Initializing), 0);
        assert_eq!(stage_progress(Stage::UploadingChapters), 5);
        assert_eq!(stage_progress(Stage::DetectingGames), 40);
        assert_eq!(stage_progress(Stage::ProcessingGames), 50);
        assert_eq!(stage_progress(Stage::WaitingEncode), 90);
        assert_eq!(stage_progress(Stage::Cleanup), 95);
        assert_eq!(stage_progress(Stage::Completed), 100);
    }

    #[test]
    fn unreadable_state_files_are_skipped_by_listing() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::load_or_create(dir.path(), "run-4", "jetson-1");
        manager.update(|_| ());
        std::fs::write(dir.path().join("bad.json"), b"{not json").unwrap();

        let runs = list_runs(dir.path());
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].pipeline_id, "run-4");
    }
}
