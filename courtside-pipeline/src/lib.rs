//! Pipeline orchestrator: one long-running task per run, driving ingest,
//! game discovery, encode submission, completion tracking, registration and
//! cleanup, with per-stage state persisted across restarts.
//!
//! The orchestrator owns policy. Adapters return categorised errors; this
//! crate decides what is recorded, what is retried and what is skipped, and
//! it never dispatches on error message text.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use courtside_camera::CameraFleet;
use courtside_catalog::Catalog;
use courtside_encode::{EncodeFleet, EncodeRequest, JobState};
use courtside_planner::{deliverable_key, plan_clip, PlannedChapter, CLIP_BUFFER_SECONDS};
use courtside_registry::{RegisterVideo, VideoRegistry};
use courtside_transfer::{
    chapter_object_key, raw_chapter_prefix, ChapterSource, TransferEngine, TransferPath,
};
use courtside_types::{
    format_utc, sort_chapters, Angle, GameDoc, ProcessedGame, SessionDoc,
};

pub mod state;

pub use state::{
    list_runs, AngleState, AngleStatus, GameState, GameStatus, PipelineState, RunStatus,
    RunSummary, SessionUploadState, Stage, StateManager, UploadStatus, UploadedChapter,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("pipeline fatal: {0}")]
    Fatal(String),
}

/// Builds a byte source for one camera peer; swapped out in tests.
pub trait ChapterSourceFactory: Send + Sync {
    fn for_peer(&self, peer: Ipv4Addr) -> Arc<dyn ChapterSource>;
}

/// Production factory over the camera HTTP media endpoint.
pub struct CameraSources {
    pub connect_timeout: Duration,
}

impl ChapterSourceFactory for CameraSources {
    fn for_peer(&self, peer: Ipv4Addr) -> Arc<dyn ChapterSource> {
        match courtside_transfer::CameraChapterSource::new(peer, self.connect_timeout) {
            Ok(source) => Arc::new(source),
            Err(err) => {
                // Client construction only fails on TLS backend trouble;
                // surface it at first use instead of here.
                error!("could not build camera source for {peer}: {err}");
                Arc::new(BrokenSource(err.to_string()))
            }
        }
    }
}

struct BrokenSource(String);

#[async_trait::async_trait]
impl ChapterSource for BrokenSource {
    async fn open(
        &self,
        _chapter: &courtside_types::ChapterRef,
        _offset: u64,
    ) -> courtside_transfer::Result<courtside_transfer::OpenOutcome> {
        Err(courtside_transfer::Error::Exhausted {
            filename: String::new(),
            attempts: 0,
            last: self.0.clone(),
        })
    }
}

/// Orchestrator tuning and identity.
#[derive(Clone)]
pub struct PipelineConfig {
    pub jetson_id: String,
    /// Court tag, the first segment of deliverable keys.
    pub location: String,
    pub state_dir: PathBuf,
    pub auto_delete_sd: bool,
    pub transfer_path: TransferPath,
    pub keep_alive_interval: Duration,
    pub encode_wait_timeout: Duration,
    pub encode_poll_interval: Duration,
    pub clip_buffer_seconds: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            jetson_id: "unknown".to_string(),
            location: "default-location".to_string(),
            state_dir: PathBuf::from("/tmp/pipeline_states"),
            auto_delete_sd: true,
            transfer_path: TransferPath::Streaming,
            keep_alive_interval: Duration::from_secs(30),
            encode_wait_timeout: Duration::from_secs(3600),
            encode_poll_interval: Duration::from_secs(30),
            clip_buffer_seconds: CLIP_BUFFER_SECONDS,
        }
    }
}

/// The adapter seams a run drives.
pub struct PipelineDeps {
    pub catalog: Arc<dyn Catalog>,
    pub cameras: Arc<dyn CameraFleet>,
    pub sources: Arc<dyn ChapterSourceFactory>,
    pub engine: Arc<TransferEngine>,
    pub encode: Option<Arc<dyn EncodeFleet>>,
    pub registry: Option<Arc<dyn VideoRegistry>>,
}

struct IngestReport {
    prefix: String,
    chapters: Vec<UploadedChapter>,
    bytes: u64,
}

pub struct PipelineOrchestrator {
    config: PipelineConfig,
    deps: PipelineDeps,
    runs: Mutex<BTreeMap<String, Arc<StateManager>>>,
}

fn new_run_id() -> String {
    let full = uuid::Uuid::new_v4().simple().to_string();
    full[..8].to_string()
}

impl PipelineOrchestrator {
    pub fn new(config: PipelineConfig, deps: PipelineDeps) -> Self {
        PipelineOrchestrator {
            config,
            deps,
            runs: Mutex::new(BTreeMap::new()),
        }
    }

    /// Status of a run started by this process.
    pub fn run_status(&self, run_id: &str) -> Option<PipelineState> {
        self.runs
            .lock()
            .unwrap()
            .get(run_id)
            .map(|m| m.snapshot())
    }

    /// All persisted runs, including those from previous processes.
    pub fn persisted_runs(&self) -> Vec<RunSummary> {
        list_runs(&self.config.state_dir)
    }

    /// Fire-and-forget start; progress is observable via [Self::run_status].
    pub fn start_run(self: Arc<Self>, sessions: Vec<SessionDoc>) -> String {
        let run_id = new_run_id();
        let id = run_id.clone();
        tokio::spawn(async move {
            self.run_with_id(id, sessions).await;
        });
        run_id
    }

    /// Run to completion and return the final state document.
    pub async fn run(&self, sessions: Vec<SessionDoc>) -> PipelineState {
        self.run_with_id(new_run_id(), sessions).await
    }

    async fn run_with_id(&self, run_id: String, sessions: Vec<SessionDoc>) -> PipelineState {
        let manager = Arc::new(StateManager::load_or_create(
            &self.config.state_dir,
            &run_id,
            &self.config.jetson_id,
        ));
        self.runs
            .lock()
            .unwrap()
            .insert(run_id.clone(), manager.clone());

        info!("[pipeline {run_id}] started with {} sessions", sessions.len());
        if let Err(Error::Fatal(message)) = self.execute(&manager, sessions).await {
            error!("[pipeline {run_id}] fatal: {message}");
            manager.update(|s| {
                s.status = RunStatus::Failed;
                s.stage = Stage::Failed;
                s.stage_message = message.clone();
                s.errors.push(message.clone());
                s.completed_at = Some(format_utc(Utc::now()));
            });
        }
        manager.snapshot()
    }

    async fn execute(
        &self,
        manager: &Arc<StateManager>,
        sessions: Vec<SessionDoc>,
    ) -> Result<()> {
        let run_id = manager.snapshot().pipeline_id;

        // ---------------- phase 1: normalise inputs ----------------
        manager.set_stage(Stage::Initializing, "Normalising input sessions");
        manager.update(|s| s.status = RunStatus::Running);

        let mut valid: Vec<SessionDoc> = Vec::new();
        let mut skipped_unk = 0u32;
        for session in sessions {
            match session.angle() {
                Some(_) => valid.push(session),
                None => {
                    skipped_unk += 1;
                    info!(
                        "[pipeline {run_id}] skipping session {} with angle {:?}",
                        session.id, session.angle_code
                    );
                }
            }
        }

        let window = recording_window(&valid);
        manager.update(|s| {
            s.sessions_skipped_unk = skipped_unk;
            s.total_sessions = valid.len() as u32;
            if let Some((start, end)) = window {
                s.recording_start = Some(format_utc(start));
                s.recording_end = Some(format_utc(end));
            }
            for session in &valid {
                s.session_uploads.insert(
                    session.id.clone(),
                    SessionUploadState {
                        session_id: session.id.clone(),
                        segment_session: session.segment_session.as_str().to_string(),
                        angle_code: session.angle_code.clone(),
                        interface_id: session.interface_id.clone(),
                        status: UploadStatus::Pending,
                        total_chapters: session.total_chapters,
                        chapters_uploaded: 0,
                        bytes_uploaded: 0,
                        uploaded_chapters: Vec::new(),
                        s3_prefix: session.s3_prefix.clone(),
                        skipped: false,
                        error: None,
                    },
                );
            }
        });
        manager.set_progress(5);

        // ---------------- phase 2: ingest chapters ----------------
        manager.set_stage(
            Stage::UploadingChapters,
            format!("Uploading chapters from {} sessions", valid.len()),
        );

        // Ingest is serialised: the cameras cannot serve concurrent large
        // transfers, and each session has its own camera.
        let total = valid.len().max(1);
        for (index, session) in valid.iter().enumerate() {
            if let Some(prefix) = &session.s3_prefix {
                info!(
                    "[pipeline {run_id}] session {} already ingested at {prefix}",
                    session.id
                );
                manager.update(|s| {
                    if let Some(upload) = s.session_uploads.get_mut(&session.id) {
                        upload.status = UploadStatus::Completed;
                        upload.skipped = true;
                        upload.chapters_uploaded = upload.total_chapters;
                    }
                    s.sessions_completed += 1;
                });
            } else {
                manager.update(|s| {
                    if let Some(upload) = s.session_uploads.get_mut(&session.id) {
                        upload.status = UploadStatus::Uploading;
                    }
                });
                match self.ingest_session(manager, session).await {
                    Ok(report) => {
                        if let Err(err) = self
                            .deps
                            .catalog
                            .set_session_s3_prefix(&session.id, &report.prefix)
                            .await
                        {
                            // The bytes are already in place; record the
                            // catalog miss and keep going.
                            manager
                                .add_error(format!("session {}: {err}", session.id));
                        }
                        manager.update(|s| {
                            if let Some(upload) = s.session_uploads.get_mut(&session.id) {
                                upload.status = UploadStatus::Completed;
                                upload.s3_prefix = Some(report.prefix.clone());
                                upload.chapters_uploaded = report.chapters.len() as u32;
                                upload.bytes_uploaded = report.bytes;
                                upload.uploaded_chapters = report.chapters.clone();
                            }
                            s.sessions_completed += 1;
                        });
                    }
                    Err(message) => {
                        warn!("[pipeline {run_id}] session {} failed: {message}", session.id);
                        manager.update(|s| {
                            if let Some(upload) = s.session_uploads.get_mut(&session.id) {
                                upload.status = UploadStatus::Failed;
                                upload.error = Some(message.clone());
                            }
                            s.errors
                                .push(format!("{}: {message}", session.angle_code));
                        });
                    }
                }
            }
            let progress = 5 + (((index + 1) * 35) / total) as u8;
            manager.set_progress(progress);
        }

        // ---------------- phase 3: discover games ----------------
        manager.set_stage(Stage::DetectingGames, "Detecting games in the recording window");

        let games: Vec<GameDoc> = match window {
            None => Vec::new(),
            Some((start, end)) => match self.deps.catalog.games_in_time_range(start, end).await {
                Ok(games) => games,
                Err(err) => {
                    manager.add_error(format!("game discovery failed: {err}"));
                    Vec::new()
                }
            },
        };

        if games.is_empty() {
            info!("[pipeline {run_id}] no games to process");
            self.finish(manager, "Chapters uploaded. No games found to process.");
            return Ok(());
        }

        manager.update(|s| {
            s.total_games = games.len() as u32;
            for (i, game) in games.iter().enumerate() {
                s.games.insert(
                    game.id.clone(),
                    GameState {
                        game_id: game.id.clone(),
                        registry_game_id: game.registry_game_id.clone(),
                        game_number: (i + 1) as u32,
                        status: GameStatus::Pending,
                        angles: BTreeMap::new(),
                        error: None,
                    },
                );
            }
        });
        manager.set_progress(45);

        // ---------------- phase 4: process games ----------------
        manager.set_stage(
            Stage::ProcessingGames,
            format!("Processing {} games", games.len()),
        );

        let Some(encode) = self.deps.encode.clone() else {
            manager.update(|s| {
                for game in s.games.values_mut() {
                    game.status = GameStatus::Skipped;
                    game.error = Some("encode fleet disabled".to_string());
                }
            });
            self.finish(manager, "Encode fleet disabled; games not processed.");
            return Ok(());
        };

        for (index, game) in games.iter().enumerate() {
            self.process_game(manager, &encode, game, &valid).await;
            let progress = 50 + (((index + 1) * 40) / games.len()) as u8;
            manager.set_progress(progress);
        }

        // ---------------- phase 5: await, register, clean up ----------------
        manager.set_stage(Stage::WaitingEncode, "Waiting for encode jobs");
        self.await_and_register(manager, &encode, &games).await;

        manager.set_stage(Stage::Cleanup, "Cleaning up");
        self.cleanup_cameras(manager, &valid).await;

        self.finish(manager, format!("Pipeline complete. {} games processed.", games.len()));
        Ok(())
    }

    /// Transfer one session's chapters; keep-alive runs alongside and is
    /// cancelled (not raced) when the transfers end.
    async fn ingest_session(
        &self,
        manager: &Arc<StateManager>,
        session: &SessionDoc,
    ) -> std::result::Result<IngestReport, String> {
        let peer = self
            .deps
            .cameras
            .peer_address_for(&session.interface_id)
            .await
            .map_err(|e| e.to_string())?;

        let mut listed = self
            .deps
            .cameras
            .list_media(peer)
            .await
            .map_err(|e| e.to_string())?;
        listed.retain(|c| c.is_mp4());
        sort_chapters(&mut listed);

        // The pre/post diff is authoritative when available; here, after a
        // restart, the recorder's chapter count selects the newest N files.
        let expected = session.total_chapters as usize;
        let chapters = if expected > 0 && listed.len() > expected {
            listed.split_off(listed.len() - expected)
        } else {
            listed
        };
        if chapters.is_empty() {
            return Err("no chapters found on camera".to_string());
        }

        let source = self.deps.sources.for_peer(peer);
        let prefix = raw_chapter_prefix(&session.segment_session);

        let token = CancellationToken::new();
        let keep_alive = {
            let cameras = self.deps.cameras.clone();
            let interval = self.config.keep_alive_interval;
            let token = token.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            let _ = cameras.keep_alive_ping(peer).await;
                        }
                    }
                }
            })
        };

        let result = async {
            let mut uploaded = Vec::with_capacity(chapters.len());
            let mut bytes = 0u64;
            for (i, chapter) in chapters.iter().enumerate() {
                let key = chapter_object_key(&session.segment_session, i + 1, &chapter.filename);
                let outcome = self
                    .deps
                    .engine
                    .transfer_chapter(source.as_ref(), chapter, &key, &self.config.transfer_path)
                    .await
                    .map_err(|e| e.to_string())?;
                bytes += outcome.bytes;
                uploaded.push(UploadedChapter {
                    s3_key: key,
                    size_bytes: chapter.size_bytes,
                });
                manager.update(|s| {
                    if let Some(upload) = s.session_uploads.get_mut(&session.id) {
                        upload.chapters_uploaded = (i + 1) as u32;
                        upload.bytes_uploaded = bytes;
                    }
                });
            }
            Ok(IngestReport {
                prefix: prefix.clone(),
                chapters: uploaded,
                bytes,
            })
        }
        .await;

        token.cancel();
        let _ = keep_alive.await;
        result
    }

    async fn process_game(
        &self,
        manager: &Arc<StateManager>,
        encode: &Arc<dyn EncodeFleet>,
        game: &GameDoc,
        sessions: &[SessionDoc],
    ) {
        let set_game = |status: GameStatus, error: Option<String>| {
            manager.update(|s| {
                if let Some(g) = s.games.get_mut(&game.id) {
                    g.status = status;
                    g.error = error.clone();
                }
            });
        };
        set_game(GameStatus::Processing, None);

        let Ok(game_start) = game.created_at_utc() else {
            set_game(
                GameStatus::Skipped,
                Some("game has a malformed start timestamp".to_string()),
            );
            return;
        };
        let game_end = match game.ended_at_utc() {
            Ok(Some(end)) => end,
            _ => {
                set_game(GameStatus::Skipped, Some("game has not ended".to_string()));
                return;
            }
        };

        // Resolve the registry-side id used for deliverable naming. Falling
        // back to the catalog id keeps unsynced games processable.
        let registry_id = match &game.registry_game_id {
            Some(id) => Some(id.clone()),
            None => match &self.deps.registry {
                Some(registry) => registry
                    .get_game_by_catalog_id(&game.id)
                    .await
                    .ok()
                    .flatten()
                    .map(|g| g.id),
                None => None,
            },
        };
        if registry_id.is_none() {
            manager.add_error(format!(
                "game {} not synced to the registry; deliverables will use the catalog id",
                game.id
            ));
        }
        let naming_id = registry_id.clone().unwrap_or_else(|| game.id.clone());
        manager.update(|s| {
            if let Some(g) = s.games.get_mut(&game.id) {
                g.registry_game_id = registry_id.clone();
            }
        });

        let date = game.date().to_string();
        let mut submitted_any = false;
        let mut attempted_any = false;

        for session in sessions {
            let upload = manager
                .snapshot()
                .session_uploads
                .get(&session.id)
                .cloned();
            let Some(upload) = upload else { continue };
            if upload.status != UploadStatus::Completed {
                continue;
            }
            let Some(angle) = session.angle() else { continue };
            if !session_overlaps_game(session, game_start, game_end) {
                continue;
            }

            attempted_any = true;
            let set_angle = |state: AngleState| {
                manager.update(|s| {
                    if let Some(g) = s.games.get_mut(&game.id) {
                        g.angles.insert(state.angle_code.clone(), state.clone());
                    }
                });
            };

            let planned = match self.planning_chapters(&upload).await {
                Ok(chapters) => chapters,
                Err(message) => {
                    set_angle(AngleState {
                        angle_code: angle.to_string(),
                        session_id: session.id.clone(),
                        status: AngleStatus::Failed,
                        s3_key: None,
                        job_id: None,
                        registered: false,
                        error: Some(message),
                    });
                    continue;
                }
            };

            let session_start = match session.started_at_utc() {
                Ok(start) => start,
                Err(err) => {
                    set_angle(AngleState {
                        angle_code: angle.to_string(),
                        session_id: session.id.clone(),
                        status: AngleStatus::Skipped,
                        s3_key: None,
                        job_id: None,
                        registered: false,
                        error: Some(err.to_string()),
                    });
                    continue;
                }
            };

            match plan_clip(game_start, game_end, session_start, &planned) {
                Err(courtside_planner::Error::NoOverlap) => {
                    set_angle(AngleState {
                        angle_code: angle.to_string(),
                        session_id: session.id.clone(),
                        status: AngleStatus::Skipped,
                        s3_key: None,
                        job_id: None,
                        registered: false,
                        error: Some("no chapters overlap the game window".to_string()),
                    });
                }
                Err(err) => {
                    set_angle(AngleState {
                        angle_code: angle.to_string(),
                        session_id: session.id.clone(),
                        status: AngleStatus::Failed,
                        s3_key: None,
                        job_id: None,
                        registered: false,
                        error: Some(err.to_string()),
                    });
                }
                Ok(plan) => {
                    let output_key =
                        deliverable_key(&self.config.location, &date, &naming_id, angle);
                    let request = EncodeRequest {
                        chapter_keys: plan.chapters.iter().map(|c| c.s3_key.clone()).collect(),
                        offset_seconds: plan.relative_offset,
                        duration_seconds: plan.duration,
                        buffer_seconds: self.config.clip_buffer_seconds,
                        output_key: output_key.clone(),
                        game_id: game.id.clone(),
                        angle,
                        total_input_bytes: plan.total_input_bytes,
                    };
                    match encode.submit_extract_encode(&request).await {
                        Ok(job) => {
                            submitted_any = true;
                            manager.update(|s| {
                                s.encode_jobs_submitted += 1;
                                if let Some(g) = s.games.get_mut(&game.id) {
                                    g.angles.insert(
                                        angle.to_string(),
                                        AngleState {
                                            angle_code: angle.to_string(),
                                            session_id: session.id.clone(),
                                            status: AngleStatus::Submitted,
                                            s3_key: Some(output_key.clone()),
                                            job_id: Some(job.job_id.clone()),
                                            registered: false,
                                            error: None,
                                        },
                                    );
                                }
                            });
                        }
                        Err(err) => {
                            set_angle(AngleState {
                                angle_code: angle.to_string(),
                                session_id: session.id.clone(),
                                status: AngleStatus::Failed,
                                s3_key: Some(output_key),
                                job_id: None,
                                registered: false,
                                error: Some(err.to_string()),
                            });
                            manager.add_error(format!(
                                "game {} {angle}: submit failed: {err}",
                                game.id
                            ));
                        }
                    }
                }
            }
        }

        if submitted_any {
            set_game(GameStatus::EncodeSubmitted, None);
        } else if attempted_any {
            set_game(
                GameStatus::Failed,
                Some("no encode job could be submitted".to_string()),
            );
        } else {
            set_game(
                GameStatus::Skipped,
                Some("no recording sessions overlap this game".to_string()),
            );
        }
    }

    /// Chapters available for planning: remembered from this run's ingest,
    /// or listed from the store for sessions ingested earlier.
    async fn planning_chapters(
        &self,
        upload: &SessionUploadState,
    ) -> std::result::Result<Vec<PlannedChapter>, String> {
        let chapters: Vec<PlannedChapter> = if upload.uploaded_chapters.is_empty() {
            let prefix = upload
                .s3_prefix
                .clone()
                .ok_or_else(|| "session has no ingest prefix".to_string())?;
            self.deps
                .engine
                .store()
                .list_prefix(&prefix)
                .await
                .map_err(|e| e.to_string())?
                .into_iter()
                .map(|(s3_key, size_bytes)| PlannedChapter {
                    s3_key,
                    size_bytes,
                    duration_seconds: None,
                })
                .collect()
        } else {
            upload
                .uploaded_chapters
                .iter()
                .map(|c| PlannedChapter {
                    s3_key: c.s3_key.clone(),
                    size_bytes: c.size_bytes,
                    duration_seconds: None,
                })
                .collect()
        };
        if chapters.is_empty() {
            return Err("no ingested chapters found for session".to_string());
        }
        Ok(chapters)
    }

    /// Await every submitted job; register FL/FR deliverables as they
    /// succeed. A FAILED job is never resubmitted here.
    async fn await_and_register(
        &self,
        manager: &Arc<StateManager>,
        encode: &Arc<dyn EncodeFleet>,
        games: &[GameDoc],
    ) {
        for game in games {
            let Some(game_state) = manager.snapshot().games.get(&game.id).cloned() else {
                continue;
            };
            for (angle_code, angle_state) in &game_state.angles {
                let Some(job_id) = &angle_state.job_id else { continue };
                if angle_state.status != AngleStatus::Submitted {
                    continue;
                }
                let outcome = encode
                    .wait(
                        job_id,
                        self.config.encode_wait_timeout,
                        self.config.encode_poll_interval,
                    )
                    .await;
                manager.update(|s| s.encode_jobs_completed += 1);

                let status = match outcome {
                    Ok(status) => status,
                    Err(err) => {
                        self.set_angle_status(
                            manager,
                            &game.id,
                            angle_code,
                            AngleStatus::Failed,
                            Some(err.to_string()),
                        );
                        continue;
                    }
                };

                match status.state {
                    JobState::Succeeded => {
                        self.handle_success(manager, encode, game, &game_state, angle_state)
                            .await;
                    }
                    JobState::Failed => {
                        let reason = status
                            .reason
                            .unwrap_or_else(|| "encode job failed".to_string());
                        // A container that cannot parse its input reports the
                        // classic truncated-recording signature.
                        let corrupted = reason.to_lowercase().contains("moov atom");
                        self.set_angle_status(
                            manager,
                            &game.id,
                            angle_code,
                            if corrupted {
                                AngleStatus::Corrupted
                            } else {
                                AngleStatus::Failed
                            },
                            Some(reason),
                        );
                    }
                    JobState::NotFound => {
                        self.set_angle_status(
                            manager,
                            &game.id,
                            angle_code,
                            AngleStatus::Failed,
                            Some("encode job not found".to_string()),
                        );
                    }
                    JobState::Submitted | JobState::Running => {
                        // wait() only returns terminal states; guard anyway.
                        self.set_angle_status(
                            manager,
                            &game.id,
                            angle_code,
                            AngleStatus::Failed,
                            Some("encode job never reached a terminal state".to_string()),
                        );
                    }
                }
            }

            // Game terminal status: completed when at least one angle made
            // it; corrupted/failed angles make the outcome partial.
            manager.update(|s| {
                if let Some(g) = s.games.get_mut(&game.id) {
                    if g.status != GameStatus::EncodeSubmitted {
                        return;
                    }
                    let any_ok = g
                        .angles
                        .values()
                        .any(|a| a.status == AngleStatus::Completed);
                    if any_ok {
                        g.status = GameStatus::Completed;
                        s.games_completed += 1;
                    } else {
                        g.status = GameStatus::Failed;
                        g.error = Some("no angle produced a deliverable".to_string());
                    }
                }
            });
        }
    }

    async fn handle_success(
        &self,
        manager: &Arc<StateManager>,
        encode: &Arc<dyn EncodeFleet>,
        game: &GameDoc,
        game_state: &GameState,
        angle_state: &AngleState,
    ) {
        let angle_code = &angle_state.angle_code;
        let Some(key) = &angle_state.s3_key else {
            self.set_angle_status(
                manager,
                &game.id,
                angle_code,
                AngleStatus::Failed,
                Some("angle has no deliverable key".to_string()),
            );
            return;
        };

        // Post-condition of SUCCEEDED: the deliverable exists.
        let size = match encode.verify_deliverable(key).await {
            Ok(Some(size)) => size,
            Ok(None) => {
                self.set_angle_status(
                    manager,
                    &game.id,
                    angle_code,
                    AngleStatus::Failed,
                    Some("deliverable missing after successful encode".to_string()),
                );
                return;
            }
            Err(err) => {
                self.set_angle_status(
                    manager,
                    &game.id,
                    angle_code,
                    AngleStatus::Failed,
                    Some(format!("deliverable verification failed: {err}")),
                );
                return;
            }
        };

        self.set_angle_status(manager, &game.id, angle_code, AngleStatus::Completed, None);

        let filename = key.rsplit('/').next().unwrap_or(key).to_string();

        // Record the processed game on the session document.
        let processed = ProcessedGame {
            game_id: game.id.clone(),
            game_number: game_state.game_number,
            extracted_filename: filename.clone(),
            s3_key: key.clone(),
            uploaded_at: format_utc(Utc::now()),
        };
        if let Err(err) = self
            .deps
            .catalog
            .append_processed_game(&angle_state.session_id, &processed)
            .await
        {
            manager.add_error(format!(
                "could not record processed game on session {}: {err}",
                angle_state.session_id
            ));
        }

        // Only the front angles are rendered downstream; never register the
        // near sides, and never register the same angle twice.
        let angle: Angle = match angle_code.parse() {
            Ok(angle) => angle,
            Err(_) => return,
        };
        let Some(side) = angle.registry_side() else {
            return;
        };
        if angle_state.registered {
            return;
        }
        let (Some(registry), Some(registry_game_id)) =
            (&self.deps.registry, &game_state.registry_game_id)
        else {
            return;
        };

        let video = RegisterVideo {
            game_id: registry_game_id.clone(),
            s3_key: key.clone(),
            angle: side,
            filename,
            file_size: size,
        };
        match registry.register_video(&video).await {
            Ok(registered) => {
                info!(
                    "registered {angle_code} deliverable for game {} as {}",
                    game.id, registered.id
                );
                manager.update(|s| {
                    if let Some(g) = s.games.get_mut(&game.id) {
                        if let Some(a) = g.angles.get_mut(angle_code) {
                            a.registered = true;
                        }
                    }
                });
            }
            Err(err) => {
                manager.add_error(format!(
                    "registration failed for game {} {angle_code}: {err}",
                    game.id
                ));
            }
        }
    }

    fn set_angle_status(
        &self,
        manager: &Arc<StateManager>,
        game_id: &str,
        angle_code: &str,
        status: AngleStatus,
        error: Option<String>,
    ) {
        manager.update(|s| {
            if let Some(g) = s.games.get_mut(game_id) {
                if let Some(a) = g.angles.get_mut(angle_code) {
                    a.status = status;
                    if error.is_some() {
                        a.error = error.clone();
                    }
                }
            }
        });
    }

    /// Bulk-delete camera storage, only when every game completed and no
    /// encode work is pending.
    async fn cleanup_cameras(&self, manager: &Arc<StateManager>, sessions: &[SessionDoc]) {
        if !self.config.auto_delete_sd {
            return;
        }
        let snapshot = manager.snapshot();
        let all_games_done = !snapshot.games.is_empty()
            && snapshot
                .games
                .values()
                .all(|g| g.status == GameStatus::Completed);
        let none_pending = snapshot.encode_jobs_completed >= snapshot.encode_jobs_submitted;
        if !(all_games_done && none_pending) {
            info!("skipping camera bulk-delete: run did not fully complete");
            return;
        }

        let mut interfaces: Vec<&str> = sessions.iter().map(|s| s.interface_id.as_str()).collect();
        interfaces.sort_unstable();
        interfaces.dedup();
        for interface in interfaces {
            match self.deps.cameras.peer_address_for(interface).await {
                Ok(peer) => {
                    if let Err(err) = self.deps.cameras.delete_all_media(peer).await {
                        warn!("bulk-delete failed on {interface}: {err}");
                    } else {
                        info!("deleted camera storage on {interface}");
                    }
                }
                Err(err) => warn!("bulk-delete skipped on {interface}: {err}"),
            }
        }
    }

    /// Final status per the aggregate policy: `failed` when games were
    /// submitted and nothing succeeded, `completed_with_errors` on partial
    /// outcomes, `completed` otherwise.
    fn finish(&self, manager: &Arc<StateManager>, message: impl Into<String>) {
        let message = message.into();
        manager.update(|s| {
            let any_angle_ok = s
                .games
                .values()
                .flat_map(|g| g.angles.values())
                .any(|a| a.status == AngleStatus::Completed);
            let any_submission = s.encode_jobs_submitted > 0;
            let blemished = !s.errors.is_empty()
                || s.session_uploads
                    .values()
                    .any(|u| u.status == UploadStatus::Failed)
                || s.games.values().any(|g| {
                    matches!(g.status, GameStatus::Failed | GameStatus::Skipped)
                        || g.angles.values().any(|a| {
                            matches!(
                                a.status,
                                AngleStatus::Failed | AngleStatus::Corrupted | AngleStatus::Skipped
                            )
                        })
                });

            s.status = if any_submission && !any_angle_ok {
                RunStatus::Failed
            } else if blemished {
                RunStatus::CompletedWithErrors
            } else {
                RunStatus::Completed
            };
            s.stage = if s.status == RunStatus::Failed {
                Stage::Failed
            } else {
                Stage::Completed
            };
            s.stage_message = message.clone();
            s.progress = 100;
            s.completed_at = Some(format_utc(Utc::now()));
        });
        let state = manager.snapshot();
        info!(
            "[pipeline {}] finished: {:?} ({} errors)",
            state.pipeline_id,
            state.status,
            state.errors.len()
        );
    }
}

/// `[min(startedAt), max(endedAt)]` across sessions; `None` without both.
fn recording_window(sessions: &[SessionDoc]) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let mut earliest: Option<DateTime<Utc>> = None;
    let mut latest: Option<DateTime<Utc>> = None;
    for session in sessions {
        if let Ok(start) = session.started_at_utc() {
            earliest = Some(earliest.map_or(start, |e| e.min(start)));
        }
        if let Ok(Some(end)) = session.ended_at_utc() {
            latest = Some(latest.map_or(end, |l| l.max(end)));
        }
    }
    match (earliest, latest) {
        (Some(start), Some(end)) => Some((start, end)),
        _ => None,
    }
}

fn session_overlaps_game(
    session: &SessionDoc,
    game_start: DateTime<Utc>,
    game_end: DateTime<Utc>,
) -> bool {
    let Ok(start) = session.started_at_utc() else {
        return false;
    };
    let end = match session.ended_at_utc() {
        Ok(Some(end)) => end,
        _ => game_end,
    };
    start < game_end && end > game_start
}
