//! Encode job adapter: submits extract-and-transcode work to the remote GPU
//! fleet and polls jobs to a terminal state.
//!
//! The edge device never encodes. Jobs land on one of two queues picked by
//! input volume: workers on the large queue carry enough scratch storage for
//! multi-chapter extractions and oversized single chapters.

use std::time::Duration;

use tracing::{info, warn};

use courtside_types::Angle;

/// Inputs at or above this size go to the large queue.
pub const LARGE_INPUT_THRESHOLD: u64 = 14 * 1024 * 1024 * 1024;

/// Default polling cadence for [EncodeFleet::wait].
pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("encode fleet request failed: {0}")]
    Sdk(String),
    #[error("submit response carried no job id")]
    MissingJobId,
    #[error("job {job_id} did not reach a terminal state within {timeout:?}")]
    WaitTimeout { job_id: String, timeout: Duration },
}

impl Error {
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Sdk(_))
    }
}

/// Spec-level job states; the fleet's richer lifecycle collapses onto these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Submitted,
    Running,
    Succeeded,
    Failed,
    NotFound,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::NotFound)
    }
}

/// Snapshot of one remote job.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub job_id: String,
    pub state: JobState,
    pub reason: Option<String>,
    pub created_at: Option<i64>,
    pub started_at: Option<i64>,
    pub stopped_at: Option<i64>,
    pub exit_code: Option<i32>,
    pub log_stream: Option<String>,
}

/// An extract-and-encode request: cut `[offset, offset+duration)` out of the
/// concatenated chapters and deliver 1080p at `output_key`.
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub chapter_keys: Vec<String>,
    pub offset_seconds: f64,
    pub duration_seconds: f64,
    pub buffer_seconds: f64,
    pub output_key: String,
    pub game_id: String,
    pub angle: Angle,
    pub total_input_bytes: u64,
}

/// A submitted job, as tracked by the orchestrator.
#[derive(Debug, Clone)]
pub struct SubmittedJob {
    pub job_id: String,
    pub job_name: String,
    pub queue: String,
    pub output_key: String,
    pub game_id: String,
    pub angle: Angle,
}

/// Queue/definition configuration for the fleet.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub job_queue: String,
    pub job_queue_large: String,
    pub job_definition: String,
    pub job_definition_extract: String,
    pub bucket: String,
}

impl FleetConfig {
    /// Pick a queue for an extract job: multi-chapter work always runs
    /// large, single-chapter work goes by input size.
    pub fn select_queue(&self, total_input_bytes: u64, chapter_count: usize) -> &str {
        if chapter_count > 1 || total_input_bytes >= LARGE_INPUT_THRESHOLD {
            &self.job_queue_large
        } else {
            &self.job_queue
        }
    }
}

/// Container environment for an extract-and-encode job, as `(name, value)`
/// pairs in submission order.
pub fn extract_job_env(config: &FleetConfig, req: &EncodeRequest) -> Vec<(String, String)> {
    let chapters_json =
        serde_json::to_string(&req.chapter_keys).unwrap_or_else(|_| "[]".to_string());
    vec![
        ("CHAPTERS_JSON".to_string(), chapters_json),
        ("BUCKET".to_string(), config.bucket.clone()),
        ("OFFSET_SECONDS".to_string(), req.offset_seconds.to_string()),
        (
            "DURATION_SECONDS".to_string(),
            req.duration_seconds.to_string(),
        ),
        (
            "ADD_BUFFER_SECONDS".to_string(),
            req.buffer_seconds.to_string(),
        ),
        ("OUTPUT_S3_KEY".to_string(), req.output_key.clone()),
        ("GAME_ID".to_string(), req.game_id.clone()),
        ("ANGLE".to_string(), req.angle.to_string()),
    ]
}

/// Container environment for a plain transcode job (single 4K input already
/// in place, 1080p out).
pub fn transcode_job_env(
    config: &FleetConfig,
    input_key: &str,
    output_key: &str,
    game_id: &str,
    angle: Angle,
) -> Vec<(String, String)> {
    vec![
        (
            "INPUT_S3_URI".to_string(),
            format!("s3://{}/{}", config.bucket, input_key),
        ),
        (
            "OUTPUT_S3_URI".to_string(),
            format!("s3://{}/{}", config.bucket, output_key),
        ),
        ("S3_BUCKET".to_string(), config.bucket.clone()),
        ("INPUT_S3_KEY".to_string(), input_key.to_string()),
        ("OUTPUT_S3_KEY".to_string(), output_key.to_string()),
        ("GAME_ID".to_string(), game_id.to_string()),
        ("ANGLE".to_string(), angle.to_string()),
    ]
}

/// Unique, timestamped job name.
pub fn job_name(prefix: &str, angle: Angle, now: chrono::DateTime<chrono::Utc>) -> String {
    format!("{prefix}-{angle}-{}", now.timestamp())
}

/// The seam the orchestrator drives.
#[async_trait::async_trait]
pub trait EncodeFleet: Send + Sync {
    /// Submit exactly one extract-and-encode job; returns its id.
    async fn submit_extract_encode(&self, req: &EncodeRequest) -> Result<SubmittedJob>;

    async fn status(&self, job_id: &str) -> Result<JobStatus>;

    /// Whether the deliverable exists at `key`; its size when present.
    async fn verify_deliverable(&self, key: &str) -> Result<Option<u64>>;

    /// Delete a raw 4K sibling after a successful encode.
    async fn delete_raw(&self, key: &str) -> Result<()>;

    /// Poll until terminal or timeout. A FAILED job is returned, never
    /// retried; retry policy belongs to the orchestrator.
    async fn wait(&self, job_id: &str, timeout: Duration, interval: Duration) -> Result<JobStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.status(job_id).await {
                Ok(status) => {
                    if status.state.is_terminal() {
                        return Ok(status);
                    }
                }
                Err(err) if err.is_transient() => {
                    warn!("status poll for {job_id} failed, will retry: {err}");
                }
                Err(err) => return Err(err),
            }
            if tokio::time::Instant::now() + interval > deadline {
                return Err(Error::WaitTimeout {
                    job_id: job_id.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(interval).await;
        }
    }
}

// ---------------------------
// AWS Batch implementation

fn map_batch_state(status: Option<&aws_sdk_batch::types::JobStatus>) -> JobState {
    use aws_sdk_batch::types::JobStatus as B;
    match status {
        Some(B::Succeeded) => JobState::Succeeded,
        Some(B::Failed) => JobState::Failed,
        Some(B::Running) => JobState::Running,
        Some(_) => JobState::Submitted,
        None => JobState::Submitted,
    }
}

pub struct BatchEncodeFleet {
    batch: aws_sdk_batch::Client,
    s3: aws_sdk_s3::Client,
    config: FleetConfig,
}

impl BatchEncodeFleet {
    pub fn new(
        batch: aws_sdk_batch::Client,
        s3: aws_sdk_s3::Client,
        config: FleetConfig,
    ) -> Self {
        BatchEncodeFleet { batch, s3, config }
    }

    pub async fn from_env(region: &str, config: FleetConfig) -> Self {
        let sdk = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;
        BatchEncodeFleet {
            batch: aws_sdk_batch::Client::new(&sdk),
            s3: aws_sdk_s3::Client::new(&sdk),
            config,
        }
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Submit a plain transcode job: one 4K object already in place, 1080p
    /// out. Queue by input size.
    pub async fn submit_transcode(
        &self,
        input_key: &str,
        output_key: &str,
        game_id: &str,
        angle: Angle,
        input_size_bytes: u64,
    ) -> Result<SubmittedJob> {
        let queue = self.config.select_queue(input_size_bytes, 1).to_string();
        let name = job_name("transcode", angle, chrono::Utc::now());
        let env = transcode_job_env(&self.config, input_key, output_key, game_id, angle);
        self.submit(
            name,
            queue,
            self.config.job_definition.clone(),
            env,
            game_id,
            angle,
            output_key,
        )
        .await
    }

    async fn submit(
        &self,
        name: String,
        queue: String,
        definition: String,
        env: Vec<(String, String)>,
        game_id: &str,
        angle: Angle,
        output_key: &str,
    ) -> Result<SubmittedJob> {
        use aws_sdk_batch::types::{ContainerOverrides, KeyValuePair};

        let mut overrides = ContainerOverrides::builder();
        for (k, v) in env {
            overrides = overrides.environment(KeyValuePair::builder().name(k).value(v).build());
        }

        let out = self
            .batch
            .submit_job()
            .job_name(&name)
            .job_queue(&queue)
            .job_definition(&definition)
            .container_overrides(overrides.build())
            .tags("game_id", game_id)
            .tags("angle", angle.as_str())
            .tags("service", "courtside")
            .send()
            .await
            .map_err(|e| Error::Sdk(e.to_string()))?;

        let job_id = out.job_id().ok_or(Error::MissingJobId)?.to_string();
        info!("submitted encode job {name} ({job_id}) on {queue}");
        Ok(SubmittedJob {
            job_id,
            job_name: name,
            queue,
            output_key: output_key.to_string(),
            game_id: game_id.to_string(),
            angle,
        })
    }
}

#[async_trait::async_trait]
impl EncodeFleet for BatchEncodeFleet {
    async fn submit_extract_encode(&self, req: &EncodeRequest) -> Result<SubmittedJob> {
        let queue = self
            .config
            .select_queue(req.total_input_bytes, req.chapter_keys.len())
            .to_string();
        let name = job_name("extract-transcode", req.angle, chrono::Utc::now());
        let env = extract_job_env(&self.config, req);
        self.submit(
            name,
            queue,
            self.config.job_definition_extract.clone(),
            env,
            &req.game_id,
            req.angle,
            &req.output_key,
        )
        .await
    }

    async fn status(&self, job_id: &str) -> Result<JobStatus> {
        let out = self
            .batch
            .describe_jobs()
            .jobs(job_id)
            .send()
            .await
            .map_err(|e| Error::Sdk(e.to_string()))?;

        let Some(job) = out.jobs().first() else {
            return Ok(JobStatus {
                job_id: job_id.to_string(),
                state: JobState::NotFound,
                reason: Some("job not found".to_string()),
                created_at: None,
                started_at: None,
                stopped_at: None,
                exit_code: None,
                log_stream: None,
            });
        };

        let container = job.container();
        Ok(JobStatus {
            job_id: job_id.to_string(),
            state: map_batch_state(job.status()),
            reason: job
                .status_reason()
                .map(str::to_string)
                .or_else(|| container.and_then(|c| c.reason()).map(str::to_string)),
            created_at: job.created_at(),
            started_at: job.started_at(),
            stopped_at: job.stopped_at(),
            exit_code: container.and_then(|c| c.exit_code()),
            log_stream: container
                .and_then(|c| c.log_stream_name())
                .map(str::to_string),
        })
    }

    async fn verify_deliverable(&self, key: &str) -> Result<Option<u64>> {
        match self
            .s3
            .head_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(out) => Ok(Some(
                out.content_length().map(|len| len.max(0) as u64).unwrap_or(0),
            )),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_not_found() {
                    Ok(None)
                } else {
                    Err(Error::Sdk(service_err.to_string()))
                }
            }
        }
    }

    async fn delete_raw(&self, key: &str) -> Result<()> {
        self.s3
            .delete_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Error::Sdk(e.to_string()))?;
        info!("deleted raw source {key}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FleetConfig {
        FleetConfig {
            job_queue: "gpu-transcode-queue".to_string(),
            job_queue_large: "gpu-transcode-queue-large".to_string(),
            job_definition: "ffmpeg-nvenc-transcode:17".to_string(),
            job_definition_extract: "ffmpeg-extract-transcode:3".to_string(),
            bucket: "uball-videos-production".to_string(),
        }
    }

    fn request(keys: Vec<&str>, total: u64) -> EncodeRequest {
        EncodeRequest {
            chapter_keys: keys.into_iter().map(str::to_string).collect(),
            offset_seconds: 300.0,
            duration_seconds: 1200.0,
            buffer_seconds: 30.0,
            output_key: "court-a/2026-01-20/g/2026-01-20_g_FL.mp4".to_string(),
            game_id: "game-1".to_string(),
            angle: Angle::FL,
            total_input_bytes: total,
        }
    }

    #[test]
    fn queue_selection_by_size() {
        let cfg = config();
        // 10.2 GB single chapter stays on the small queue
        assert_eq!(
            cfg.select_queue(10_208_434_006, 1),
            "gpu-transcode-queue"
        );
        assert_eq!(
            cfg.select_queue(LARGE_INPUT_THRESHOLD, 1),
            "gpu-transcode-queue-large"
        );
        assert_eq!(
            cfg.select_queue(LARGE_INPUT_THRESHOLD - 1, 1),
            "gpu-transcode-queue"
        );
    }

    #[test]
    fn multi_chapter_extracts_always_go_large() {
        let cfg = config();
        assert_eq!(cfg.select_queue(1024, 2), "gpu-transcode-queue-large");
        assert_eq!(cfg.select_queue(0, 3), "gpu-transcode-queue-large");
    }

    #[test]
    fn extract_env_carries_the_full_request() {
        let cfg = config();
        let req = request(vec!["raw-chapters/s/chapter_001_a.MP4"], 1);
        let env = extract_job_env(&cfg, &req);
        let lookup = |name: &str| {
            env.iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(
            lookup("CHAPTERS_JSON"),
            r#"["raw-chapters/s/chapter_001_a.MP4"]"#
        );
        assert_eq!(lookup("BUCKET"), "uball-videos-production");
        assert_eq!(lookup("OFFSET_SECONDS"), "300");
        assert_eq!(lookup("DURATION_SECONDS"), "1200");
        assert_eq!(lookup("ADD_BUFFER_SECONDS"), "30");
        assert_eq!(lookup("ANGLE"), "FL");
        assert_eq!(lookup("GAME_ID"), "game-1");
    }

    #[test]
    fn transcode_env_uses_uris() {
        let cfg = config();
        let env = transcode_job_env(&cfg, "raw/in.mp4", "out.mp4", "g", Angle::FR);
        assert_eq!(
            env[0],
            (
                "INPUT_S3_URI".to_string(),
                "s3://uball-videos-production/raw/in.mp4".to_string()
            )
        );
        assert_eq!(
            env[1].1,
            "s3://uball-videos-production/out.mp4".to_string()
        );
        assert_eq!(env.last().unwrap().1, "FR");
    }

    #[test]
    fn job_names_are_prefixed_and_timestamped() {
        let now = chrono::DateTime::parse_from_rfc3339("2026-01-20T20:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        assert_eq!(
            job_name("extract-transcode", Angle::NR, now),
            format!("extract-transcode-NR-{}", now.timestamp())
        );
    }

    #[test]
    fn batch_states_collapse_to_spec_states() {
        use aws_sdk_batch::types::JobStatus as B;
        assert_eq!(map_batch_state(Some(&B::Succeeded)), JobState::Succeeded);
        assert_eq!(map_batch_state(Some(&B::Failed)), JobState::Failed);
        assert_eq!(map_batch_state(Some(&B::Running)), JobState::Running);
        assert_eq!(map_batch_state(Some(&B::Pending)), JobState::Submitted);
        assert_eq!(map_batch_state(Some(&B::Runnable)), JobState::Submitted);
        assert_eq!(map_batch_state(Some(&B::Starting)), JobState::Submitted);
        assert_eq!(map_batch_state(None), JobState::Submitted);
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::NotFound.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::Submitted.is_terminal());
    }
}
