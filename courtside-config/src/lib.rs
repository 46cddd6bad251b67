//! Configuration for the courtside controller.
//!
//! Settings come from a TOML file; the environment variables enumerated in
//! the deployment docs override file values so systemd drop-ins and `.env`
//! files keep working.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use courtside_types::AngleMap;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("TOML deserialization error: {source}")]
    TomlDe {
        #[from]
        source: toml::de::Error,
    },
    #[error("lookup error on variable: {source}")]
    ShellExpandLookupVar {
        #[from]
        source: shellexpand::LookupError<std::env::VarError>,
    },
    #[error("bad value for {name}: {value:?}")]
    BadEnvValue { name: &'static str, value: String },
}

type Result<T> = std::result::Result<T, Error>;

fn default_true() -> bool {
    true
}

fn default_jetson_id() -> String {
    "unknown".to_string()
}

fn default_bucket() -> String {
    "uball-videos-production".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_location() -> String {
    "default-location".to_string()
}

fn default_job_queue() -> String {
    "gpu-transcode-queue".to_string()
}

fn default_job_queue_large() -> String {
    "gpu-transcode-queue-large".to_string()
}

fn default_job_definition() -> String {
    "ffmpeg-nvenc-transcode:17".to_string()
}

fn default_job_definition_extract() -> String {
    "ffmpeg-extract-transcode:3".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("~/courtside_logs")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/tmp/pipeline_states")
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("/tmp/chapters")
}

fn default_recorder_exe() -> String {
    "gopro-video".to_string()
}

/// Object-storage upload settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Court tag used as the first segment of deliverable keys.
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default)]
    pub delete_after_upload: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            enabled: true,
            bucket: default_bucket(),
            region: default_region(),
            location: default_location(),
            delete_after_upload: false,
        }
    }
}

/// Remote GPU encode fleet settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    #[serde(default = "default_job_queue")]
    pub job_queue: String,
    #[serde(default = "default_job_queue_large")]
    pub job_queue_large: String,
    #[serde(default = "default_job_definition")]
    pub job_definition: String,
    #[serde(default = "default_job_definition_extract")]
    pub job_definition_extract: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// When false, no encode jobs are submitted and games stay unprocessed.
    #[serde(default)]
    pub use_gpu_transcode: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            job_queue: default_job_queue(),
            job_queue_large: default_job_queue_large(),
            job_definition: default_job_definition(),
            job_definition_extract: default_job_definition_extract(),
            region: default_region(),
            use_gpu_transcode: false,
        }
    }
}

/// Video-registry credentials. Absent entirely when the deployment has no
/// registry access; registration is then skipped with a log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    pub backend_url: String,
    pub auth_email: String,
    pub auth_password: String,
}

/// Catalog access: path of the credentials file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogConfig {
    pub credentials_path: Option<PathBuf>,
}

/// Chapter-transfer tuning. Defaults follow the camera link behavior observed
/// in the field: small chunks so read-stalls trip the read timeout quickly,
/// many retries because resume makes retries cheap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DownloadTuning {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

fn default_chunk_size() -> usize {
    262_144
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_read_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    20
}

fn default_keep_alive_secs() -> u64 {
    30
}

impl Default for DownloadTuning {
    fn default() -> Self {
        DownloadTuning {
            chunk_size: default_chunk_size(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            max_retries: default_max_retries(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

/// Complete controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CourtsideConfig {
    #[serde(default = "default_jetson_id")]
    pub jetson_id: String,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub registry: Option<RegistryConfig>,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub camera_angle_map: AngleMap,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    #[serde(default)]
    pub download: DownloadTuning,
    /// External recorder tool driven by the recording controller.
    #[serde(default = "default_recorder_exe")]
    pub recorder_exe: String,
}

impl Default for CourtsideConfig {
    fn default() -> Self {
        CourtsideConfig {
            jetson_id: default_jetson_id(),
            upload: UploadConfig::default(),
            batch: BatchConfig::default(),
            registry: None,
            catalog: CatalogConfig::default(),
            camera_angle_map: AngleMap::default(),
            log_dir: default_log_dir(),
            state_dir: default_state_dir(),
            scratch_dir: default_scratch_dir(),
            download: DownloadTuning::default(),
            recorder_exe: default_recorder_exe(),
        }
    }
}

/// Expand `~` and shell variables in a path.
fn fixup_path(path: &mut PathBuf) -> Result<()> {
    if let Some(pathstr) = path.as_os_str().to_str() {
        let expanded = shellexpand::full(pathstr)?;
        *path = PathBuf::from(expanded.to_string());
    }
    Ok(())
}

fn env_var(name: &'static str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_bool(name: &'static str) -> Result<Option<bool>> {
    match env_var(name) {
        None => Ok(None),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" => Ok(Some(false)),
            _ => Err(Error::BadEnvValue { name, value: v }),
        },
    }
}

impl CourtsideConfig {
    /// Apply the enumerated environment overrides on top of file values.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_bool("UPLOAD_ENABLED")? {
            self.upload.enabled = v;
        }
        if let Some(v) = env_var("UPLOAD_BUCKET") {
            self.upload.bucket = v;
        }
        if let Some(v) = env_var("UPLOAD_REGION") {
            self.upload.region = v;
        }
        if let Some(v) = env_var("UPLOAD_LOCATION") {
            self.upload.location = v;
        }
        if let Some(v) = env_bool("DELETE_AFTER_UPLOAD")? {
            self.upload.delete_after_upload = v;
        }
        if let Some(v) = env_var("AWS_BATCH_JOB_QUEUE") {
            self.batch.job_queue = v;
        }
        if let Some(v) = env_var("AWS_BATCH_JOB_QUEUE_LARGE") {
            self.batch.job_queue_large = v;
        }
        if let Some(v) = env_var("AWS_BATCH_JOB_DEFINITION") {
            self.batch.job_definition = v;
        }
        if let Some(v) = env_var("AWS_BATCH_JOB_DEFINITION_EXTRACT") {
            self.batch.job_definition_extract = v;
        }
        if let Some(v) = env_var("AWS_BATCH_REGION") {
            self.batch.region = v;
        }
        if let Some(v) = env_bool("USE_AWS_GPU_TRANSCODE")? {
            self.batch.use_gpu_transcode = v;
        }
        if let Some(v) = env_var("JETSON_ID") {
            self.jetson_id = v;
        }
        if let Some(v) = env_var("CAMERA_ANGLE_MAP") {
            match AngleMap::from_json(&v) {
                Ok(map) => self.camera_angle_map = map,
                Err(_) => {
                    return Err(Error::BadEnvValue {
                        name: "CAMERA_ANGLE_MAP",
                        value: v,
                    })
                }
            }
        }
        if let Some(v) = env_var("CATALOG_CREDENTIALS_PATH") {
            self.catalog.credentials_path = Some(PathBuf::from(v));
        }
        if let Some(url) = env_var("UBALL_BACKEND_URL") {
            let email = env_var("UBALL_AUTH_EMAIL").unwrap_or_else(|| {
                self.registry
                    .as_ref()
                    .map(|r| r.auth_email.clone())
                    .unwrap_or_default()
            });
            let password = env_var("UBALL_AUTH_PASSWORD").unwrap_or_else(|| {
                self.registry
                    .as_ref()
                    .map(|r| r.auth_password.clone())
                    .unwrap_or_default()
            });
            self.registry = Some(RegistryConfig {
                backend_url: url,
                auth_email: email,
                auth_password: password,
            });
        }
        Ok(())
    }

    fn fixup_paths(&mut self) -> Result<()> {
        fixup_path(&mut self.log_dir)?;
        fixup_path(&mut self.state_dir)?;
        fixup_path(&mut self.scratch_dir)?;
        if let Some(p) = self.catalog.credentials_path.as_mut() {
            fixup_path(p)?;
        }
        Ok(())
    }
}

/// Load configuration from a TOML file, apply environment overrides and
/// expand paths.
pub fn parse_config_file(path: &std::path::Path) -> Result<CourtsideConfig> {
    let contents = std::fs::read_to_string(path)?;
    parse_config_str(&contents)
}

/// Like [parse_config_file] but starting from file contents.
pub fn parse_config_str(contents: &str) -> Result<CourtsideConfig> {
    let mut cfg: CourtsideConfig = toml::from_str(contents)?;
    cfg.apply_env()?;
    cfg.fixup_paths()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use courtside_types::Angle;

    #[test]
    fn defaults_match_field_tuning() {
        let cfg = CourtsideConfig::default();
        assert_eq!(cfg.download.chunk_size, 262_144);
        assert_eq!(cfg.download.connect_timeout_secs, 10);
        assert_eq!(cfg.download.read_timeout_secs, 60);
        assert_eq!(cfg.download.max_retries, 20);
        assert_eq!(cfg.download.keep_alive_secs, 30);
        assert!(cfg.upload.enabled);
        assert!(!cfg.upload.delete_after_upload);
    }

    #[test]
    fn parses_minimal_file() {
        let cfg = parse_config_str(
            r#"
            jetson_id = "jetson-1"

            [upload]
            bucket = "test-bucket"
            location = "court-a"

            [camera_angle_map]
            "GoPro FL" = "FL"
            "GoPro NR" = "NR"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.jetson_id, "jetson-1");
        assert_eq!(cfg.upload.bucket, "test-bucket");
        assert_eq!(cfg.upload.region, "us-east-1");
        assert_eq!(cfg.camera_angle_map.resolve("GoPro FL"), Some(Angle::FL));
        assert!(cfg.registry.is_none());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(parse_config_str("no_such_key = 1").is_err());
    }

    #[test]
    fn tilde_paths_are_expanded() {
        let cfg = parse_config_str("log_dir = \"~/courtside_logs\"").unwrap();
        assert!(!cfg.log_dir.to_string_lossy().starts_with('~'));
    }
}
