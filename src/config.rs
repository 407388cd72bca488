use crate::storage::StorageBackend;
use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Process configuration, loadable from CLI args, a TOML file, and the
/// environment.
///
/// Example configuration file content
/// # Livecast Configuration
///
/// # Process role: gateway, worker, or all (combined process)
/// role = "all"
/// listen_on_port = 8080
///
/// # Coordination broker: "memory" or a redis:// URL
/// broker_url = "redis://127.0.0.1:6379"
///
/// # Storage configuration
/// storage_backend = "s3"   # Options: "local", "s3" or "gcs"
/// bucket = "my-media-bucket"
/// s3_endpoint = "http://localhost:9000"  # Optional: for MinIO or custom S3
/// s3_region = "us-east-1"                # Optional
/// s3_access_key_id = "minioadmin"
/// s3_secret_access_key = "minioadmin"
///
/// # Transcoding
/// temp_root = "/tmp/livecast"
/// segment_seconds = 4
/// muxer_bin = "ffmpeg"
///
/// # Recording record API (optional)
/// recording_api_url = "https://app.example.com/api"
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[command(version, about, long_about = None)]
#[serde(default)]
pub struct Config {
    /// Which process to run: gateway, worker, or all
    #[arg(short, long, default_value = "all")]
    #[serde(default = "default_role")]
    pub role: String,

    /// Port the gateway listens on
    #[arg(short, long, default_value_t = 8080)]
    #[serde(default = "default_port")]
    pub listen_on_port: u16,

    /// Coordination broker: "memory" or a redis:// URL
    #[arg(short, long, env = "BROKER_URL", default_value = "memory")]
    #[serde(default = "default_broker_url")]
    pub broker_url: String,

    /// Storage backend: local, s3 or gcs
    #[arg(short, long, default_value = "local")]
    #[serde(default = "default_storage_backend")]
    pub storage_backend: String,

    /// Bucket name (required for s3/gcs; doubles as the advertised bucket)
    #[arg(long, env = "STORAGE_BUCKET")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,

    /// Root directory for the local storage backend
    #[arg(short, long, default_value = "./livecast-data")]
    #[serde(default = "default_workspace")]
    pub workspace: String,

    /// S3 endpoint (for MinIO/custom S3)
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_endpoint: Option<String>,

    /// S3 region
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_region: Option<String>,

    /// S3 access key ID
    #[arg(long, env = "S3_ACCESS_KEY_ID")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_access_key_id: Option<String>,

    /// S3 secret access key
    #[arg(long, env = "S3_SECRET_ACCESS_KEY")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_secret_access_key: Option<String>,

    /// GCS service-account credential (base64 JSON)
    #[arg(long, env = "GCS_CREDENTIAL")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gcs_credential: Option<String>,

    /// Root under which each stream gets its muxer scratch directory
    #[arg(long, env = "TEMP_ROOT", default_value = "/tmp/livecast")]
    #[serde(default = "default_temp_root")]
    pub temp_root: String,

    /// Target HLS segment duration in seconds
    #[arg(long, env = "SEGMENT_DURATION_SECS", default_value_t = 4)]
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u32,

    /// Muxer binary, resolved on PATH
    #[arg(long, env = "MUXER_BIN", default_value = "ffmpeg")]
    #[serde(default = "default_muxer_bin")]
    pub muxer_bin: String,

    /// Worker liveness refresh cadence
    #[arg(long, env = "HEARTBEAT_INTERVAL_MS", default_value_t = 5000)]
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Worker liveness key TTL; must be at least twice the interval
    #[arg(long, env = "HEARTBEAT_TTL_MS", default_value_t = 10_000)]
    #[serde(default = "default_heartbeat_ttl_ms")]
    pub heartbeat_ttl_ms: u64,

    /// Stable worker identity; a UUID is generated when absent
    #[arg(long, env = "WORKER_ID")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,

    /// Muxer output directory poll cadence
    #[arg(long, default_value_t = 1000)]
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long a segment file must sit unmodified before upload
    #[arg(long, default_value_t = 500)]
    #[serde(default = "default_quiescence_ms")]
    pub quiescence_ms: u64,

    /// Blocking budget for chunk-log tail reads
    #[arg(long, default_value_t = 500)]
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Idle read cycles tolerated after Ending before the consumer drains
    #[arg(long, default_value_t = 1)]
    #[serde(default = "default_drain_grace_cycles")]
    pub drain_grace_cycles: u32,

    /// Base URL of the recording record API; updates are dropped if unset
    #[arg(long, env = "RECORDING_API_URL")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_api_url: Option<String>,

    /// Configuration file path (CLI args take precedence over its values)
    #[arg(short, long)]
    #[serde(skip)]
    pub config: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: default_role(),
            listen_on_port: default_port(),
            broker_url: default_broker_url(),
            storage_backend: default_storage_backend(),
            bucket: None,
            workspace: default_workspace(),
            s3_endpoint: None,
            s3_region: None,
            s3_access_key_id: None,
            s3_secret_access_key: None,
            gcs_credential: None,
            temp_root: default_temp_root(),
            segment_seconds: default_segment_seconds(),
            muxer_bin: default_muxer_bin(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_ttl_ms: default_heartbeat_ttl_ms(),
            worker_id: None,
            poll_interval_ms: default_poll_interval_ms(),
            quiescence_ms: default_quiescence_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            drain_grace_cycles: default_drain_grace_cycles(),
            recording_api_url: None,
            config: None,
        }
    }
}

impl Config {
    /// Load configuration from CLI args, optionally merging with a config file
    pub fn load() -> Result<Self> {
        let mut config = Config::parse();

        if let Some(config_path) = &config.config {
            let file_config = Self::from_file(Path::new(config_path))?;
            config = config.merge_with_file(file_config);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merge with file config; CLI args take precedence when non-default.
    fn merge_with_file(mut self, file_config: Config) -> Self {
        if self.role == default_role() {
            self.role = file_config.role;
        }
        if self.listen_on_port == default_port() {
            self.listen_on_port = file_config.listen_on_port;
        }
        if self.broker_url == default_broker_url() {
            self.broker_url = file_config.broker_url;
        }
        if self.storage_backend == default_storage_backend() {
            self.storage_backend = file_config.storage_backend;
        }
        if self.workspace == default_workspace() {
            self.workspace = file_config.workspace;
        }
        if self.temp_root == default_temp_root() {
            self.temp_root = file_config.temp_root;
        }
        if self.segment_seconds == default_segment_seconds() {
            self.segment_seconds = file_config.segment_seconds;
        }
        if self.muxer_bin == default_muxer_bin() {
            self.muxer_bin = file_config.muxer_bin;
        }
        if self.heartbeat_interval_ms == default_heartbeat_interval_ms() {
            self.heartbeat_interval_ms = file_config.heartbeat_interval_ms;
        }
        if self.heartbeat_ttl_ms == default_heartbeat_ttl_ms() {
            self.heartbeat_ttl_ms = file_config.heartbeat_ttl_ms;
        }
        if self.poll_interval_ms == default_poll_interval_ms() {
            self.poll_interval_ms = file_config.poll_interval_ms;
        }
        if self.quiescence_ms == default_quiescence_ms() {
            self.quiescence_ms = file_config.quiescence_ms;
        }
        if self.read_timeout_ms == default_read_timeout_ms() {
            self.read_timeout_ms = file_config.read_timeout_ms;
        }
        if self.drain_grace_cycles == default_drain_grace_cycles() {
            self.drain_grace_cycles = file_config.drain_grace_cycles;
        }

        // For Option fields, CLI/env takes precedence if Some
        if self.bucket.is_none() {
            self.bucket = file_config.bucket;
        }
        if self.s3_endpoint.is_none() {
            self.s3_endpoint = file_config.s3_endpoint;
        }
        if self.s3_region.is_none() {
            self.s3_region = file_config.s3_region;
        }
        if self.s3_access_key_id.is_none() {
            self.s3_access_key_id = file_config.s3_access_key_id;
        }
        if self.s3_secret_access_key.is_none() {
            self.s3_secret_access_key = file_config.s3_secret_access_key;
        }
        if self.gcs_credential.is_none() {
            self.gcs_credential = file_config.gcs_credential;
        }
        if self.worker_id.is_none() {
            self.worker_id = file_config.worker_id;
        }
        if self.recording_api_url.is_none() {
            self.recording_api_url = file_config.recording_api_url;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.role.as_str() {
            "gateway" | "worker" | "all" => {}
            role => {
                return Err(anyhow::anyhow!(
                    "Unsupported role: {role}. Use 'gateway', 'worker' or 'all'"
                ));
            }
        }

        match self.storage_backend.as_str() {
            "local" => {}
            "s3" => {
                if self.bucket.as_ref().map(|s| s.is_empty()).unwrap_or(true) {
                    return Err(anyhow::anyhow!(
                        "Bucket name is required when backend is 's3'"
                    ));
                }
                if self
                    .s3_access_key_id
                    .as_ref()
                    .map(|s| s.is_empty())
                    .unwrap_or(true)
                {
                    return Err(anyhow::anyhow!(
                        "S3 access key ID is required when backend is 's3'"
                    ));
                }
                if self
                    .s3_secret_access_key
                    .as_ref()
                    .map(|s| s.is_empty())
                    .unwrap_or(true)
                {
                    return Err(anyhow::anyhow!(
                        "S3 secret access key is required when backend is 's3'"
                    ));
                }
            }
            "gcs" => {
                if self.bucket.as_ref().map(|s| s.is_empty()).unwrap_or(true) {
                    return Err(anyhow::anyhow!(
                        "Bucket name is required when backend is 'gcs'"
                    ));
                }
            }
            backend => {
                return Err(anyhow::anyhow!(
                    "Unsupported storage backend: {backend}. Use 'local', 's3' or 'gcs'"
                ));
            }
        }

        if self.broker_url != "memory" && !self.broker_url.starts_with("redis://") {
            return Err(anyhow::anyhow!(
                "Broker URL must be 'memory' or a redis:// URL"
            ));
        }

        if self.heartbeat_ttl_ms < self.heartbeat_interval_ms * 2 {
            return Err(anyhow::anyhow!(
                "Heartbeat TTL ({}ms) must be at least twice the interval ({}ms)",
                self.heartbeat_ttl_ms,
                self.heartbeat_interval_ms
            ));
        }

        if self.segment_seconds == 0 {
            return Err(anyhow::anyhow!("Segment duration must be at least 1 second"));
        }

        Ok(())
    }

    pub fn to_storage_backend(&self) -> Result<StorageBackend> {
        match self.storage_backend.as_str() {
            "local" => Ok(StorageBackend::Local {
                root: PathBuf::from(&self.workspace),
            }),
            "s3" => Ok(StorageBackend::S3 {
                bucket: self
                    .bucket
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("missing bucket"))?,
                region: self.s3_region.clone(),
                endpoint: self.s3_endpoint.clone(),
                access_key_id: self
                    .s3_access_key_id
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("missing S3 access key"))?,
                secret_access_key: self
                    .s3_secret_access_key
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("missing S3 secret key"))?,
            }),
            "gcs" => Ok(StorageBackend::Gcs {
                bucket: self
                    .bucket
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("missing bucket"))?,
                credential: self.gcs_credential.clone(),
            }),
            backend => Err(anyhow::anyhow!("unsupported storage backend {backend}")),
        }
    }

    /// Advertised bucket name, also written to recording records.
    pub fn bucket_name(&self) -> String {
        self.bucket
            .clone()
            .unwrap_or_else(|| self.workspace.clone())
    }

    pub fn worker_id(&self) -> String {
        self.worker_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ttl_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn quiescence(&self) -> Duration {
        Duration::from_millis(self.quiescence_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

// Default value functions
fn default_role() -> String {
    "all".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_broker_url() -> String {
    "memory".to_string()
}

fn default_storage_backend() -> String {
    "local".to_string()
}

fn default_workspace() -> String {
    "./livecast-data".to_string()
}

fn default_temp_root() -> String {
    "/tmp/livecast".to_string()
}

fn default_segment_seconds() -> u32 {
    4
}

fn default_muxer_bin() -> String {
    "ffmpeg".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    5000
}

fn default_heartbeat_ttl_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_quiescence_ms() -> u64 {
    500
}

fn default_read_timeout_ms() -> u64 {
    500
}

fn default_drain_grace_cycles() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn s3_backend_requires_credentials() {
        let config = Config {
            storage_backend: "s3".into(),
            bucket: Some("media".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            s3_access_key_id: Some("ak".into()),
            s3_secret_access_key: Some("sk".into()),
            ..config
        };
        config.validate().unwrap();
        assert!(matches!(
            config.to_storage_backend().unwrap(),
            StorageBackend::S3 { .. }
        ));
    }

    #[test]
    fn heartbeat_ttl_must_cover_two_intervals() {
        let config = Config {
            heartbeat_interval_ms: 6000,
            heartbeat_ttl_ms: 10_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn bogus_role_is_rejected() {
        let config = Config {
            role: "observer".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_values_survive_the_merge_when_cli_is_default() {
        let file_config = Config {
            role: "worker".into(),
            poll_interval_ms: 250,
            quiescence_ms: 200,
            read_timeout_ms: 100,
            drain_grace_cycles: 3,
            muxer_bin: "ffmpeg-7".into(),
            bucket: Some("media".into()),
            ..Default::default()
        };

        let merged = Config::default().merge_with_file(file_config);
        assert_eq!(merged.role, "worker");
        assert_eq!(merged.poll_interval_ms, 250);
        assert_eq!(merged.quiescence_ms, 200);
        assert_eq!(merged.read_timeout_ms, 100);
        assert_eq!(merged.drain_grace_cycles, 3);
        assert_eq!(merged.muxer_bin, "ffmpeg-7");
        assert_eq!(merged.bucket.as_deref(), Some("media"));
    }

    #[test]
    fn non_default_values_take_precedence_over_the_file() {
        let file_config = Config {
            quiescence_ms: 200,
            ..Default::default()
        };
        let cli_config = Config {
            quiescence_ms: 50,
            ..Default::default()
        };
        let merged = cli_config.merge_with_file(file_config);
        assert_eq!(merged.quiescence_ms, 50);
    }
}
