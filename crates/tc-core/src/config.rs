//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries all
//! sub-configs for the server, job scheduling, resource limits, sources,
//! formats, storage and tools. Every section defaults sensibly so a completely
//! empty `{}` file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::media::{Codec, Container, FormatParams, QualityTier};
use crate::Error;

/// Environment variable the hosting platform uses to assign the listen port.
pub const PORT_ENV: &str = "PORT";

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub jobs: JobsConfig,
    pub limits: LimitsConfig,
    pub sources: SourcesConfig,
    /// Container × codec × quality combinations callers may request.
    pub formats: Vec<AllowedFormat>,
    pub storage: StorageConfig,
    pub tools: ToolsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            jobs: JobsConfig::default(),
            limits: LimitsConfig::default(),
            sources: SourcesConfig::default(),
            formats: default_formats(),
            storage: StorageConfig::default(),
            tools: ToolsConfig::default(),
        }
    }
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        let port = std::env::var(PORT_ENV).ok();
        self.apply_port_override(port.as_deref());
    }

    /// Override `server.port` from a raw `PORT` value. Unparsable values are
    /// logged and ignored.
    pub fn apply_port_override(&mut self, value: Option<&str>) {
        let Some(raw) = value else {
            return;
        };
        match raw.trim().parse::<u16>() {
            Ok(port) => self.server.port = port,
            Err(e) => tracing::warn!("Ignoring {PORT_ENV}={raw:?}: {e}"),
        }
    }

    /// Whether `format` appears in the configured whitelist.
    pub fn allows_format(&self, format: &FormatParams) -> bool {
        self.formats.iter().any(|f| {
            f.container == format.container
                && f.codec == format.codec
                && f.qualities.contains(&format.quality)
        })
    }

    /// Reject values the service cannot run with.
    pub fn check(&self) -> Result<()> {
        if self.jobs.max_concurrent_jobs == 0 {
            return Err(Error::validation("jobs.max_concurrent_jobs must be > 0"));
        }
        if self.jobs.default_deadline_secs == 0 {
            return Err(Error::validation("jobs.default_deadline_secs must be > 0"));
        }
        if self.jobs.default_deadline_secs > self.jobs.max_deadline_secs {
            return Err(Error::validation(format!(
                "jobs.default_deadline_secs ({}) exceeds jobs.max_deadline_secs ({})",
                self.jobs.default_deadline_secs, self.jobs.max_deadline_secs
            )));
        }
        if self.jobs.buffer_budget_bytes == 0 {
            return Err(Error::validation("jobs.buffer_budget_bytes must be > 0"));
        }
        if self.jobs.max_inline_bytes == 0 {
            return Err(Error::validation("jobs.max_inline_bytes must be > 0"));
        }
        Ok(())
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0; a random port will be assigned".into());
        }

        if self.jobs.max_queue_length == 0 {
            warnings.push(
                "jobs.max_queue_length is 0; submissions beyond max_concurrent_jobs are rejected"
                    .into(),
            );
        }

        if self.jobs.buffer_budget_bytes < 4096 {
            warnings.push(format!(
                "jobs.buffer_budget_bytes ({}) is very small; relays will make many syscalls",
                self.jobs.buffer_budget_bytes
            ));
        }

        if self.jobs.stderr_excerpt_bytes == 0 {
            warnings.push("jobs.stderr_excerpt_bytes is 0; failures carry no diagnostics".into());
        }

        if self.jobs.retained_jobs == 0 {
            warnings.push("jobs.retained_jobs is 0; finished jobs cannot be looked up".into());
        }

        let known = ["http", "https", "file"];
        for scheme in &self.sources.allowed_schemes {
            if !known.contains(&scheme.as_str()) {
                warnings.push(format!(
                    "sources.allowed_schemes '{}' is not supported (valid: {})",
                    scheme,
                    known.join(", ")
                ));
            }
        }
        if self.sources.allowed_schemes.iter().any(|s| s == "http") {
            warnings.push("sources.allowed_schemes includes plaintext http".into());
        }

        if self.formats.is_empty() {
            warnings.push("formats is empty; every transcode request will be rejected".into());
        }
        for (i, f) in self.formats.iter().enumerate() {
            if !f.container.supports(f.codec) {
                warnings.push(format!(
                    "formats[{i}]: {} cannot carry {}; entry is unusable",
                    f.container, f.codec
                ));
            }
            if f.qualities.is_empty() {
                warnings.push(format!("formats[{i}].qualities is empty"));
            }
        }

        if !cfg!(unix)
            && (self.limits.max_memory_bytes.is_some() || self.limits.max_cpu_secs.is_some())
        {
            warnings.push("limits are only enforced on unix hosts".into());
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

/// Scheduling and per-job budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub max_concurrent_jobs: usize,
    pub max_queue_length: usize,
    pub default_deadline_secs: u64,
    pub max_deadline_secs: u64,
    pub termination_grace_ms: u64,
    pub buffer_budget_bytes: usize,
    pub stderr_excerpt_bytes: usize,
    pub max_inline_bytes: usize,
    /// Terminal job records kept for status lookups.
    pub retained_jobs: usize,
}

impl JobsConfig {
    pub fn default_deadline(&self) -> Duration {
        Duration::from_secs(self.default_deadline_secs)
    }

    pub fn max_deadline(&self) -> Duration {
        Duration::from_secs(self.max_deadline_secs)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            max_queue_length: 8,
            default_deadline_secs: 60,
            max_deadline_secs: 120,
            termination_grace_ms: 5_000,
            buffer_budget_bytes: 64 * 1024,
            stderr_excerpt_bytes: 4096,
            max_inline_bytes: 32 * 1024 * 1024,
            retained_jobs: 256,
        }
    }
}

/// Per-process resource ceilings. `None` leaves the host default in place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_memory_bytes: Option<u64>,
    pub max_cpu_secs: Option<u64>,
}

/// Remote source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub allowed_schemes: Vec<String>,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            allowed_schemes: vec!["https".into()],
        }
    }
}

/// One whitelist entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedFormat {
    pub container: Container,
    pub codec: Codec,
    #[serde(default = "all_qualities")]
    pub qualities: Vec<QualityTier>,
}

impl AllowedFormat {
    pub fn new(container: Container, codec: Codec) -> Self {
        Self {
            container,
            codec,
            qualities: all_qualities(),
        }
    }
}

fn all_qualities() -> Vec<QualityTier> {
    QualityTier::ALL.to_vec()
}

fn default_formats() -> Vec<AllowedFormat> {
    use Codec::*;
    use Container::*;
    [
        (Mp4, H264),
        (Mp4, H265),
        (Mp4, Aac),
        (Webm, Vp9),
        (Webm, Opus),
        (Mkv, H264),
        (Mkv, H265),
        (Mkv, Vp9),
        (Container::Mp3, Codec::Mp3),
        (Wav, PcmS16le),
        (Container::Flac, Codec::Flac),
    ]
    .into_iter()
    .map(|(container, codec)| AllowedFormat::new(container, codec))
    .collect()
}

/// Where spooled and stored output lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for inline-output spool files; the system temp dir if unset.
    pub spool_dir: Option<PathBuf>,
    pub output_dir: PathBuf,
}

impl StorageConfig {
    pub fn spool_dir(&self) -> PathBuf {
        self.spool_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            spool_dir: None,
            output_dir: PathBuf::from("./data/output"),
        }
    }
}

/// Paths to external CLI tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
}
