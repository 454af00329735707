//! Job descriptor builder.
//!
//! Turns a raw [`TranscodeRequest`] into an immutable [`JobSpec`]. Validation
//! is pure: nothing is fetched, spawned or allocated, so a rejected request
//! never reaches the coordinator.

use std::time::Duration;

use bytes::Bytes;
use reqwest::Url;
use serde::Deserialize;
use tc_core::config::Config;
use tc_core::{
    Error, FormatParams, JobId, JobSpec, OutputTarget, Result, SourceLocator,
    ALLOWED_SAMPLE_RATES, MAX_CHANNELS,
};

/// Download endpoint for shared Drive files.
const DRIVE_DOWNLOAD_URL: &str = "https://drive.google.com/uc";

const DRIVE_ID_MIN: usize = 10;
const DRIVE_ID_MAX: usize = 128;
const OUTPUT_KEY_MAX: usize = 128;

/// Named format shortcuts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatPreset {
    /// Mono 16 kHz PCM WAV.
    Speech,
}

impl FormatPreset {
    pub fn params(self) -> FormatParams {
        match self {
            Self::Speech => FormatParams::speech_audio(),
        }
    }
}

/// Unvalidated transcode request as received from a caller.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TranscodeRequest {
    /// Inline payload. Only set by the upload endpoint.
    #[serde(skip)]
    pub payload: Option<Bytes>,
    pub source_uri: Option<String>,
    /// Google Drive share link.
    pub drive_link: Option<String>,
    /// Bare Google Drive file id.
    pub file_id: Option<String>,
    pub format: Option<FormatParams>,
    pub preset: Option<FormatPreset>,
    pub output: OutputTarget,
    pub deadline_secs: Option<u64>,
    pub job_id: Option<String>,
}

/// Validates requests against the configured limits and whitelist.
#[derive(Debug, Clone)]
pub struct JobDescriptorBuilder {
    config: Config,
}

impl JobDescriptorBuilder {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Validate `req` and produce a [`JobSpec`].
    pub fn build(&self, req: TranscodeRequest) -> Result<JobSpec> {
        let id = match req.job_id.as_deref() {
            Some(raw) => raw
                .parse::<JobId>()
                .map_err(|_| Error::validation(format!("job_id is not a UUID: {raw:?}")))?,
            None => JobId::new(),
        };

        let source = self.source(&req)?;
        let format = self.format(&req)?;
        let output = validate_output(req.output)?;
        let deadline = self.deadline(req.deadline_secs)?;

        Ok(JobSpec::new(source, format)
            .with_id(id)
            .with_output(output)
            .with_deadline(deadline))
    }

    fn source(&self, req: &TranscodeRequest) -> Result<SourceLocator> {
        let given = [
            req.payload.is_some(),
            req.source_uri.is_some(),
            req.drive_link.is_some(),
            req.file_id.is_some(),
        ]
        .iter()
        .filter(|&&set| set)
        .count();
        if given != 1 {
            return Err(Error::validation(
                "exactly one of payload, source_uri, drive_link or file_id is required",
            ));
        }

        if let Some(payload) = &req.payload {
            let limit = self.config.jobs.max_inline_bytes;
            if payload.is_empty() {
                return Err(Error::validation("inline payload is empty"));
            }
            if payload.len() > limit {
                return Err(Error::validation(format!(
                    "inline payload is {} bytes; limit is {limit}",
                    payload.len()
                )));
            }
            return Ok(SourceLocator::Inline(payload.clone()));
        }

        let uri = if let Some(uri) = &req.source_uri {
            uri.clone()
        } else if let Some(link) = &req.drive_link {
            drive_download_url(&drive_id_from_link(link)?)?
        } else if let Some(id) = &req.file_id {
            drive_download_url(validate_drive_id(id)?)?
        } else {
            return Err(Error::validation("source is required"));
        };
        self.remote(&uri).map(SourceLocator::Remote)
    }

    fn remote(&self, raw: &str) -> Result<String> {
        let url = Url::parse(raw).map_err(|e| Error::validation(format!("bad source URI: {e}")))?;
        let scheme = url.scheme();
        if !self
            .config
            .sources
            .allowed_schemes
            .iter()
            .any(|s| s.eq_ignore_ascii_case(scheme))
        {
            return Err(Error::validation(format!(
                "source scheme '{scheme}' is not allowed"
            )));
        }
        if scheme != "file" && url.host_str().map_or(true, str::is_empty) {
            return Err(Error::validation("source URI has no host"));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(Error::validation("source URI must not carry credentials"));
        }
        Ok(url.to_string())
    }

    fn format(&self, req: &TranscodeRequest) -> Result<FormatParams> {
        let format = match (req.format, req.preset) {
            (Some(_), Some(_)) => {
                return Err(Error::validation("give either format or preset, not both"))
            }
            (Some(format), None) => format,
            (None, Some(preset)) => preset.params(),
            (None, None) => return Err(Error::validation("format is required")),
        };

        if !format.container.supports(format.codec) {
            return Err(Error::validation(format!(
                "{} cannot carry {}",
                format.container, format.codec
            )));
        }
        if !self.config.allows_format(&format) {
            return Err(Error::validation(format!("format {format} is not allowed")));
        }
        if let Some(rate) = format.sample_rate {
            if !ALLOWED_SAMPLE_RATES.contains(&rate) {
                return Err(Error::validation(format!(
                    "sample_rate {rate} is not one of {ALLOWED_SAMPLE_RATES:?}"
                )));
            }
        }
        if let Some(channels) = format.channels {
            if channels == 0 || channels > MAX_CHANNELS {
                return Err(Error::validation(format!(
                    "channels must be 1..={MAX_CHANNELS}, got {channels}"
                )));
            }
        }
        Ok(format)
    }

    fn deadline(&self, secs: Option<u64>) -> Result<Duration> {
        let max = self.config.jobs.max_deadline_secs;
        match secs {
            None => Ok(self.config.jobs.default_deadline()),
            Some(0) => Err(Error::validation("deadline_secs must be > 0")),
            Some(s) if s > max => Err(Error::validation(format!(
                "deadline_secs {s} exceeds the maximum of {max}"
            ))),
            Some(s) => Ok(Duration::from_secs(s)),
        }
    }
}

fn validate_output(output: OutputTarget) -> Result<OutputTarget> {
    if let OutputTarget::Stored { key } = &output {
        let well_formed = !key.is_empty()
            && key.len() <= OUTPUT_KEY_MAX
            && !key.starts_with('.')
            && !key.contains("..")
            && key
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
        if !well_formed {
            return Err(Error::validation(format!("invalid output key {key:?}")));
        }
    }
    Ok(output)
}

fn validate_drive_id(id: &str) -> Result<&str> {
    let ok = (DRIVE_ID_MIN..=DRIVE_ID_MAX).contains(&id.len())
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-'));
    if ok {
        Ok(id)
    } else {
        Err(Error::validation(format!("invalid Drive file id {id:?}")))
    }
}

/// Extract the file id from `.../file/d/<id>/...` or `...?id=<id>`.
fn drive_id_from_link(link: &str) -> Result<String> {
    let url = Url::parse(link).map_err(|e| Error::validation(format!("bad drive_link: {e}")))?;
    if url.host_str() != Some("drive.google.com") {
        return Err(Error::validation("drive_link must point at drive.google.com"));
    }

    let from_path = url.path_segments().and_then(|segments| {
        let segments: Vec<&str> = segments.collect();
        segments
            .windows(3)
            .find(|w| w[0] == "file" && w[1] == "d")
            .map(|w| w[2].to_string())
    });
    let id = from_path
        .or_else(|| {
            url.query_pairs()
                .find(|(k, _)| k == "id")
                .map(|(_, v)| v.into_owned())
        })
        .ok_or_else(|| Error::validation("drive_link does not contain a file id"))?;

    validate_drive_id(&id)?;
    Ok(id)
}

fn drive_download_url(id: &str) -> Result<String> {
    let url = Url::parse_with_params(DRIVE_DOWNLOAD_URL, &[("export", "download"), ("id", id)])
        .map_err(|e| Error::Internal(format!("drive URL: {e}")))?;
    Ok(url.to_string())
}
