//! Job definitions as submitted by clients, and jobs as held by the pipeline.

use serde::{Deserialize, Serialize};

use super::state::JobState;
use crate::{Error, Result};

/// Codec identifier that routes a job to the copy stage.
pub const COPY_CODEC: &str = "copy";

/// Codec used when a submission does not name one.
pub const DEFAULT_CODEC: &str = "libx265";

/// Quality factor used when a submission does not carry one.
pub const DEFAULT_CRF: i64 = 18;

fn default_crf() -> i64 {
    DEFAULT_CRF
}

fn default_codec() -> String {
    DEFAULT_CODEC.to_string()
}

/// What a client asks the factory to do with one source file.
///
/// Immutable once submitted, except `video_filters`, which the crop stage
/// rewrites with the detected crop filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Source media path.
    #[serde(default)]
    pub source: String,
    /// Output media path.
    #[serde(default)]
    pub destination: String,
    /// External subtitle files muxed into the output.
    #[serde(default)]
    pub srt_files: Vec<String>,
    /// Encoder quality factor, carried opaquely to the encoder.
    #[serde(default = "default_crf")]
    pub crf: i64,
    /// Detect and apply a crop filter before encoding.
    #[serde(default)]
    pub autocrop: bool,
    /// ffmpeg video filter graph.
    #[serde(default)]
    pub video_filters: String,
    /// ffmpeg audio filter graph.
    #[serde(default)]
    pub audio_filters: String,
    /// Encoder identifier; `copy` remuxes without encoding.
    #[serde(default = "default_codec")]
    pub codec: String,
}

impl JobDefinition {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            srt_files: Vec::new(),
            crf: DEFAULT_CRF,
            autocrop: false,
            video_filters: String::new(),
            audio_filters: String::new(),
            codec: DEFAULT_CODEC.to_string(),
        }
    }

    pub fn with_codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = codec.into();
        self
    }

    pub fn with_autocrop(mut self, autocrop: bool) -> Self {
        self.autocrop = autocrop;
        self
    }

    pub fn with_crf(mut self, crf: i64) -> Self {
        self.crf = crf;
        self
    }

    /// Reject definitions missing required fields and normalize the rest.
    ///
    /// Codecs are compared case-insensitively everywhere, so they are stored
    /// trimmed and lower-cased. Empty subtitle entries are dropped.
    pub fn validated(mut self) -> Result<Self> {
        if self.source.trim().is_empty() {
            return Err(Error::validation("source is required"));
        }
        if self.destination.trim().is_empty() {
            return Err(Error::validation("destination is required"));
        }
        if self.crf < 0 {
            return Err(Error::validation(format!(
                "crf must not be negative, got {}",
                self.crf
            )));
        }

        self.codec = self.codec.trim().to_ascii_lowercase();
        if self.codec.is_empty() {
            self.codec = default_codec();
        }
        self.srt_files.retain(|s| !s.trim().is_empty());
        Ok(self)
    }

    pub fn is_copy(&self) -> bool {
        self.codec.eq_ignore_ascii_case(COPY_CODEC)
    }
}

/// Probe results for a job's source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaMetadata {
    /// Duration as reported by the prober (sexagesimal, e.g. `0:42:10.120000`).
    pub duration: String,
    /// Codec of the first video stream.
    pub codec: String,
    pub width: i64,
    pub height: i64,
}

/// A job known to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub id: i64,
    pub definition: JobDefinition,
    /// The crop stage has already run for this job.
    pub crop_complete: bool,
    /// Cached probe results, empty until probed.
    pub metadata: Option<MediaMetadata>,
    pub state: JobState,
}

impl Job {
    pub fn new(id: i64, definition: JobDefinition, crop_complete: bool) -> Self {
        Self {
            id,
            definition,
            crop_complete,
            metadata: None,
            state: JobState::Submitted,
        }
    }
}
