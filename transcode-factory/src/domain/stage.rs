//! Routing of queued jobs to pipeline stages.

use serde::Serialize;

use super::job::COPY_CODEC;
use super::state::needs_crop;

/// A pipeline stage, each served by its own dispatcher.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    strum::Display,
    strum::AsRefStr,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Crop detection for autocrop jobs.
    Crop,
    /// Encoding with a real codec.
    Transcode,
    /// Remux without encoding.
    Copy,
}

impl Stage {
    /// The single stage a queued job with these flags belongs to.
    pub fn route(autocrop: bool, crop_complete: bool, codec: &str) -> Stage {
        if codec.eq_ignore_ascii_case(COPY_CODEC) {
            Stage::Copy
        } else if needs_crop(autocrop, crop_complete, codec) {
            Stage::Crop
        } else {
            Stage::Transcode
        }
    }

    /// Whether this stage's dispatcher may pick up such a job.
    pub fn accepts(&self, autocrop: bool, crop_complete: bool, codec: &str) -> bool {
        Self::route(autocrop, crop_complete, codec) == *self
    }

    /// SQL predicate over `transcode_queue` equivalent to [`Stage::accepts`].
    ///
    /// Codecs are stored lower-cased; `LOWER()` keeps rows written by older
    /// versions routable.
    pub fn eligibility_predicate(&self) -> &'static str {
        match self {
            Stage::Crop => "autocrop = 1 AND crop_complete = 0 AND LOWER(codec) != 'copy'",
            Stage::Transcode => {
                "LOWER(codec) != 'copy' AND (autocrop = 0 OR crop_complete = 1)"
            }
            Stage::Copy => "LOWER(codec) = 'copy'",
        }
    }
}
