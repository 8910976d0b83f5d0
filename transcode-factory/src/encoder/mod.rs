//! Encoder adapter: probing, crop detection and transcoding.

mod ffmpeg;

pub use ffmpeg::{FfmpegEncoder, build_codec_args, build_transcode_args, parse_crop_filter};

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::domain::{JobDefinition, MediaMetadata};

/// External encoder used by the pipeline stages.
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Read duration, codec and frame size of the first video stream.
    async fn probe_metadata(&self, source: &str, token: &CancellationToken)
    -> Result<MediaMetadata>;

    /// Detect black borders and return a `crop=W:H:X:Y` filter.
    async fn detect_crop(&self, source: &str, token: &CancellationToken) -> Result<String>;

    /// Run the transcode, writing encoder output to `log_path`.
    ///
    /// Returns the exact argument list on success. Cancellation kills the
    /// encoder and yields [`crate::Error::Cancelled`].
    async fn run_transcode(
        &self,
        job: &JobDefinition,
        log_path: &Path,
        token: &CancellationToken,
    ) -> Result<Vec<String>>;
}
