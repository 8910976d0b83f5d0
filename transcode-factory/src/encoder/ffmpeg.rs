//! ffmpeg/ffprobe implementation of [`Encoder`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;

use async_trait::async_trait;
use process_utils::{ProcessOutcome, output_or_cancel, tokio_command, wait_or_cancel};
use regex::Regex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::Encoder;
use crate::domain::{COPY_CODEC, JobDefinition, MediaMetadata};
use crate::{Error, Result};

/// Matches one cropdetect report line; group 2 is the filter.
static CROPDETECT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"t:(\d*).*?(crop=[-\d:]*)").unwrap());

const QUIET_ARGS: [&str; 5] = ["-y", "-hide_banner", "-stats", "-loglevel", "error"];
const PROBE_SIZE_ARGS: [&str; 4] = ["-probesize", "6000M", "-analyzeduration", "6000M"];

/// Seconds of the source sampled by cropdetect.
const CROPDETECT_SECONDS: &str = "300";

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    #[serde(default)]
    codec_name: String,
    #[serde(default)]
    width: i64,
    #[serde(default)]
    height: i64,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeFormat {
    #[serde(default)]
    duration: String,
}

/// Encoder backed by the ffmpeg and ffprobe binaries.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegEncoder {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }
}

/// Parse ffprobe's JSON for the first video stream.
fn parse_probe_output(source: &str, stdout: &[u8]) -> Result<MediaMetadata> {
    let probe: FfprobeOutput = serde_json::from_slice(stdout)?;
    let [stream] = probe.streams.as_slice() else {
        return Err(Error::encoder(format!(
            "{source}: got {} video streams in ffprobe output, expected 1",
            probe.streams.len()
        )));
    };
    Ok(MediaMetadata {
        duration: probe.format.duration,
        codec: stream.codec_name.clone(),
        width: stream.width,
        height: stream.height,
    })
}

/// Extract the last crop filter reported by cropdetect.
pub fn parse_crop_filter(stderr: &str) -> Option<String> {
    CROPDETECT_REGEX
        .captures_iter(stderr)
        .last()
        .and_then(|caps| caps.get(2))
        .map(|m| m.as_str().to_string())
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn libx265_args(crf: &str, tune: Option<&str>) -> Vec<String> {
    let mut args = to_args(&[
        "-c:v", "libx265", "-crf", crf, "-preset", "medium", "-profile:v", "main10",
    ]);
    if let Some(tune) = tune {
        args.extend(to_args(&["-tune", tune]));
    }
    args.extend(to_args(&[
        "-x265-params",
        "hdr-opt=1:repeat-headers=1",
        "-pix_fmt",
        "yuv420p10le",
    ]));
    args
}

/// Video codec arguments for `codec` at quality `crf`.
///
/// Unknown codecs fall back to libx265.
pub fn build_codec_args(codec: &str, crf: i64) -> Vec<String> {
    let crf = crf.to_string();
    let crf = crf.as_str();

    match codec.to_ascii_lowercase().as_str() {
        "copy" => to_args(&["-c:v", "copy"]),
        "libsvtav1" => to_args(&[
            "-c:v",
            "libsvtav1",
            "-crf",
            crf,
            "-preset",
            "6",
            "-svtav1-params",
            "tune=0:enable-overlays=1:input-depth=10",
            "-pix_fmt",
            "yuv420p10le",
        ]),
        "hevc_nvenc" => to_args(&[
            "-pix_fmt",
            "p010le",
            "-c:v",
            "hevc_nvenc",
            "-rc",
            "1",
            "-cq",
            crf,
            "-profile:v",
            "1",
            "-tier",
            "1",
            "-spatial_aq",
            "1",
            "-temporal_aq",
            "1",
            "-preset",
            "1",
            "-b_ref_mode",
            "2",
        ]),
        "libx265_animation" => libx265_args(crf, Some("animation")),
        "libx265_grain" => libx265_args(crf, Some("grain")),
        _ => libx265_args(crf, None),
    }
}

/// Full ffmpeg argument list for a job.
pub fn build_transcode_args(job: &JobDefinition) -> Vec<String> {
    let mut args = to_args(&QUIET_ARGS);
    args.extend(to_args(&PROBE_SIZE_ARGS));
    args.extend(["-i".to_string(), job.source.clone()]);

    let mut maps = to_args(&[
        "-map",
        "0:v:0",
        "-map",
        "0:a:m:language:eng:?",
        "-map",
        "0:s:m:language:eng:?",
        "-map",
        "0:t:?",
    ]);

    for (index, srt) in job.srt_files.iter().filter(|s| !s.is_empty()).enumerate() {
        args.extend(["-i".to_string(), srt.clone()]);
        maps.extend([
            "-map".to_string(),
            (index + 1).to_string(),
            "-metadata:s:s".to_string(),
            "language=eng".to_string(),
        ]);
    }

    let copying = job.codec.eq_ignore_ascii_case(COPY_CODEC);
    if !copying && !job.video_filters.is_empty() {
        args.extend(["-vf".to_string(), job.video_filters.clone()]);
    }

    args.extend(build_codec_args(&job.codec, job.crf));

    if !job.audio_filters.is_empty() {
        args.extend(["-af".to_string(), job.audio_filters.clone()]);
    } else {
        args.extend(["-c:a".to_string(), "copy".to_string()]);
    }
    args.extend(to_args(&["-c:s", "copy", "-c:t", "copy"]));
    args.extend(maps);
    args.push(job.destination.clone());
    args
}

fn open_log(path: &Path) -> Result<(Stdio, Stdio)> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::io_path("opening", path, e))?;
    let stderr = file
        .try_clone()
        .map_err(|e| Error::io_path("cloning", path, e))?;
    Ok((Stdio::from(file), Stdio::from(stderr)))
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn probe_metadata(&self, source: &str, token: &CancellationToken) -> Result<MediaMetadata> {
        let mut cmd = tokio_command(&self.ffprobe);
        cmd.args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_format",
            "-show_entries",
            "stream=codec_name,width,height",
            "-print_format",
            "json",
            "-sexagesimal",
            source,
        ]);
        debug!(source, "Calling ffprobe");

        let output = match output_or_cancel(&mut cmd, token)
            .await
            .map_err(|e| Error::encoder(format!("failed to start ffprobe: {e}")))?
        {
            ProcessOutcome::Exited(output) => output,
            ProcessOutcome::Cancelled => return Err(Error::Cancelled),
        };
        if !output.status.success() {
            return Err(Error::encoder(format!(
                "{source}: ffprobe exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_probe_output(source, &output.stdout)
    }

    async fn detect_crop(&self, source: &str, token: &CancellationToken) -> Result<String> {
        let mut cmd = tokio_command(&self.ffmpeg);
        cmd.arg("-hide_banner")
            .args(PROBE_SIZE_ARGS)
            .args(["-i", source, "-vf", "cropdetect=round=2", "-t"])
            .arg(CROPDETECT_SECONDS)
            .args(["-f", "null", "-"]);
        debug!(source, "Running cropdetect");

        let output = match output_or_cancel(&mut cmd, token)
            .await
            .map_err(|e| Error::encoder(format!("failed to exec cropdetect: {e}")))?
        {
            ProcessOutcome::Exited(output) => output,
            ProcessOutcome::Cancelled => return Err(Error::Cancelled),
        };
        if !output.status.success() {
            return Err(Error::encoder(format!(
                "cropdetect exited with {}",
                output.status
            )));
        }

        parse_crop_filter(&String::from_utf8_lossy(&output.stderr))
            .ok_or_else(|| Error::encoder("failed to extract crop string"))
    }

    async fn run_transcode(
        &self,
        job: &JobDefinition,
        log_path: &Path,
        token: &CancellationToken,
    ) -> Result<Vec<String>> {
        let args = build_transcode_args(job);
        let (stdout, stderr) = open_log(log_path)?;

        let mut cmd = tokio_command(&self.ffmpeg);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        info!(destination = %job.destination, "Calling ffmpeg with args: {:?}", args);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::encoder(format!("failed to start ffmpeg: {e}")))?;

        match wait_or_cancel(&mut child, token).await? {
            ProcessOutcome::Cancelled => Err(Error::Cancelled),
            ProcessOutcome::Exited(status) if status.success() => Ok(args),
            ProcessOutcome::Exited(status) => Err(Error::encoder(format!(
                "execution failed: ffmpeg exited with {status}, check log at {}",
                log_path.display()
            ))),
        }
    }
}
