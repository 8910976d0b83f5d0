//! Shared fixtures: an on-disk database, a scripted encoder and a started hub.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use transcode_factory::database::models::CompletedJobDbModel;
use transcode_factory::database::{self, JobRepository, SqlxJobRepository, WritePool};
use transcode_factory::domain::{JobDefinition, JobState, MediaMetadata, Stage};
use transcode_factory::encoder::Encoder;
use transcode_factory::hub::{self, HubConfig, HubTasks};
use transcode_factory::pipeline::{
    Pipeline, PipelineConfig, PipelineEvent, SchedulerContext, StageLimits,
};
use transcode_factory::{Error, Result};

/// Sources containing this marker fail to probe.
pub const PROBE_FAIL_MARKER: &str = "probe-fail";

/// Crop reported for every source.
pub const DETECTED_CROP: &str = "crop=1920:800:0:140";

/// Concurrent and total calls of one encoder operation.
#[derive(Default)]
pub struct Gauge {
    running: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Calls that have returned.
    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

/// Encoder that never spawns a process.
///
/// Crop detection and encodes sleep for `crop_time` and `encode_time`
/// while their gauges track how many run at once.
pub struct FakeEncoder {
    pub encode_time: Duration,
    pub crop_time: Duration,
    pub encodes: Gauge,
    pub crops: Gauge,
    probes: AtomicUsize,
}

impl FakeEncoder {
    pub fn new(encode_time: Duration) -> Self {
        Self {
            encode_time,
            crop_time: Duration::ZERO,
            encodes: Gauge::default(),
            crops: Gauge::default(),
            probes: AtomicUsize::new(0),
        }
    }

    pub fn with_crop_time(mut self, crop_time: Duration) -> Self {
        self.crop_time = crop_time;
        self
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Encoder for FakeEncoder {
    async fn probe_metadata(
        &self,
        source: &str,
        _token: &CancellationToken,
    ) -> Result<MediaMetadata> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if source.contains(PROBE_FAIL_MARKER) {
            return Err(Error::encoder(format!("ffprobe could not read {source}")));
        }
        Ok(MediaMetadata {
            duration: "0:42:00.000000".to_string(),
            codec: "h264".to_string(),
            width: 1920,
            height: 1080,
        })
    }

    async fn detect_crop(&self, _source: &str, token: &CancellationToken) -> Result<String> {
        self.crops.enter();
        let outcome = tokio::select! {
            _ = token.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(self.crop_time) => Ok(DETECTED_CROP.to_string()),
        };
        self.crops.exit();
        outcome
    }

    async fn run_transcode(
        &self,
        job: &JobDefinition,
        log_path: &Path,
        token: &CancellationToken,
    ) -> Result<Vec<String>> {
        self.encodes.enter();

        if let Err(e) =
            tokio::fs::write(log_path, "frame=  100 fps= 25 q=28.0 size=1024kB\n").await
        {
            self.encodes.exit();
            return Err(Error::Io(e));
        }

        let outcome = tokio::select! {
            _ = token.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(self.encode_time) => {
                let mut args = vec!["-i".to_string(), job.source.clone()];
                if !job.is_copy() && !job.video_filters.is_empty() {
                    args.extend(["-vf".to_string(), job.video_filters.clone()]);
                }
                args.extend(["-c:v".to_string(), job.codec.clone(), job.destination.clone()]);
                Ok(args)
            }
        };

        self.encodes.exit();
        outcome
    }
}

/// A scheduler context over a database in a temp directory.
pub struct Harness {
    pub dir: TempDir,
    pub ctx: Arc<SchedulerContext>,
    pub repo: Arc<dyn JobRepository>,
    pub write_pool: WritePool,
    pub encoder: Arc<FakeEncoder>,
    pub cancel: CancellationToken,
    limits: StageLimits,
    hub_tasks: HubTasks,
}

impl Harness {
    pub async fn new(encoder: FakeEncoder, limits: StageLimits) -> Self {
        Self::open(TempDir::new().unwrap(), encoder, limits).await
    }

    pub async fn with_defaults() -> Self {
        Self::new(FakeEncoder::new(Duration::from_millis(10)), StageLimits::default()).await
    }

    async fn open(dir: TempDir, encoder: FakeEncoder, limits: StageLimits) -> Self {
        let (pool, write_pool) = database::open(&dir.path().join("factory.db")).await.unwrap();
        let repo: Arc<dyn JobRepository> =
            Arc::new(SqlxJobRepository::new(pool, write_pool.clone()));
        let encoder = Arc::new(encoder);
        let cancel = CancellationToken::new();

        let hub_config = HubConfig {
            coalesce_window: Duration::from_millis(10),
            log_interval: Duration::from_millis(50),
            ..Default::default()
        };
        let (hub, hub_tasks) = hub::start(repo.clone(), hub_config, cancel.clone());

        let config = PipelineConfig {
            limits,
            poll_interval: Duration::from_millis(20),
            log_directory: dir.path().join("encoder-logs"),
        };
        let ctx = Arc::new(SchedulerContext::new(
            repo.clone(),
            encoder.clone(),
            hub,
            config,
            cancel.clone(),
        ));

        Self {
            dir,
            ctx,
            repo,
            write_pool,
            encoder,
            cancel,
            limits,
            hub_tasks,
        }
    }

    /// Stop the hub and reopen the same database as a fresh process would.
    ///
    /// The pipeline must already have been stopped.
    pub async fn restart(self, encoder: FakeEncoder) -> Self {
        let Harness {
            dir,
            limits,
            cancel,
            hub_tasks,
            ..
        } = self;
        cancel.cancel();
        hub_tasks.join().await;
        Self::open(dir, encoder, limits).await
    }

    /// A definition writing below the temp directory.
    pub fn definition(&self, name: &str) -> JobDefinition {
        JobDefinition::new(
            format!("/media/in/{name}.mkv"),
            self.dir
                .path()
                .join("out")
                .join(format!("{name}.mkv"))
                .to_string_lossy()
                .into_owned(),
        )
    }

    pub fn events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.ctx.subscribe_events()
    }

    pub async fn start(&self) -> Pipeline {
        Pipeline::start(self.ctx.clone()).await.unwrap()
    }

    /// Poll the audit log until it holds `count` rows.
    pub async fn wait_for_completed(&self, count: usize) -> Vec<CompletedJobDbModel> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            let rows = self.repo.list_completed(1000).await.unwrap();
            if rows.len() >= count {
                return rows;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "only {} of {} jobs completed in time",
                rows.len(),
                count
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll until `condition` holds.
    pub async fn wait_until(&self, what: &str, condition: impl Fn(&FakeEncoder) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        while !condition(&self.encoder) {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn shutdown(self, pipeline: Pipeline) {
        self.cancel.cancel();
        pipeline.join().await;
        self.hub_tasks.join().await;
    }
}

/// States `job_id` went through, in order, until it reached a terminal state.
pub async fn states_of(
    events: &mut broadcast::Receiver<PipelineEvent>,
    job_id: i64,
) -> Vec<PipelineEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), events.recv())
            .await
            .expect("timed out waiting for pipeline events")
            .expect("pipeline event channel closed");
        if event.job_id != job_id {
            continue;
        }
        let terminal = event.state.is_terminal();
        seen.push(event);
        if terminal {
            return seen;
        }
    }
}

/// States recorded for `stage`, in order.
pub fn states_in(seen: &[PipelineEvent], stage: Stage) -> Vec<JobState> {
    seen.iter()
        .filter(|event| event.stage == stage)
        .map(|event| event.state)
        .collect()
}
