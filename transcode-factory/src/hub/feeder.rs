//! Feeds the hub: merged refresh signals and periodic log tails.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{HubConfig, HubHandle, HubMessage, tail_log};
use crate::database::JobRepository;

pub(super) async fn run_feeder(
    mut refresh: mpsc::Receiver<()>,
    hub: HubHandle,
    repo: Arc<dyn JobRepository>,
    config: HubConfig,
    cancel: CancellationToken,
) {
    let mut log_tick = tokio::time::interval(config.log_interval);
    log_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            signal = refresh.recv() => {
                if signal.is_none() {
                    break;
                }
                // Let a burst of state changes settle, then send one refresh.
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.coalesce_window) => {}
                }
                while refresh.try_recv().is_ok() {}
                debug!("Broadcasting status refresh");
                hub.broadcast(HubMessage::refresh());
            }

            _ = log_tick.tick() => {
                let log_messages = collect_log_tails(repo.as_ref()).await;
                if !log_messages.is_empty() {
                    hub.broadcast(HubMessage::logs(log_messages));
                }
            }
        }
    }
    debug!("Hub feeder stopped");
}

/// Last log line of every job with a registered encoder log.
async fn collect_log_tails(repo: &dyn JobRepository) -> BTreeMap<i64, String> {
    let files = match repo.active_log_files().await {
        Ok(files) => files,
        Err(e) => {
            warn!("Failed to query encoder log files: {}", e);
            return BTreeMap::new();
        }
    };
    if files.is_empty() {
        return BTreeMap::new();
    }

    let files: Vec<(i64, PathBuf)> = files
        .into_iter()
        .map(|f| (f.id, PathBuf::from(f.path)))
        .collect();

    let tails = tokio::task::spawn_blocking(move || {
        let mut tails = BTreeMap::new();
        for (id, path) in files {
            match tail_log(&path) {
                Ok(line) => {
                    tails.insert(id, line);
                }
                Err(e) => {
                    debug!(job_id = id, path = %path.display(), "Failed to tail log: {}", e);
                }
            }
        }
        tails
    })
    .await;

    tails.unwrap_or_else(|e| {
        warn!("Log tail task failed: {}", e);
        BTreeMap::new()
    })
}
