//! Notification hub.
//!
//! One task owns the subscriber set and changes it only in response to
//! [`HubCommand`]s, so the set needs no lock. A second task, the feeder,
//! turns refresh signals and encoder log tails into broadcasts.
//!
//! Fan-out never blocks: a subscriber whose buffer is full is dropped.

mod feeder;
mod tail;

pub use tail::{TAIL_WINDOW, tail_log};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::database::JobRepository;

/// Default delay used to merge refresh signals.
pub const DEFAULT_COALESCE_WINDOW: Duration = Duration::from_millis(500);

/// Default period of the log tail broadcast.
pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Default outbound buffer of one subscriber.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 32;

/// Message delivered to subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubMessage {
    /// Latest encoder log line per running job.
    pub log_messages: BTreeMap<i64, String>,
    /// Job state changed; status views should reload.
    pub refresh_needed: bool,
}

impl HubMessage {
    pub fn refresh() -> Self {
        Self {
            refresh_needed: true,
            ..Default::default()
        }
    }

    pub fn logs(log_messages: BTreeMap<i64, String>) -> Self {
        Self {
            log_messages,
            refresh_needed: false,
        }
    }

    /// Fold a later message into this one.
    fn merge(&mut self, later: HubMessage) {
        self.refresh_needed |= later.refresh_needed;
        if !later.log_messages.is_empty() {
            self.log_messages = later.log_messages;
        }
    }
}

/// Hub settings.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub coalesce_window: Duration,
    pub log_interval: Duration,
    pub subscriber_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            coalesce_window: DEFAULT_COALESCE_WINDOW,
            log_interval: DEFAULT_LOG_INTERVAL,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

enum HubCommand {
    Register {
        id: u64,
        sender: mpsc::Sender<HubMessage>,
    },
    Unregister(u64),
    Broadcast(HubMessage),
    SubscriberCount(oneshot::Sender<usize>),
}

/// Cloneable handle to a running hub.
#[derive(Clone)]
pub struct HubHandle {
    // Unbounded so producers and `Drop` never wait on the hub.
    commands: mpsc::UnboundedSender<HubCommand>,
    refresh: mpsc::Sender<()>,
    next_id: Arc<AtomicU64>,
    subscriber_buffer: usize,
}

impl HubHandle {
    /// Signal that job state changed. Never blocks.
    ///
    /// The refresh channel holds one pending signal; further signals are
    /// merged into it.
    pub fn request_refresh(&self) {
        let _ = self.refresh.try_send(());
    }

    /// Queue a message for every subscriber.
    pub fn broadcast(&self, message: HubMessage) {
        let _ = self.commands.send(HubCommand::Broadcast(message));
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.subscriber_buffer.max(1));
        let _ = self.commands.send(HubCommand::Register { id, sender });
        Subscription {
            id,
            receiver,
            commands: self.commands.clone(),
        }
    }

    /// Number of registered subscribers, 0 once the hub has stopped.
    pub async fn subscriber_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(HubCommand::SubscriberCount(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Receiving end of one subscriber. Unregisters itself on drop.
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<HubMessage>,
    commands: mpsc::UnboundedSender<HubCommand>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next message, or `None` once the hub dropped this subscriber or stopped.
    pub async fn recv(&mut self) -> Option<HubMessage> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.commands.send(HubCommand::Unregister(self.id));
    }
}

/// Join handles of the hub's tasks.
pub struct HubTasks {
    hub: JoinHandle<()>,
    feeder: JoinHandle<()>,
}

impl HubTasks {
    /// Wait for both tasks to stop after cancellation.
    pub async fn join(self) {
        let _ = self.feeder.await;
        let _ = self.hub.await;
    }
}

/// Start the hub and its feeder.
pub fn start(
    repo: Arc<dyn JobRepository>,
    config: HubConfig,
    cancel: CancellationToken,
) -> (HubHandle, HubTasks) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (refresh_tx, refresh_rx) = mpsc::channel(1);

    let handle = HubHandle {
        commands: commands_tx,
        refresh: refresh_tx,
        next_id: Arc::new(AtomicU64::new(1)),
        subscriber_buffer: config.subscriber_buffer,
    };

    let hub = tokio::spawn(run_hub(commands_rx, cancel.clone()));
    let feeder = tokio::spawn(feeder::run_feeder(
        refresh_rx,
        handle.clone(),
        repo,
        config,
        cancel,
    ));

    (handle, HubTasks { hub, feeder })
}

#[derive(Default)]
struct Subscribers {
    senders: HashMap<u64, mpsc::Sender<HubMessage>>,
}

impl Subscribers {
    fn apply(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register { id, sender } => {
                self.senders.insert(id, sender);
                debug!(subscriber = id, "Registered subscriber");
            }
            HubCommand::Unregister(id) => {
                if self.senders.remove(&id).is_some() {
                    debug!(subscriber = id, "Unregistered subscriber");
                }
            }
            HubCommand::SubscriberCount(reply) => {
                let _ = reply.send(self.senders.len());
            }
            HubCommand::Broadcast(message) => self.fan_out(message),
        }
    }

    fn fan_out(&mut self, message: HubMessage) {
        self.senders.retain(|id, sender| match sender.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(subscriber = id, "Dropping subscriber with a full buffer");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

async fn run_hub(mut commands: mpsc::UnboundedReceiver<HubCommand>, cancel: CancellationToken) {
    let mut subscribers = Subscribers::default();
    let mut deferred = Vec::new();

    loop {
        let command = tokio::select! {
            _ = cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        let HubCommand::Broadcast(mut message) = command else {
            subscribers.apply(command);
            continue;
        };

        // Merge every broadcast already queued into one message. Other
        // commands keep their order relative to the merged broadcast.
        while let Ok(next) = commands.try_recv() {
            match next {
                HubCommand::Broadcast(later) => message.merge(later),
                other => deferred.push(other),
            }
        }
        subscribers.fan_out(message);
        for command in deferred.drain(..) {
            subscribers.apply(command);
        }
    }

    // Dropping the senders ends every subscription.
    info!(
        subscribers = subscribers.senders.len(),
        "Notification hub stopped"
    );
}
