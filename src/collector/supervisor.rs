//! The log supervisor owns the worker registry and the queue admission
//! flag. Both are only touched from the supervisor's own loop, so start
//! and stop decisions for a container are never raced.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::mpsc;

use super::events::{ContainerEvent, ContainerStatus, QueueState, QueueStateEvent};
use super::record::{LogRecord, StreamOptions};
use super::worker::{ContainerLogWorker, WorkerExitNotice};
use crate::checkpoint::CheckpointStore;
use crate::source::{LogSource, LogSourceError};

const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_TOMBSTONE_TTL: Duration = Duration::from_secs(300);
const DEFAULT_CURSOR_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_SKIP_LABEL: &str = "io.kontena.container.skip_logs";

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub checkpoint_interval: Duration,
    /// Containers carrying this label are never streamed.
    pub skip_label: Option<String>,
    /// Start streaming every running container when admission turns on.
    pub resync_on_queue_start: bool,
    /// How long a `died` event shadows older `started` events.
    pub tombstone_ttl: Duration,
    /// Cursors of containers without a worker are dropped once they are
    /// older than this. `None` keeps them forever.
    pub cursor_ttl: Option<Duration>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            skip_label: Some(DEFAULT_SKIP_LABEL.to_string()),
            resync_on_queue_start: true,
            tombstone_ttl: DEFAULT_TOMBSTONE_TTL,
            cursor_ttl: Some(DEFAULT_CURSOR_TTL),
        }
    }
}

/// Senders feeding a running supervisor.
#[derive(Clone)]
pub struct SupervisorSenders {
    pub container_events: mpsc::Sender<ContainerEvent>,
    pub queue_events: mpsc::Sender<QueueStateEvent>,
    pub shutdown: mpsc::Sender<()>,
}

/// The receiving ends merged by [`LogSupervisor::run`].
pub struct SupervisorInbox {
    container_events: mpsc::Receiver<ContainerEvent>,
    queue_events: mpsc::Receiver<QueueStateEvent>,
    shutdown: mpsc::Receiver<()>,
}

impl SupervisorInbox {
    pub fn new(capacity: usize) -> (SupervisorSenders, Self) {
        let (container_tx, container_rx) = mpsc::channel(capacity);
        let (queue_tx, queue_rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        (
            SupervisorSenders {
                container_events: container_tx,
                queue_events: queue_tx,
                shutdown: shutdown_tx,
            },
            Self {
                container_events: container_rx,
                queue_events: queue_rx,
                shutdown: shutdown_rx,
            },
        )
    }
}

struct WorkerEntry {
    worker: ContainerLogWorker,
    /// Cursor loaded at start or last written, whichever is newer.
    checkpointed: Option<i64>,
}

pub struct LogSupervisor<S, C> {
    source: S,
    checkpoints: C,
    output: mpsc::Sender<LogRecord>,
    config: SupervisorConfig,
    workers: HashMap<String, WorkerEntry>,
    queue_processing: bool,
    /// Event time of the latest `died` per container.
    tombstones: HashMap<String, i64>,
    next_generation: u64,
    exit_tx: mpsc::UnboundedSender<WorkerExitNotice>,
    exit_rx: mpsc::UnboundedReceiver<WorkerExitNotice>,
}

impl<S: LogSource, C: CheckpointStore> LogSupervisor<S, C> {
    pub fn new(
        source: S,
        checkpoints: C,
        output: mpsc::Sender<LogRecord>,
        config: SupervisorConfig,
    ) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Self {
            source,
            checkpoints,
            output,
            config,
            workers: HashMap::new(),
            queue_processing: false,
            tombstones: HashMap::new(),
            next_generation: 0,
            exit_tx,
            exit_rx,
        }
    }

    pub fn is_streaming(&self, container_id: &str) -> bool {
        self.workers
            .get(container_id)
            .is_some_and(|entry| entry.worker.is_alive())
    }

    /// Processes both event feeds until a shutdown is requested.
    pub async fn run(mut self, mut inbox: SupervisorInbox) {
        log::info!("Log supervisor started");
        let mut checkpoint_interval = tokio::time::interval(self.config.checkpoint_interval);
        checkpoint_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Consume the first immediate tick
        checkpoint_interval.tick().await;

        let mut container_feed_open = true;
        let mut queue_feed_open = true;

        loop {
            tokio::select! {
                maybe_event = inbox.container_events.recv(), if container_feed_open => {
                    match maybe_event {
                        Some(event) => self.on_container_event(event).await,
                        None => {
                            log::warn!("Container event feed closed");
                            container_feed_open = false;
                        }
                    }
                }
                maybe_event = inbox.queue_events.recv(), if queue_feed_open => {
                    match maybe_event {
                        Some(event) => self.on_queue_state_event(event).await,
                        None => {
                            log::warn!("Queue state feed closed");
                            queue_feed_open = false;
                        }
                    }
                }
                Some(notice) = self.exit_rx.recv() => self.handle_exit(notice).await,
                _ = checkpoint_interval.tick() => {
                    let now = chrono::Utc::now().timestamp_micros();
                    self.checkpoint_all().await;
                    self.prune_tombstones(now);
                    self.prune_cursors(now).await;
                }
                _ = inbox.shutdown.recv() => break,
            }
        }

        self.shutdown().await;
        log::info!("Log supervisor stopped");
    }

    pub async fn on_container_event(&mut self, event: ContainerEvent) {
        match event.status {
            ContainerStatus::Started => {
                if self.is_shadowed(&event) {
                    log::debug!(
                        "Ignoring start of {} older than its last death",
                        event.container_id
                    );
                    return;
                }
                if !self.queue_processing {
                    log::debug!(
                        "Queue not processing, not streaming {}",
                        event.container_id
                    );
                    return;
                }
                if self.skips(&event.labels) {
                    log::debug!("Container {} opted out of log streaming", event.container_id);
                    return;
                }
                if let Err(e) = self.start_streaming(&event.container_id).await {
                    log::error!(
                        "Failed to start log stream for {}: {e}",
                        event.container_id
                    );
                }
            }
            ContainerStatus::Died => {
                if let Some(time) = event.time {
                    let tombstone = self
                        .tombstones
                        .entry(event.container_id.clone())
                        .or_insert(time);
                    *tombstone = (*tombstone).max(time);
                }
                self.stop_streaming(&event.container_id).await;
            }
            ContainerStatus::Other(_) => {}
        }
    }

    /// Only gates future starts. Workers that are already streaming keep
    /// streaming when the queue stops.
    pub async fn on_queue_state_event(&mut self, event: QueueStateEvent) {
        let was_processing = self.queue_processing;
        self.queue_processing = matches!(event.state, QueueState::Started);

        match (was_processing, self.queue_processing) {
            (false, true) => {
                log::info!("Queue started processing, log streaming allowed");
                if self.config.resync_on_queue_start {
                    self.resync().await;
                }
            }
            (true, false) => log::info!("Queue stopped processing, new log streams deferred"),
            _ => {}
        }
    }

    /// Starts a worker for `container_id` unless one is already live.
    pub async fn start_streaming(&mut self, container_id: &str) -> Result<(), LogSourceError> {
        if self.is_streaming(container_id) {
            return Ok(());
        }
        // A finished worker whose exit notice is still queued
        if let Some(mut stale) = self.workers.remove(container_id) {
            stale.worker.stop().await;
        }

        let cursor = match self.checkpoints.get(container_id).await {
            Ok(cursor) => cursor,
            Err(e) => {
                log::warn!("Failed to read log cursor for {container_id}, streaming from now: {e}");
                None
            }
        };
        let options = StreamOptions::resume_from(cursor);

        self.next_generation += 1;
        let worker = ContainerLogWorker::start(
            &self.source,
            container_id,
            self.next_generation,
            options,
            self.output.clone(),
            self.exit_tx.clone(),
        )
        .await?;

        log::info!(
            "Streaming logs for {container_id} (since {:?}, tail {})",
            worker.options().since,
            worker.options().tail
        );
        self.workers.insert(
            container_id.to_string(),
            WorkerEntry {
                worker,
                checkpointed: cursor,
            },
        );
        Ok(())
    }

    /// Stops and forgets the worker for `container_id`, if any.
    pub async fn stop_streaming(&mut self, container_id: &str) {
        let Some(entry) = self.workers.get_mut(container_id) else {
            return;
        };
        entry.worker.stop().await;
        self.workers.remove(container_id);
        log::info!("Stopped streaming logs for {container_id}");
    }

    /// Writes the newest observed timestamp of every live worker. Returns
    /// how many cursors were written.
    pub async fn checkpoint_all(&mut self) -> usize {
        let mut written = 0;
        for (container_id, entry) in self.workers.iter_mut() {
            if !entry.worker.is_alive() {
                continue;
            }
            let Some(timestamp) = entry.worker.last_seen_timestamp() else {
                continue;
            };
            if entry.checkpointed.is_some_and(|cursor| cursor >= timestamp) {
                continue;
            }
            match self.checkpoints.set(container_id, timestamp).await {
                Ok(()) => {
                    entry.checkpointed = Some(timestamp);
                    written += 1;
                }
                Err(e) => log::error!("Failed to save log cursor for {container_id}: {e}"),
            }
        }
        if written > 0 {
            log::debug!("Saved {written} log cursors");
        }
        written
    }

    async fn handle_exit(&mut self, notice: WorkerExitNotice) {
        let current = self
            .workers
            .get(&notice.container_id)
            .is_some_and(|entry| entry.worker.generation() == notice.generation);
        if !current {
            return;
        }
        if let Some(mut entry) = self.workers.remove(&notice.container_id) {
            entry.worker.stop().await;
            log::debug!(
                "Removed log worker for {} ({:?})",
                notice.container_id,
                notice.reason
            );
        }
    }

    async fn resync(&mut self) {
        let containers = match self.source.running_containers().await {
            Ok(containers) => containers,
            Err(e) => {
                log::error!("Failed to list running containers: {e}");
                return;
            }
        };
        for container in containers {
            if self.skips(&container.labels) || self.is_streaming(&container.id) {
                continue;
            }
            if let Err(e) = self.start_streaming(&container.id).await {
                log::error!("Failed to start log stream for {}: {e}", container.id);
            }
        }
    }

    async fn shutdown(&mut self) {
        self.checkpoint_all().await;
        for (container_id, mut entry) in self.workers.drain() {
            entry.worker.stop().await;
            log::debug!("Stopped streaming logs for {container_id}");
        }
    }

    fn skips(&self, labels: &HashMap<String, String>) -> bool {
        self.config
            .skip_label
            .as_ref()
            .is_some_and(|label| labels.contains_key(label))
    }

    fn is_shadowed(&self, event: &ContainerEvent) -> bool {
        match (event.time, self.tombstones.get(&event.container_id)) {
            (Some(started_at), Some(&died_at)) => started_at <= died_at,
            _ => false,
        }
    }

    fn prune_tombstones(&mut self, now: i64) {
        let cutoff = now.saturating_sub(duration_micros(self.config.tombstone_ttl));
        self.tombstones.retain(|_, died_at| *died_at > cutoff);
    }

    /// Drops stored cursors older than `cursor_ttl`, except those of live
    /// workers.
    async fn prune_cursors(&mut self, now: i64) {
        let Some(ttl) = self.config.cursor_ttl else {
            return;
        };
        let cutoff = now.saturating_sub(duration_micros(ttl));
        let live: HashSet<String> = self.workers.keys().cloned().collect();
        match self.checkpoints.prune(cutoff, &live).await {
            Ok(0) => {}
            Ok(removed) => log::debug!("Pruned {removed} stale log cursors"),
            Err(e) => log::error!("Failed to prune log cursors: {e}"),
        }
    }
}

fn duration_micros(duration: Duration) -> i64 {
    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
}

#[cfg(test)]
impl<S: LogSource, C: CheckpointStore> LogSupervisor<S, C> {
    pub fn queue_processing(&self) -> bool {
        self.queue_processing
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn stream_options(&self, container_id: &str) -> Option<StreamOptions> {
        self.workers
            .get(container_id)
            .map(|entry| entry.worker.options())
    }

    pub fn last_seen(&self, container_id: &str) -> Option<i64> {
        self.workers
            .get(container_id)
            .and_then(|entry| entry.worker.last_seen_timestamp())
    }
}
