use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::record::{LogRecord, RawLogLine, StreamOptions};
use crate::source::{LogLineStream, LogSource, LogSourceError};

const NONE_TIMESTAMP: i64 = i64::MIN;

/// Highest timestamp a worker has pushed onto the output queue.
#[derive(Debug)]
struct LastSeen(AtomicI64);

impl LastSeen {
    fn new() -> Self {
        Self(AtomicI64::new(NONE_TIMESTAMP))
    }

    fn observe(&self, timestamp: i64) {
        self.0.fetch_max(timestamp, Ordering::SeqCst);
    }

    fn get(&self) -> Option<i64> {
        match self.0.load(Ordering::SeqCst) {
            NONE_TIMESTAMP => None,
            timestamp => Some(timestamp),
        }
    }
}

/// Why a worker's relay loop ended.
#[derive(Debug)]
pub enum WorkerExit {
    /// `stop()` was called or the handle was dropped.
    Stopped,
    /// The log source closed the stream, usually because the container is gone.
    StreamEnded,
    SourceFailed(LogSourceError),
    /// The output queue no longer accepts records.
    QueueClosed,
}

/// Sent to the supervisor when a worker terminates on its own.
#[derive(Debug)]
pub struct WorkerExitNotice {
    pub container_id: String,
    pub generation: u64,
    pub reason: WorkerExit,
}

/// Streams one container's logs into the shared output queue.
///
/// The relay runs on its own task. The handle only holds the stop
/// channel, the join handle and the shared progress counter.
pub struct ContainerLogWorker {
    container_id: String,
    generation: u64,
    options: StreamOptions,
    last_seen: Arc<LastSeen>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ContainerLogWorker {
    /// Opens the log stream and spawns the relay task.
    ///
    /// Nothing is spawned if the source refuses to open the stream.
    pub async fn start<S: LogSource + ?Sized>(
        source: &S,
        container_id: &str,
        generation: u64,
        options: StreamOptions,
        output: mpsc::Sender<LogRecord>,
        exits: mpsc::UnboundedSender<WorkerExitNotice>,
    ) -> Result<Self, LogSourceError> {
        let stream = source.open_stream(container_id, &options).await?;

        let last_seen = Arc::new(LastSeen::new());
        let (stop_tx, stop_rx) = oneshot::channel();
        let relay = Relay {
            container_id: container_id.to_string(),
            last_seen: Arc::clone(&last_seen),
            output,
        };

        let task = tokio::spawn(async move {
            let reason = relay.run(stream, stop_rx).await;
            match &reason {
                WorkerExit::Stopped => {
                    log::debug!("Log stream for {} stopped", relay.container_id);
                    return;
                }
                WorkerExit::StreamEnded => {
                    log::info!("Log stream for {} ended", relay.container_id)
                }
                WorkerExit::SourceFailed(e) => {
                    log::warn!("Log stream for {} failed: {e}", relay.container_id)
                }
                WorkerExit::QueueClosed => {
                    log::error!(
                        "Output queue closed, stopping log stream for {}",
                        relay.container_id
                    )
                }
            }
            let _ = exits.send(WorkerExitNotice {
                container_id: relay.container_id,
                generation,
                reason,
            });
        });

        Ok(Self {
            container_id: container_id.to_string(),
            generation,
            options,
            last_seen,
            stop_tx: Some(stop_tx),
            task: Some(task),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn options(&self) -> StreamOptions {
        self.options
    }

    pub fn last_seen_timestamp(&self) -> Option<i64> {
        self.last_seen.get()
    }

    pub fn is_alive(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stops the relay and waits for its task to finish. Once this returns
    /// no further record of this worker reaches the output queue and the
    /// log stream has been dropped.
    pub async fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("Log worker for {} panicked: {e}", self.container_id);
            }
        }
    }
}

struct Relay {
    container_id: String,
    last_seen: Arc<LastSeen>,
    output: mpsc::Sender<LogRecord>,
}

impl Relay {
    async fn run(
        &self,
        mut stream: LogLineStream,
        mut stop_rx: oneshot::Receiver<()>,
    ) -> WorkerExit {
        loop {
            let next = tokio::select! {
                biased;
                _ = &mut stop_rx => return WorkerExit::Stopped,
                next = stream.next() => next,
            };

            let line = match next {
                Some(Ok(line)) => line,
                Some(Err(e)) => return WorkerExit::SourceFailed(e),
                None => return WorkerExit::StreamEnded,
            };

            // The push may wait on a full queue, stop must still win
            tokio::select! {
                biased;
                _ = &mut stop_rx => return WorkerExit::Stopped,
                pushed = self.on_record(line) => {
                    if let Err(reason) = pushed {
                        return reason;
                    }
                }
            }
        }
    }

    async fn on_record(&self, line: RawLogLine) -> Result<(), WorkerExit> {
        let timestamp = line.timestamp;
        self.output
            .send(LogRecord::tagged(&self.container_id, line))
            .await
            .map_err(|_| WorkerExit::QueueClosed)?;
        self.last_seen.observe(timestamp);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::testing::ScriptedSource;
    use std::time::Duration;

    fn channels() -> (
        mpsc::Sender<LogRecord>,
        mpsc::Receiver<LogRecord>,
        mpsc::UnboundedSender<WorkerExitNotice>,
        mpsc::UnboundedReceiver<WorkerExitNotice>,
    ) {
        let (output_tx, output_rx) = mpsc::channel(16);
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        (output_tx, output_rx, exit_tx, exit_rx)
    }

    async fn recv<T>(rx: &mut mpsc::Receiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("Timed out waiting for record")
            .expect("Channel closed")
    }

    #[test]
    fn test_last_seen_keeps_maximum() {
        let last_seen = LastSeen::new();
        assert_eq!(last_seen.get(), None);
        last_seen.observe(110);
        last_seen.observe(105);
        assert_eq!(last_seen.get(), Some(110));
    }

    #[tokio::test]
    async fn test_start_passes_options_verbatim() {
        let source = ScriptedSource::new();
        let (output_tx, _output_rx, exit_tx, _exit_rx) = channels();
        let options = StreamOptions::resume_from(Some(110));

        let mut worker = ContainerLogWorker::start(&source, "c1", 1, options, output_tx, exit_tx)
            .await
            .expect("Failed to start worker");

        assert_eq!(source.opened(), vec![("c1".to_string(), options)]);
        assert!(worker.is_alive());
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_records_are_tagged_and_keep_source_order() {
        let source = ScriptedSource::new();
        let (output_tx, mut output_rx, exit_tx, _exit_rx) = channels();

        let mut worker = ContainerLogWorker::start(
            &source,
            "c1",
            1,
            StreamOptions::resume_from(None),
            output_tx,
            exit_tx,
        )
        .await
        .unwrap();

        for ts in [1, 2, 3] {
            source.push("c1", ts, &format!("line {ts}"));
        }

        let mut timestamps = Vec::new();
        for _ in 0..3 {
            let record = recv(&mut output_rx).await;
            assert_eq!(record.container_id, "c1");
            timestamps.push(record.timestamp);
        }
        assert_eq!(timestamps, vec![1, 2, 3]);

        worker.stop().await;
        assert_eq!(worker.last_seen_timestamp(), Some(3));
    }

    #[tokio::test]
    async fn test_no_timestamp_before_first_record() {
        let source = ScriptedSource::new();
        let (output_tx, _output_rx, exit_tx, _exit_rx) = channels();

        let mut worker = ContainerLogWorker::start(
            &source,
            "c1",
            1,
            StreamOptions::resume_from(None),
            output_tx,
            exit_tx,
        )
        .await
        .unwrap();

        assert_eq!(worker.last_seen_timestamp(), None);
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_final() {
        let source = ScriptedSource::new();
        let (output_tx, mut output_rx, exit_tx, mut exit_rx) = channels();

        let mut worker = ContainerLogWorker::start(
            &source,
            "c1",
            1,
            StreamOptions::resume_from(None),
            output_tx,
            exit_tx,
        )
        .await
        .unwrap();

        worker.stop().await;
        worker.stop().await;
        assert!(!worker.is_alive());

        // The stream was dropped with the task
        assert!(!source.push("c1", 1, "late"));
        assert!(output_rx.try_recv().is_err());
        // Explicit stops are not reported back
        assert!(exit_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_while_blocked_on_full_queue() {
        let source = ScriptedSource::new();
        let (output_tx, mut output_rx) = mpsc::channel(1);
        let (exit_tx, _exit_rx) = mpsc::unbounded_channel();

        let mut worker = ContainerLogWorker::start(
            &source,
            "c1",
            1,
            StreamOptions::resume_from(None),
            output_tx,
            exit_tx,
        )
        .await
        .unwrap();

        source.push("c1", 1, "fills the queue");
        source.push("c1", 2, "blocks");
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(2), worker.stop())
            .await
            .expect("stop() hung on a full queue");
        assert!(!worker.is_alive());

        assert_eq!(output_rx.try_recv().map(|r| r.timestamp).ok(), Some(1));
        assert!(output_rx.try_recv().is_err());
        assert_eq!(worker.last_seen_timestamp(), Some(1));
    }

    #[tokio::test]
    async fn test_stream_end_is_reported() {
        let source = ScriptedSource::new();
        let (output_tx, _output_rx, exit_tx, mut exit_rx) = channels();

        let worker = ContainerLogWorker::start(
            &source,
            "c1",
            7,
            StreamOptions::resume_from(None),
            output_tx,
            exit_tx,
        )
        .await
        .unwrap();

        source.close("c1");

        let notice = tokio::time::timeout(Duration::from_secs(2), exit_rx.recv())
            .await
            .expect("Timed out waiting for exit")
            .expect("Exit channel closed");
        assert_eq!(notice.container_id, "c1");
        assert_eq!(notice.generation, 7);
        assert!(matches!(notice.reason, WorkerExit::StreamEnded));
        assert_eq!(worker.generation(), 7);
    }

    #[tokio::test]
    async fn test_source_error_is_reported() {
        let source = ScriptedSource::new();
        let (output_tx, _output_rx, exit_tx, mut exit_rx) = channels();

        let _worker = ContainerLogWorker::start(
            &source,
            "c1",
            1,
            StreamOptions::resume_from(None),
            output_tx,
            exit_tx,
        )
        .await
        .unwrap();

        source.fail("c1");

        let notice = tokio::time::timeout(Duration::from_secs(2), exit_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(notice.reason, WorkerExit::SourceFailed(_)));
    }

    #[tokio::test]
    async fn test_closed_queue_stops_worker() {
        let source = ScriptedSource::new();
        let (output_tx, output_rx, exit_tx, mut exit_rx) = channels();
        drop(output_rx);

        let worker = ContainerLogWorker::start(
            &source,
            "c1",
            1,
            StreamOptions::resume_from(None),
            output_tx,
            exit_tx,
        )
        .await
        .unwrap();

        source.push("c1", 1, "nobody listening");

        let notice = tokio::time::timeout(Duration::from_secs(2), exit_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(notice.reason, WorkerExit::QueueClosed));
        assert_eq!(worker.last_seen_timestamp(), None);
    }

    #[tokio::test]
    async fn test_unavailable_source_spawns_nothing() {
        let source = ScriptedSource::new();
        source.make_unavailable("c1");
        let (output_tx, _output_rx, exit_tx, _exit_rx) = channels();

        let res = ContainerLogWorker::start(
            &source,
            "c1",
            1,
            StreamOptions::resume_from(None),
            output_tx,
            exit_tx,
        )
        .await;

        assert!(matches!(res, Err(LogSourceError::NotFound(_))));
    }
}
