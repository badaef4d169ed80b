//! Stdout consumer of the output queue.
//!
//! Writes one JSON object per record. It announces itself on the queue
//! state feed so the supervisor only starts streaming once someone is
//! actually draining the queue.

use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc::{Receiver, Sender};

use crate::collector::{LogRecord, QueueStateEvent};

pub async fn run(rx: Receiver<LogRecord>, queue_events: Sender<QueueStateEvent>) {
    ship(BufWriter::new(tokio::io::stdout()), rx, queue_events).await
}

/// Drains `rx` into `out` until every sender is gone. A write failure
/// publishes `Stopped` and closes the queue.
async fn ship<W: AsyncWrite + Unpin>(
    mut out: W,
    mut rx: Receiver<LogRecord>,
    queue_events: Sender<QueueStateEvent>,
) {
    if queue_events.send(QueueStateEvent::started()).await.is_err() {
        log::warn!("Supervisor gone before the shipper started");
        return;
    }
    log::info!("Shipper started");

    while let Some(record) = rx.recv().await {
        if let Err(e) = write_record(&mut out, &record, rx.is_empty()).await {
            log::error!("Failed to ship log record: {e}");
            let _ = queue_events.send(QueueStateEvent::stopped()).await;
            return;
        }
    }

    if let Err(e) = out.flush().await {
        log::error!("Failed to flush shipped records: {e}");
    }
    log::info!("Shipper stopped");
}

async fn write_record<W: AsyncWrite + Unpin>(
    out: &mut W,
    record: &LogRecord,
    flush: bool,
) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    out.write_all(&line).await?;
    if flush {
        out.flush().await?;
    }
    Ok(())
}
