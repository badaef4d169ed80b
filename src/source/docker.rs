//! Docker log source using bollard.
//!
//! Logs are requested with `timestamps=true` so every frame starts with
//! an RFC 3339 timestamp that becomes the record's cursor value.

use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::models::EventMessageTypeEnum;
use bollard::query_parameters::{
    EventsOptions, EventsOptionsBuilder, InspectContainerOptions, InspectContainerOptionsBuilder,
    ListContainersOptions, ListContainersOptionsBuilder, LogsOptions, LogsOptionsBuilder,
};
use chrono::DateTime;
use futures_util::StreamExt;
use tokio::sync::mpsc::Sender;

use super::{ContainerInfo, LogLineStream, LogSource, LogSourceError};
use crate::collector::events::{ContainerEvent, ContainerStatus};
use crate::collector::record::{LogStream, RawLogLine, StreamOptions};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Connects to Docker using the default connection method
/// (Unix socket on Linux/macOS, named pipe on Windows).
pub fn connect() -> Result<Docker, LogSourceError> {
    Ok(Docker::connect_with_local_defaults()?)
}

#[derive(Clone)]
pub struct DockerLogSource {
    docker: Docker,
}

impl DockerLogSource {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    async fn ensure_running(&self, container_id: &str) -> Result<(), LogSourceError> {
        let options: InspectContainerOptions = InspectContainerOptionsBuilder::new().build();

        match self
            .docker
            .inspect_container(container_id, Some(options))
            .await
        {
            Ok(info) => {
                let running = info
                    .state
                    .and_then(|state| state.running)
                    .unwrap_or(false);
                if running {
                    Ok(())
                } else {
                    Err(LogSourceError::NotRunning(container_id.to_string()))
                }
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(LogSourceError::NotFound(container_id.to_string())),
            Err(e) => Err(LogSourceError::DockerApi(e)),
        }
    }
}

#[async_trait]
impl LogSource for DockerLogSource {
    async fn open_stream(
        &self,
        container_id: &str,
        options: &StreamOptions,
    ) -> Result<LogLineStream, LogSourceError> {
        self.ensure_running(container_id).await?;

        let mut builder = LogsOptionsBuilder::new()
            .follow(true)
            .stdout(true)
            .stderr(true)
            .timestamps(true)
            .tail(&options.tail.to_string());
        if let Some(since) = options.since {
            builder = builder.since(since_seconds(since));
        }
        let logs_options: LogsOptions = builder.build();

        log::debug!(
            "Opening log stream for {container_id} (since {:?}, tail {})",
            options.since,
            options.tail
        );

        let stream = self
            .docker
            .logs(container_id, Some(logs_options))
            .filter_map(|frame| async move {
                match frame {
                    Ok(output) => match parse_output(output) {
                        Ok(line) => line.map(Ok),
                        Err(e) => {
                            log::warn!("Skipping log frame: {e}");
                            None
                        }
                    },
                    Err(e) => Some(Err(LogSourceError::DockerApi(e))),
                }
            })
            .boxed();

        Ok(stream)
    }

    async fn running_containers(&self) -> Result<Vec<ContainerInfo>, LogSourceError> {
        let options: ListContainersOptions = ListContainersOptionsBuilder::new().build();

        let containers = self.docker.list_containers(Some(options)).await?;

        Ok(containers
            .into_iter()
            .filter_map(|summary| {
                Some(ContainerInfo {
                    id: summary.id?,
                    labels: summary.labels.unwrap_or_default(),
                })
            })
            .collect())
    }
}

/// Docker only accepts whole seconds for `since`. Flooring means a resumed
/// stream may repeat lines from the cursor's second but never skips any.
fn since_seconds(since_micros: i64) -> i32 {
    since_micros
        .div_euclid(1_000_000)
        .clamp(0, i32::MAX as i64) as i32
}

/// Docker's `since` for events takes `<seconds>.<nanoseconds>`.
fn events_since(time_nano: i64) -> String {
    format!(
        "{}.{:09}",
        time_nano.div_euclid(1_000_000_000),
        time_nano.rem_euclid(1_000_000_000)
    )
}

fn parse_output(output: LogOutput) -> Result<Option<RawLogLine>, LogSourceError> {
    let (stream, message) = match output {
        LogOutput::StdOut { message } => (LogStream::Stdout, message),
        LogOutput::StdErr { message } => (LogStream::Stderr, message),
        // Only attached containers produce these
        LogOutput::StdIn { .. } | LogOutput::Console { .. } => return Ok(None),
    };
    parse_log_line(stream, &String::from_utf8_lossy(&message)).map(Some)
}

/// Splits a `<RFC3339Nano timestamp> <message>` frame.
pub fn parse_log_line(stream: LogStream, frame: &str) -> Result<RawLogLine, LogSourceError> {
    let frame = frame.strip_suffix('\n').unwrap_or(frame);
    let frame = frame.strip_suffix('\r').unwrap_or(frame);
    let (timestamp, message) = frame.split_once(' ').unwrap_or((frame, ""));

    let timestamp = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|_| LogSourceError::Malformed(frame.to_string()))?
        .timestamp_micros();

    Ok(RawLogLine {
        stream,
        timestamp,
        message: message.to_string(),
    })
}

/// Follows the Docker events API and forwards container lifecycle events.
pub struct DockerEventFeed {
    docker: Docker,
}

impl DockerEventFeed {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Runs until the receiving side of `tx` is dropped.
    ///
    /// A reconnect resumes from the last event seen, so events from the
    /// gap are replayed instead of lost. Replays may repeat that event.
    pub async fn run(self, tx: Sender<ContainerEvent>) {
        log::info!("Docker event feed started");
        let mut last_time_nano: Option<i64> = None;
        loop {
            let mut builder = EventsOptionsBuilder::new();
            if let Some(time_nano) = last_time_nano {
                builder = builder.since(&events_since(time_nano));
            }
            let options: EventsOptions = builder.build();
            let mut events = self.docker.events(Some(options));

            while let Some(result) = events.next().await {
                match result {
                    Ok(message) => {
                        if let Some(time_nano) = message.time_nano {
                            last_time_nano = last_time_nano.max(Some(time_nano));
                        }
                        if message.typ != Some(EventMessageTypeEnum::CONTAINER) {
                            continue;
                        }
                        let Some(event) = into_container_event(
                            message.action,
                            message
                                .actor
                                .and_then(|a| a.id.map(|id| (id, a.attributes.unwrap_or_default()))),
                            message.time_nano,
                        ) else {
                            continue;
                        };
                        if tx.send(event).await.is_err() {
                            log::info!("Docker event feed stopped");
                            return;
                        }
                    }
                    Err(e) => {
                        log::error!("Docker event stream failed: {e}");
                        break;
                    }
                }
            }

            if tx.is_closed() {
                log::info!("Docker event feed stopped");
                return;
            }
            log::warn!("Reconnecting to Docker event stream in {RECONNECT_DELAY:?}");
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }
}

fn into_container_event(
    action: Option<String>,
    actor: Option<(String, std::collections::HashMap<String, String>)>,
    time_nano: Option<i64>,
) -> Option<ContainerEvent> {
    let action = action?;
    let (id, attributes) = actor?;
    // Exec events look like "exec_start: sh -c ..."
    let action = action.split(':').next().unwrap_or_default().trim();

    let mut event =
        ContainerEvent::new(id, ContainerStatus::from_action(action)).with_labels(attributes);
    if let Some(nanos) = time_nano {
        event = event.at(nanos / 1_000);
    }
    Some(event)
}
