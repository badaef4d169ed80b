//! In-memory log source driven by the test body.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::channel::mpsc::{UnboundedSender, unbounded};
use futures_util::StreamExt;

use super::record::{LogStream, RawLogLine, StreamOptions};
use crate::source::{ContainerInfo, LogLineStream, LogSource, LogSourceError};

type Feed = UnboundedSender<Result<RawLogLine, LogSourceError>>;

#[derive(Default)]
pub struct ScriptedSource {
    opened: Mutex<Vec<(String, StreamOptions)>>,
    feeds: Mutex<HashMap<String, Feed>>,
    unavailable: Mutex<HashSet<String>>,
    running: Mutex<Vec<ContainerInfo>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `open_stream` call so far, in order.
    pub fn opened(&self) -> Vec<(String, StreamOptions)> {
        self.opened.lock().unwrap().clone()
    }

    /// Emits a stdout line on the container's open stream. Returns false if
    /// no stream is listening.
    pub fn push(&self, container_id: &str, timestamp: i64, message: &str) -> bool {
        let line = RawLogLine {
            stream: LogStream::Stdout,
            timestamp,
            message: message.to_string(),
        };
        self.send(container_id, Ok(line))
    }

    pub fn fail(&self, container_id: &str) -> bool {
        self.send(
            container_id,
            Err(LogSourceError::NotRunning(container_id.to_string())),
        )
    }

    /// Ends the container's stream from the source side.
    pub fn close(&self, container_id: &str) {
        self.feeds.lock().unwrap().remove(container_id);
    }

    pub fn make_unavailable(&self, container_id: &str) {
        self.unavailable
            .lock()
            .unwrap()
            .insert(container_id.to_string());
    }

    pub fn make_available(&self, container_id: &str) {
        self.unavailable.lock().unwrap().remove(container_id);
    }

    pub fn set_running(&self, containers: Vec<ContainerInfo>) {
        *self.running.lock().unwrap() = containers;
    }

    fn send(&self, container_id: &str, item: Result<RawLogLine, LogSourceError>) -> bool {
        match self.feeds.lock().unwrap().get(container_id) {
            Some(feed) => feed.unbounded_send(item).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl LogSource for ScriptedSource {
    async fn open_stream(
        &self,
        container_id: &str,
        options: &StreamOptions,
    ) -> Result<LogLineStream, LogSourceError> {
        if self.unavailable.lock().unwrap().contains(container_id) {
            return Err(LogSourceError::NotFound(container_id.to_string()));
        }
        self.opened
            .lock()
            .unwrap()
            .push((container_id.to_string(), *options));

        let (tx, rx) = unbounded();
        self.feeds
            .lock()
            .unwrap()
            .insert(container_id.to_string(), tx);
        Ok(rx.boxed())
    }

    async fn running_containers(&self) -> Result<Vec<ContainerInfo>, LogSourceError> {
        Ok(self.running.lock().unwrap().clone())
    }
}
