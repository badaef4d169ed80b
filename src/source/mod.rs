//! Log source capability.
//!
//! A log source turns a container id plus [`StreamOptions`] into a
//! long-lived stream of [`RawLogLine`]s. The stream ending is the
//! source's way of saying the container's logs are closed.

pub mod docker;

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::collector::record::{RawLogLine, StreamOptions};

pub use docker::{DockerEventFeed, DockerLogSource};

pub type LogLineStream = BoxStream<'static, Result<RawLogLine, LogSourceError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub labels: HashMap<String, String>,
}

#[async_trait]
pub trait LogSource: Send + Sync + 'static {
    /// Opens a follow-mode log stream for `container_id`.
    ///
    /// Fails when the container cannot be streamed right now. An `Ok`
    /// stream may still yield errors later on.
    async fn open_stream(
        &self,
        container_id: &str,
        options: &StreamOptions,
    ) -> Result<LogLineStream, LogSourceError>;

    /// Containers that are currently running on the host.
    async fn running_containers(&self) -> Result<Vec<ContainerInfo>, LogSourceError>;
}

#[async_trait]
impl<T: LogSource + ?Sized> LogSource for std::sync::Arc<T> {
    async fn open_stream(
        &self,
        container_id: &str,
        options: &StreamOptions,
    ) -> Result<LogLineStream, LogSourceError> {
        (**self).open_stream(container_id, options).await
    }

    async fn running_containers(&self) -> Result<Vec<ContainerInfo>, LogSourceError> {
        (**self).running_containers().await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogSourceError {
    #[error("Docker API error: {0}")]
    DockerApi(#[from] bollard::errors::Error),
    #[error("Container {0} not found")]
    NotFound(String),
    #[error("Container {0} is not running")]
    NotRunning(String),
    #[error("Malformed log line: {0:?}")]
    Malformed(String),
}
