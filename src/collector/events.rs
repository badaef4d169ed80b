use std::collections::HashMap;

/// Runtime state a container transitioned to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    Started,
    Died,
    Other(String),
}

impl ContainerStatus {
    /// Maps a Docker event action onto a status.
    pub fn from_action(action: &str) -> Self {
        match action {
            "start" | "started" => Self::Started,
            "die" | "died" => Self::Died,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    pub container_id: String,
    pub status: ContainerStatus,
    /// Event time in microseconds (UTC), when the transport provides one.
    pub time: Option<i64>,
    pub labels: HashMap<String, String>,
}

impl ContainerEvent {
    pub fn new(container_id: impl Into<String>, status: ContainerStatus) -> Self {
        Self {
            container_id: container_id.into(),
            status,
            time: None,
            labels: HashMap::new(),
        }
    }

    pub fn at(mut self, time: i64) -> Self {
        self.time = Some(time);
        self
    }

    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.labels = labels;
        self
    }
}

/// Whether the downstream shipper currently accepts work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Started,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStateEvent {
    pub state: QueueState,
}

impl QueueStateEvent {
    pub fn started() -> Self {
        Self {
            state: QueueState::Started,
        }
    }

    pub fn stopped() -> Self {
        Self {
            state: QueueState::Stopped,
        }
    }
}
