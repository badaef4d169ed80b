//! Per-container log streaming.
//!
//! [`LogSupervisor`] keeps exactly one [`ContainerLogWorker`] per live
//! container and periodically saves each worker's progress so a restart
//! resumes where shipping left off.

pub mod events;
pub mod record;
pub mod supervisor;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use events::QueueStateEvent;
pub use record::LogRecord;
pub use supervisor::{LogSupervisor, SupervisorConfig, SupervisorInbox};
