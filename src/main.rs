use std::process::ExitCode;

use tokio::sync::mpsc;

use crate::collector::{LogSupervisor, SupervisorInbox};
use crate::config::LogshipConfig;
use crate::source::{DockerEventFeed, DockerLogSource};

mod checkpoint;
mod cli;
mod collector;
mod config;
mod shipper;
mod signals;
mod source;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize the logger
    env_logger::init();

    let args = cli::get_cli_args();

    let config = match LogshipConfig::try_init(&args.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Unable to read config {:?}: {e}", args.config);
            return ExitCode::FAILURE;
        }
    };

    let docker = match source::docker::connect() {
        Ok(docker) => docker,
        Err(e) => {
            log::error!("Unable to connect to Docker: {e}");
            return ExitCode::FAILURE;
        }
    };

    let checkpoints = match checkpoint::open_store(&config.checkpoint_path).await {
        Ok(store) => store,
        Err(e) => {
            log::error!(
                "Unable to open log cursors at {:?}: {e}",
                config.checkpoint_path
            );
            return ExitCode::FAILURE;
        }
    };

    let (output_tx, output_rx) = mpsc::channel(config.queue_capacity.get());
    let (senders, inbox) = SupervisorInbox::new(EVENT_CHANNEL_CAPACITY);

    if let Err(e) = signals::handle_shutdown(senders.shutdown.clone()) {
        log::error!("Unable to install signal handlers: {e}");
        return ExitCode::FAILURE;
    }

    tokio::spawn(DockerEventFeed::new(docker.clone()).run(senders.container_events.clone()));
    let shipper = tokio::spawn(shipper::run(output_rx, senders.queue_events.clone()));

    let supervisor = LogSupervisor::new(
        DockerLogSource::new(docker),
        checkpoints,
        output_tx,
        config.supervisor_config(),
    );

    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);
    supervisor.run(inbox).await;

    // Every output sender is gone now, let the shipper drain what is left
    if let Err(e) = shipper.await {
        log::error!("Shipper task failed: {e}");
    }

    ExitCode::SUCCESS
}
