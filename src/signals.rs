use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use tokio::sync::mpsc::Sender;

/// What should we do when the user stops
/// this program?
///
/// Asks the supervisor to save cursors and stop its workers. Signals
/// arriving while a shutdown is pending are coalesced.
pub fn handle_shutdown(shutdown: Sender<()>) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    std::thread::spawn(move || {
        for signal in signals.forever() {
            log::warn!("Received signal {signal}, shutting down");
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
            let _ = shutdown.try_send(());
        }
    });

    Ok(())
}
