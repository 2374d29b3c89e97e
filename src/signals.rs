use tokio::signal;

/// Completes when the process is asked to stop.
#[cfg(unix)]
pub async fn signal_for_shutdown() {
    use signal::unix::{signal as unix_signal, SignalKind};
    use tracing::warn;

    let (mut terminate_signal, mut quit_signal) =
        match (unix_signal(SignalKind::terminate()), unix_signal(SignalKind::quit())) {
            (Ok(terminate), Ok(quit)) => (terminate, quit),
            (Err(err), _) | (_, Err(err)) => {
                warn!("cannot listen for termination signals, falling back to ctrl-c: {}", err);
                signal::ctrl_c().await.ok();
                return;
            }
        };

    tokio::select! {
        _ = signal::ctrl_c() => (),
        _ = terminate_signal.recv() => (),
        _ = quit_signal.recv() => (),
    }
}

#[cfg(not(unix))]
pub async fn signal_for_shutdown() {
    signal::ctrl_c().await.ok();
}
