use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Exit status used when a second signal interrupts fleet teardown.
const FORCED_EXIT_STATUS: i32 = 130;

/// Watch for SIGTERM and SIGINT.
///
/// The returned token is cancelled on the first signal. Pending provisioning
/// waits and connection retries observe it and give up, then the server tears
/// down every registered fleet. Teardown can take a while, so a second signal
/// exits the process at once and leaves any remaining instances running.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let token = CancellationToken::new();
    let cancel = token.clone();

    tokio::spawn(async move {
        let name = next_signal(&mut sigterm, &mut sigint).await;
        tracing::info!(signal = name, "Shutdown requested, tearing down fleets");
        cancel.cancel();

        let name = next_signal(&mut sigterm, &mut sigint).await;
        tracing::warn!(
            signal = name,
            "Second signal received, exiting without finishing teardown"
        );
        std::process::exit(FORCED_EXIT_STATUS);
    });

    Ok(token)
}

async fn next_signal(sigterm: &mut Signal, sigint: &mut Signal) -> &'static str {
    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    }
}
