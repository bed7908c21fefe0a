//! Stop signals for `jobfleet worker`.
//!
//! SIGTERM or SIGINT never kills running jobs. The Worker stops claiming new
//! jobs, waits for the running ones to finish and report, then exits without
//! terminating its instance.

use std::io;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Register SIGTERM and SIGINT and return the token they cancel.
///
/// Registration happens before this returns, so a signal sent afterwards is
/// never lost. Signals after the first are logged and otherwise ignored.
pub fn install_shutdown_handler() -> io::Result<CancellationToken> {
    let sigterm = signal(SignalKind::terminate())?;
    let sigint = signal(SignalKind::interrupt())?;
    let token = CancellationToken::new();

    let stop = token.clone();
    tokio::spawn(async move {
        let (mut sigterm, mut sigint) = (sigterm, sigint);
        let name = next_signal(&mut sigterm, &mut sigint).await;
        tracing::info!(signal = name, "Stopping worker once running jobs finish");
        stop.cancel();

        loop {
            let name = next_signal(&mut sigterm, &mut sigint).await;
            tracing::warn!(signal = name, "Already stopping, still waiting for running jobs");
        }
    });

    Ok(token)
}

async fn next_signal(sigterm: &mut Signal, sigint: &mut Signal) -> &'static str {
    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn sigterm_cancels_token() {
        let token = install_shutdown_handler().unwrap();
        assert!(!token.is_cancelled());

        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .expect("token cancelled after SIGTERM");
    }
}
