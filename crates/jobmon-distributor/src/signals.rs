//! Signal policy.
//!
//! SIGTERM and SIGHUP request a clean shutdown, surfaced at the service's
//! next suspension point. SIGINT is swallowed so the distributor survives a
//! user hitting Ctrl-C on an attached CLI.

use tokio::sync::watch;
use tracing::info;

/// Install the handlers; the receiver flips to `true` on SIGTERM/SIGHUP.
pub fn install() -> std::io::Result<watch::Receiver<bool>> {
    let (tx, rx) = watch::channel(false);

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("got signal SIGTERM");
                        let _ = tx.send(true);
                    }
                    _ = sighup.recv() => {
                        info!("got signal SIGHUP");
                        let _ = tx.send(true);
                    }
                    _ = sigint.recv() => {
                        info!("ignoring SIGINT");
                    }
                }
            }
        });
    }

    Ok(rx)
}
