use tokio_util::sync::CancellationToken;

/// Exit code used when a second signal cuts the graceful stop short.
const FORCED_EXIT_CODE: i32 = 130;

/// Install a handler for SIGTERM and SIGINT (Ctrl-C elsewhere).
///
/// The first signal cancels the returned token; the server then stops its
/// node, which drains in-flight dispatches for up to `shutdown_timeout`.
/// A second signal exits the process immediately. Claims left behind that way
/// are taken over by other nodes once this node's heartbeat goes stale.
///
/// # Errors
///
/// Fails if the signal handlers cannot be registered.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let mut signals = Signals::register()?;
    let token = CancellationToken::new();
    let cancel = token.clone();

    tokio::spawn(async move {
        let name = signals.next().await;
        tracing::info!(signal = name, "Shutdown requested, stopping scheduler node");
        cancel.cancel();

        let name = signals.next().await;
        tracing::warn!(signal = name, "Second signal received, exiting without draining");
        std::process::exit(FORCED_EXIT_CODE);
    });

    Ok(token)
}

#[cfg(unix)]
struct Signals {
    term: tokio::signal::unix::Signal,
    int: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn register() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
        })
    }

    async fn next(&mut self) -> &'static str {
        tokio::select! {
            _ = self.term.recv() => "SIGTERM",
            _ = self.int.recv() => "SIGINT",
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn register() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn next(&mut self) -> &'static str {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl-C handler failed");
        }
        "ctrl-c"
    }
}
