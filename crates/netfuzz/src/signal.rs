//! Cooperative cancellation and signal handling.
//!
//! SIGINT and SIGTERM never kill the process outright: they abort the shared
//! [`AbortToken`], and the running session unwinds into teardown at its next
//! suspension point. Later signals are logged and otherwise ignored, so
//! teardown is never entered twice.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Shared cancellation flag, observable from async code.
#[derive(Debug, Clone)]
pub struct AbortToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for AbortToken {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request an abort. Returns `true` only for the call that flipped the flag.
    pub fn abort(&self) -> bool {
        self.tx.send_if_modified(|aborted| {
            if *aborted {
                false
            } else {
                *aborted = true;
                true
            }
        })
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`abort`](Self::abort) has been called.
    pub async fn aborted(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|aborted| *aborted).await;
    }
}

/// Installed SIGINT/SIGTERM listener. Dropping it stops listening.
pub struct SignalGate {
    signals_seen: Arc<AtomicU32>,
    listener: JoinHandle<()>,
}

impl SignalGate {
    /// Register signal listeners that abort `token`.
    ///
    /// Must be called from within a tokio runtime.
    #[cfg(unix)]
    pub fn install(token: AbortToken) -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let signals_seen = Arc::new(AtomicU32::new(0));

        let seen = signals_seen.clone();
        let listener = tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    Some(()) = interrupt.recv() => "SIGINT",
                    Some(()) = terminate.recv() => "SIGTERM",
                    else => break,
                };
                handle_signal(&token, &seen, name);
            }
        });

        Ok(Self {
            signals_seen,
            listener,
        })
    }

    #[cfg(not(unix))]
    pub fn install(token: AbortToken) -> std::io::Result<Self> {
        let signals_seen = Arc::new(AtomicU32::new(0));
        let seen = signals_seen.clone();
        let listener = tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                handle_signal(&token, &seen, "ctrl-c");
            }
        });
        Ok(Self {
            signals_seen,
            listener,
        })
    }

    /// Number of termination signals received so far.
    pub fn signals_seen(&self) -> u32 {
        self.signals_seen.load(Ordering::Acquire)
    }
}

impl Drop for SignalGate {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

fn handle_signal(token: &AbortToken, seen: &AtomicU32, name: &'static str) {
    let count = seen.fetch_add(1, Ordering::AcqRel) + 1;
    if token.abort() {
        tracing::info!(signal = name, "received {name}, aborting session and cleaning up");
    } else {
        tracing::warn!(
            signal = name,
            count,
            "received {name} while already aborting; teardown continues"
        );
    }
}
