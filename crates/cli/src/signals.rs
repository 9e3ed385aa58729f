//! Interrupt handling for running sessions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Set `cancel` on SIGINT (Ctrl+C) or SIGTERM. Abort the returned handle
/// once the session has ended.
pub fn cancel_on_interrupt(cancel: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {
                            info!("received SIGINT (Ctrl+C), cancelling session");
                        }
                        _ = sigterm.recv() => {
                            info!("received SIGTERM, cancelling session");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to register SIGTERM handler");
                    if ctrl_c.await.is_err() {
                        return;
                    }
                    info!("received SIGINT (Ctrl+C), cancelling session");
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = ctrl_c.await {
                warn!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            info!("received Ctrl+C, cancelling session");
        }

        eprintln!("Cancelling after the current step...");
        cancel.store(true, Ordering::SeqCst);
    })
}

/// Copy `interrupted` into a session's cancel token until aborted, so one
/// interrupt handler can cancel a series of sessions.
pub fn forward_cancel(interrupted: Arc<AtomicBool>, cancel: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(100));
        loop {
            tick.tick().await;
            if interrupted.load(Ordering::SeqCst) {
                cancel.store(true, Ordering::SeqCst);
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_forward_cancel_sets_session_token() {
        let interrupted = Arc::new(AtomicBool::new(false));
        let cancel = Arc::new(AtomicBool::new(false));
        let forward = forward_cancel(interrupted.clone(), cancel.clone());

        interrupted.store(true, Ordering::SeqCst);
        forward.await.unwrap();
        assert!(cancel.load(Ordering::SeqCst));
    }
}
