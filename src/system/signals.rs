// src/system/signals.rs

use crate::CancellationToken;
use std::sync::atomic::Ordering;
use std::thread;

fn request_cancellation(token: &CancellationToken, source: &str) {
    log::debug!("{} received, cancelling the run.", source);
    token.store(true, Ordering::SeqCst);
}

/// Installs `Ctrl+C` and (on Unix) `SIGTERM` handlers that set `token`.
///
/// The handlers live on a small current-thread tokio runtime running on a
/// background thread, so the rest of qanat stays synchronous. The `SIGTERM`
/// listener is registered before this returns.
pub fn install_cancellation_handlers(token: CancellationToken) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    #[cfg(unix)]
    let mut terminate = {
        let _guard = runtime.enter();
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?
    };

    thread::Builder::new()
        .name("qanat-signals".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                #[cfg(unix)]
                {
                    let term_token = token.clone();
                    tokio::spawn(async move {
                        if terminate.recv().await.is_some() {
                            request_cancellation(&term_token, "SIGTERM");
                        }
                    });
                }
                match tokio::signal::ctrl_c().await {
                    Ok(()) => request_cancellation(&token, "Ctrl+C"),
                    Err(e) => log::warn!("Could not listen for Ctrl+C: {}", e),
                }
                // Keep listening for SIGTERM after the first Ctrl+C.
                std::future::pending::<()>().await;
            });
        })?;

    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::system::executor;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    #[test]
    fn test_sigterm_sets_the_token() {
        // --- Setup ---
        let token = Arc::new(AtomicBool::new(false));
        install_cancellation_handlers(token.clone()).unwrap();

        // --- Execute ---
        executor::terminate_process(std::process::id()).unwrap();

        // --- Assert ---
        let deadline = Instant::now() + Duration::from_secs(5);
        while !token.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(token.load(Ordering::SeqCst));
    }
}
