//! Graceful shutdown signal handling.
//!
//! Produces a future that resolves when the server should begin shutting
//! down, for use with `axum::serve().with_graceful_shutdown()`.

/// Returns a future that resolves when an OS shutdown signal is received.
///
/// On Unix, listens for both SIGINT (Ctrl+C) and SIGTERM and logs which
/// signal triggered the shutdown.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for SIGINT: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
            }
        }
    };

    #[cfg(unix)]
    {
        tokio::select! {
            () = ctrl_c => {
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
            }
            () = terminate => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
        tracing::info!("Received Ctrl+C, initiating graceful shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `with_graceful_shutdown` requires a `Future<Output = ()> + Send`.
    #[test]
    fn shutdown_signal_is_send_future() {
        fn assert_send_future<T: std::future::Future<Output = ()> + Send>(_f: T) {}
        assert_send_future(shutdown_signal());
    }

    #[tokio::test]
    async fn shutdown_signal_is_pollable_without_signal() {
        let result = tokio::time::timeout(std::time::Duration::from_millis(50), async {
            tokio::select! {
                () = shutdown_signal() => "shutdown",
                _ = tokio::time::sleep(std::time::Duration::from_millis(10)) => "timeout",
            }
        })
        .await;

        assert_eq!(result.expect("outer timeout should not fire"), "timeout");
    }
}
