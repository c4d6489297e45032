//! Best-effort supervisor readiness/stopping notification.
//!
//! Sends are non-blocking and lossy under backpressure: the `sd-notify`
//! crate's `notify()` call is synchronous but typically completes in a
//! single non-blocking `sendto`, so it runs on the blocking thread pool
//! and its result is never awaited on any hot path.

use sd_notify::NotifyState;

/// Send `READY=1` to the supervisor, if `NOTIFY_SOCKET` is set. Logged,
/// never propagated — a missing or unreachable supervisor socket must
/// never stop the daemon from starting.
pub async fn notify_ready() {
    send(NotifyState::Ready).await;
}

/// Send `STOPPING=1` to the supervisor, if `NOTIFY_SOCKET` is set.
pub async fn notify_stopping() {
    send(NotifyState::Stopping).await;
}

async fn send(state: NotifyState) {
    let result = tokio::task::spawn_blocking(move || sd_notify::notify(false, &[state])).await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::debug!(%err, "supervisor notification failed"),
        Err(err) => tracing::debug!(%err, "supervisor notification task panicked"),
    }
}
