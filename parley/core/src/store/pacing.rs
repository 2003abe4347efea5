//! Request pacing delays
//!
//! The only deliberate waits in the client: spacing between history fetches
//! of one conversation, and the settle pause after an optimistic add.

use std::time::Duration;

/// Wait out the fetch slot reserved by the pagination manager
pub(crate) async fn wait_for_fetch_slot(delay: Duration) {
    if !delay.is_zero() {
        tracing::debug!(delay_ms = delay.as_millis() as u64, "Spacing history fetch");
        tokio::time::sleep(delay).await;
    }
}

/// Let observers see an optimistic mutation before the next one issues
pub(crate) async fn settle(pause: Duration) {
    if pause.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(pause).await;
    }
}
