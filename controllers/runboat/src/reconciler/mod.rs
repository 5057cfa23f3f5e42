//! Background reconcilers.
//!
//! Each reconciler is a long-lived task woken by build index changes
//! and by a periodic tick, operating on index snapshots. Decisions are
//! advisory: a race with a user command or another reconciler resolves
//! on the next pass, because all writes go through the idempotent
//! cluster API.

pub mod cleaner;
pub mod initializer;
pub mod stopper;
pub mod undeployer;


use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::events::BuildChange;

/// Periodic pass interval, independent of change notifications.
pub(crate) const RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

/// Delay between a wakeup and the pass, so bursts of watch events (for
/// instance at startup) coalesce into one pass.
pub(crate) const EVENT_BUFFERING_DELAY: Duration = Duration::from_secs(1);

/// Waits for the next reason to reconcile. Returns `false` on
/// cancellation.
pub(crate) async fn next_wakeup(
    rx: &mut broadcast::Receiver<BuildChange>,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => return false,
        _ = tokio::time::sleep(RECONCILE_INTERVAL) => {}
        result = rx.recv() => match result {
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => {
                // No more change notifications; stay tick-driven.
                tokio::select! {
                    _ = cancel.cancelled() => return false,
                    _ = tokio::time::sleep(RECONCILE_INTERVAL) => return true,
                }
            }
        },
    }
    tokio::select! {
        _ = cancel.cancelled() => return false,
        _ = tokio::time::sleep(EVENT_BUFFERING_DELAY) => {}
    }
    // Drain whatever accumulated during the buffering delay; it is all
    // covered by the pass we are about to make.
    while rx.try_recv().is_ok() {}
    true
}
