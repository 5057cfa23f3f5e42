//! Stopper: keeps the number of started builds under the cap by
//! stopping the ones that were scaled least recently.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ControllerError;
use crate::index::BuildIndex;
use crate::lifecycle::Lifecycle;
use crate::reconciler::next_wakeup;

pub struct Stopper {
    index: Arc<BuildIndex>,
    lifecycle: Arc<Lifecycle>,
    max_started: usize,
}

impl Stopper {
    pub fn new(index: Arc<BuildIndex>, lifecycle: Arc<Lifecycle>, max_started: usize) -> Self {
        Self {
            index,
            lifecycle,
            max_started,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ControllerError> {
        let mut rx = self.index.subscribe();
        while next_wakeup(&mut rx, &cancel).await {
            if let Err(e) = self.run_once().await {
                warn!("stopper pass failed: {e}");
            }
        }
        Ok(())
    }

    pub async fn run_once(&self) -> Result<(), ControllerError> {
        if !self.index.ready() {
            return Ok(());
        }
        let started = self.index.count_started();
        let excess = started.saturating_sub(self.max_started);
        if excess == 0 {
            return Ok(());
        }
        let to_stop = self.index.oldest_started(excess);
        if to_stop.is_empty() {
            return Ok(());
        }
        info!(
            "{started} builds of max {} are started, stopping {}",
            self.max_started,
            to_stop.len()
        );
        for build in to_stop {
            // The build may have been undeployed or removed since the
            // snapshot; that is fine, the cap is converged eventually.
            match self.lifecycle.stop(&build.name).await {
                Ok(()) => {}
                Err(ControllerError::NotFound(_) | ControllerError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
