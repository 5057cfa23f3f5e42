//! Cleaner: launches the cleanup job for builds that carry a deletion
//! timestamp and have no cleanup job yet.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::ControllerError;
use crate::index::BuildIndex;
use crate::lifecycle::Lifecycle;
use crate::reconciler::next_wakeup;

pub struct Cleaner {
    index: Arc<BuildIndex>,
    lifecycle: Arc<Lifecycle>,
}

impl Cleaner {
    pub fn new(index: Arc<BuildIndex>, lifecycle: Arc<Lifecycle>) -> Self {
        Self { index, lifecycle }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ControllerError> {
        let mut rx = self.index.subscribe();
        while next_wakeup(&mut rx, &cancel).await {
            if let Err(e) = self.run_once().await {
                warn!("cleaner pass failed: {e}");
            }
        }
        Ok(())
    }

    pub async fn run_once(&self) -> Result<(), ControllerError> {
        if !self.index.ready() {
            return Ok(());
        }
        for build in self.index.to_cleanup() {
            self.lifecycle.cleanup(&build).await?;
        }
        Ok(())
    }
}
