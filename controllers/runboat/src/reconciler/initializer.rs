//! Initializer: admits builds from the todo queue into initialization,
//! bounded by the max-initializing cap.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ControllerError;
use crate::index::BuildIndex;
use crate::lifecycle::Lifecycle;
use crate::reconciler::next_wakeup;

pub struct Initializer {
    index: Arc<BuildIndex>,
    lifecycle: Arc<Lifecycle>,
    max_initializing: usize,
}

impl Initializer {
    pub fn new(index: Arc<BuildIndex>, lifecycle: Arc<Lifecycle>, max_initializing: usize) -> Self {
        Self {
            index,
            lifecycle,
            max_initializing,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ControllerError> {
        let mut rx = self.index.subscribe();
        while next_wakeup(&mut rx, &cancel).await {
            if let Err(e) = self.run_once().await {
                warn!("initializer pass failed: {e}");
            }
        }
        Ok(())
    }

    /// One admission pass over a snapshot of the index.
    pub async fn run_once(&self) -> Result<(), ControllerError> {
        if !self.index.ready() {
            return Ok(());
        }
        let initializing = self.index.count_initializing();
        let capacity = self.max_initializing.saturating_sub(initializing);
        if capacity == 0 {
            return Ok(());
        }
        let to_initialize = self.index.to_initialize(capacity);
        if to_initialize.is_empty() {
            return Ok(());
        }
        info!(
            "{initializing} builds of max {} are initializing, launching {} initialization jobs",
            self.max_initializing,
            to_initialize.len()
        );
        for build in to_initialize {
            self.lifecycle.initialize(&build).await?;
        }
        Ok(())
    }
}
