//! Undeployer: keeps the total number of deployed builds under the cap
//! by undeploying the oldest stopped or failed ones. Initializing and
//! started builds are never evicted.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ControllerError;
use crate::index::BuildIndex;
use crate::lifecycle::Lifecycle;
use crate::reconciler::next_wakeup;

pub struct Undeployer {
    index: Arc<BuildIndex>,
    lifecycle: Arc<Lifecycle>,
    max_deployed: usize,
}

impl Undeployer {
    pub fn new(index: Arc<BuildIndex>, lifecycle: Arc<Lifecycle>, max_deployed: usize) -> Self {
        Self {
            index,
            lifecycle,
            max_deployed,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ControllerError> {
        let mut rx = self.index.subscribe();
        while next_wakeup(&mut rx, &cancel).await {
            if let Err(e) = self.run_once().await {
                warn!("undeployer pass failed: {e}");
            }
        }
        Ok(())
    }

    pub async fn run_once(&self) -> Result<(), ControllerError> {
        if !self.index.ready() {
            return Ok(());
        }
        let deployed = self.index.count_deployed();
        let excess = deployed.saturating_sub(self.max_deployed);
        if excess == 0 {
            return Ok(());
        }
        let to_undeploy = self.index.oldest_evictable(excess);
        if to_undeploy.is_empty() {
            return Ok(());
        }
        info!(
            "{deployed} builds of max {} are deployed, undeploying {}",
            self.max_deployed,
            to_undeploy.len()
        );
        for build in to_undeploy {
            match self.lifecycle.undeploy(&build.name).await {
                Ok(()) => {}
                Err(ControllerError::NotFound(_) | ControllerError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
