//! Cluster gateway for the runboat controller
//!
//! A thin abstraction over the Kubernetes API, covering everything the
//! controller needs from the cluster:
//!
//! - **Watching**: resumable label-filtered streams of workload and job
//!   changes, with re-lists folded into a single atomic event
//! - **Mutation**: annotation merge-patches, scaling, finalizer removal,
//!   deletion by label
//! - **Bundles**: rendering a kubefiles template directory and
//!   server-side applying the result
//! - **Logs**: tail of the most recent pod of a build or job
//!
//! The [`ClusterGateway`] trait enables mocking: the concrete
//! [`KubeGateway`] talks to a real cluster, while [`mock::MockCluster`]
//! (behind the `test-util` feature) simulates one in memory.

pub mod bundle;
pub mod client;
pub mod error;
#[path = "trait.rs"]
pub mod gateway_trait;
pub mod kubefiles;
#[cfg(feature = "test-util")]
pub mod mock;
pub mod retry;

pub use bundle::{split_image, BundleRequest, BundleVars, DeploymentMode};
pub use client::KubeGateway;
pub use error::GatewayError;
pub use gateway_trait::{ClusterGateway, WatchEvent, WatchStream};
#[cfg(feature = "test-util")]
pub use mock::MockCluster;
pub use retry::{with_retries, FibonacciBackoff};
