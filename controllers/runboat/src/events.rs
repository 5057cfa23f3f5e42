//! Build change events broadcast to subscribers.

use serde::Serialize;

use build_model::Build;

/// Per-subscriber buffer size. A subscriber that falls further behind
/// than this is dropped and must reconnect for a fresh snapshot.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildEventKind {
    /// Build added or modified
    Upd,
    /// Build removed
    Del,
}

/// One delta of the build index.
#[derive(Debug, Clone)]
pub struct BuildChange {
    pub kind: BuildEventKind,
    pub build: Build,
}
