//! # Aggregation
//!
//! In-memory state that turns a stream of relay reports into one logical
//! message per packet:
//!
//! - [`PacketAggregator`] groups envelopes by packet id within one deployment
//!   and evicts them after an hour.
//! - [`CrossMeshAggregator`] merges the same `(id, sender)` seen by several
//!   deployments, with per-deployment dirty tracking and a ten minute merge
//!   window.
//! - [`FifoCache`] is the bounded identifier memory used for message ids and
//!   node-info dedup.
//!
//! None of these types lock internally. The packet aggregator is owned by a
//! single deployment task; the cross-mesh aggregator is shared through
//! [`SharedCrossMesh`].

pub mod cross_mesh;
pub mod fifo;
pub mod packets;

use std::sync::{Arc, Mutex, MutexGuard};

pub use cross_mesh::{CrossMeshAggregator, CrossMeshGroup, MERGE_WINDOW_SECS};
pub use fifo::FifoCache;
pub use packets::{PacketAggregator, PacketGroup, RETENTION_SECS};

pub type SharedCrossMesh = Arc<Mutex<CrossMeshAggregator>>;

pub fn shared_cross_mesh() -> SharedCrossMesh {
    Arc::new(Mutex::new(CrossMeshAggregator::new()))
}

/// Lock the shared aggregator, recovering from poisoning.
pub fn lock_cross_mesh(shared: &SharedCrossMesh) -> MutexGuard<'_, CrossMeshAggregator> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
