//! # Storage Module - Node Directory
//!
//! The bridge keeps a small directory of mesh nodes: the latest NODEINFO each
//! node announced, which chat user owns it, and the tracker/balloon/banned
//! designations that feed the ingestion and delivery filters.
//!
//! Core code only talks to the [`NodeStore`] trait. [`SledNodeStore`] is the
//! bundled implementation; one `sled::Db` is shared by every deployment and
//! each deployment sees its own key space:
//!
//! ```text
//! mesh:<mesh id>:node:<hex>       long name
//! mesh:<mesh id>:nodeinfo:<hex>   NodeInfo JSON
//! mesh:<mesh id>:nodelink:<hex>   owning chat user id
//! mesh:<mesh id>:tracker:<hex>    "1"
//! mesh:<mesh id>:balloon:<hex>    "1"
//! mesh:<mesh id>:banned:<hex>     "1"
//! ```
//!
//! Node ids are the zero-padded 8 hex digit form; anything else is rejected by
//! the admin operations and reads as "not present" in lookups.

mod sled_store;

pub use sled_store::{open_db, NodeFlag, SledNodeStore};

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protobuf::meshtastic_generated as proto;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Directory entry built from a NODEINFO packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    /// Node id without the leading `!`.
    pub id: String,
    #[serde(default)]
    pub long_name: String,
    #[serde(default)]
    pub short_name: String,
    #[serde(default)]
    pub hw_model: i32,
    #[serde(default)]
    pub role: i32,
    #[serde(default)]
    pub is_licensed: bool,
    #[serde(default)]
    pub hop_start: u32,
    /// Milliseconds since the epoch.
    #[serde(default)]
    pub updated_at: i64,
}

impl NodeInfo {
    pub fn from_user(user: &proto::User, hop_start: u32, updated_at: i64) -> Self {
        Self {
            id: user.id.replace('!', ""),
            long_name: user.long_name.clone(),
            short_name: user.short_name.clone(),
            hw_model: user.hw_model,
            role: user.role,
            is_licensed: user.is_licensed,
            hop_start,
            updated_at,
        }
    }
}

/// Key-value collaborator used by ingestion and delivery.
///
/// Lookups never fail from the caller's point of view: store errors are
/// logged by the implementation and read as "not present".
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn is_banned_node(&self, node_hex: &str) -> bool;
    async fn is_tracker_node(&self, node_hex: &str) -> bool;
    async fn is_balloon_node(&self, node_hex: &str) -> bool;

    /// Record the latest NODEINFO for `node_hex`.
    async fn update_node_info(
        &self,
        node_hex: &str,
        user: &proto::User,
        hop_start: u32,
        packet_id: u32,
    ) -> Result<(), StoreError>;

    /// Directory entries for the given hex ids, keyed by entry id. Unknown ids
    /// are absent from the map.
    async fn node_infos(&self, node_hexes: &[String]) -> HashMap<String, NodeInfo>;

    /// Chat user that linked `node_hex`, if any.
    async fn linked_user(&self, node_hex: &str) -> Option<String>;
}
