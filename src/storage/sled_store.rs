use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;

use super::{NodeInfo, NodeStore, StoreError};
use crate::logutil::{escape_log, MeshLogger};
use crate::meshtastic::nodeid::is_node_hex;
use crate::protobuf::meshtastic_generated as proto;

const INVALID_NODE_ID: &str = "Invalid Node Id";

/// Open (or create) the shared database at `path`.
pub fn open_db<P: AsRef<Path>>(path: P) -> Result<sled::Db, StoreError> {
    let path_ref = path.as_ref();
    std::fs::create_dir_all(path_ref)?;
    Ok(sled::open(path_ref)?)
}

/// Per-node boolean designations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFlag {
    Tracker,
    Balloon,
    Banned,
}

impl NodeFlag {
    fn kind(self) -> &'static str {
        match self {
            NodeFlag::Tracker => "tracker",
            NodeFlag::Balloon => "balloon",
            NodeFlag::Banned => "banned",
        }
    }

    fn already_set(self, hex: &str) -> String {
        match self {
            NodeFlag::Tracker => format!("Node {} is already a tracker node", hex),
            NodeFlag::Balloon => format!("Node {} is already a balloon node", hex),
            NodeFlag::Banned => format!("Node {} is already banned", hex),
        }
    }

    fn set_done(self, hex: &str) -> String {
        match self {
            NodeFlag::Tracker => format!("Node {} added as a tracker node", hex),
            NodeFlag::Balloon => format!("Node {} added as a balloon node", hex),
            NodeFlag::Banned => format!("Node {} banned", hex),
        }
    }

    fn not_set(self, hex: &str) -> String {
        match self {
            NodeFlag::Tracker => format!("Node {} is not a tracker node", hex),
            NodeFlag::Balloon => format!("Node {} is not a balloon node", hex),
            NodeFlag::Banned => format!("Node {} is not banned", hex),
        }
    }

    fn cleared(self, hex: &str) -> String {
        match self {
            NodeFlag::Tracker => format!("Node {} removed as a tracker node", hex),
            NodeFlag::Balloon => format!("Node {} removed as a balloon node", hex),
            NodeFlag::Banned => format!("Node {} unbanned", hex),
        }
    }
}

/// Sled-backed node directory scoped to one deployment.
#[derive(Debug, Clone)]
pub struct SledNodeStore {
    db: sled::Db,
    prefix: String,
    log: MeshLogger,
}

impl SledNodeStore {
    /// Blank mesh ids share the `default` key space.
    pub fn new(db: sled::Db, mesh_id: &str) -> Self {
        let cleaned = match mesh_id.trim() {
            "" => "default",
            other => other,
        };
        Self {
            db,
            prefix: format!("mesh:{}", cleaned),
            log: MeshLogger::new(cleaned),
        }
    }

    pub fn key_prefix(&self) -> &str {
        &self.prefix
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn key(&self, kind: &str, hex: &str) -> Vec<u8> {
        format!("{}:{}:{}", self.prefix, kind, hex).into_bytes()
    }

    fn get_string(&self, kind: &str, hex: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .db
            .get(self.key(kind, hex))?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    pub fn has_flag(&self, flag: NodeFlag, hex: &str) -> Result<bool, StoreError> {
        if !is_node_hex(hex) {
            return Ok(false);
        }
        Ok(self.db.contains_key(self.key(flag.kind(), hex))?)
    }

    pub fn set_flag(&self, flag: NodeFlag, hex: &str) -> Result<String, StoreError> {
        if !is_node_hex(hex) {
            return Ok(INVALID_NODE_ID.to_string());
        }
        if self.has_flag(flag, hex)? {
            self.log.info(format_args!("{}", flag.already_set(hex)));
            return Ok(flag.already_set(hex));
        }
        self.db.insert(self.key(flag.kind(), hex), "1")?;
        self.db.flush()?;
        Ok(flag.set_done(hex))
    }

    pub fn clear_flag(&self, flag: NodeFlag, hex: &str) -> Result<String, StoreError> {
        if !is_node_hex(hex) {
            return Ok(INVALID_NODE_ID.to_string());
        }
        if !self.has_flag(flag, hex)? {
            self.log.info(format_args!("{}", flag.not_set(hex)));
            return Ok(flag.not_set(hex));
        }
        self.db.remove(self.key(flag.kind(), hex))?;
        self.db.flush()?;
        Ok(flag.cleared(hex))
    }

    /// Link a node to a chat user. A node has at most one owner; relinking to
    /// the same user is a no-op success.
    pub fn link_node(&self, hex: &str, user_id: &str) -> Result<String, StoreError> {
        if !is_node_hex(hex) {
            return Ok(INVALID_NODE_ID.to_string());
        }
        if let Some(owner) = self.get_string("nodelink", hex)? {
            if owner != user_id {
                self.log
                    .info(format_args!("Node {} is already linked to user {}", hex, owner));
                return Ok(format!("Node {} is already linked to another account.", hex));
            }
        }
        self.db.insert(self.key("nodelink", hex), user_id)?;
        self.db.flush()?;
        Ok(format!("Node {} linked", hex))
    }

    pub fn unlink_node(&self, hex: &str, user_id: &str) -> Result<String, StoreError> {
        if !is_node_hex(hex) {
            return Ok(INVALID_NODE_ID.to_string());
        }
        if self.get_string("nodelink", hex)?.as_deref() != Some(user_id) {
            self.log
                .info(format_args!("Node {} is not linked to user {}", hex, user_id));
            return Ok(format!("Node {} is not linked to your account.", hex));
        }
        self.db.remove(self.key("nodelink", hex))?;
        self.db.flush()?;
        Ok(format!("Node {} unlinked", hex))
    }

    /// Hex ids of every node linked to `user_id`, in key order.
    pub fn nodes_linked_to(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let scan = format!("{}:nodelink:", self.prefix);
        let mut nodes = Vec::new();
        for entry in self.db.scan_prefix(scan.as_bytes()) {
            let (key, value) = entry?;
            if &*value != user_id.as_bytes() {
                continue;
            }
            let key = String::from_utf8_lossy(&key);
            if let Some(hex) = key.strip_prefix(scan.as_str()) {
                nodes.push(hex.to_string());
            }
        }
        Ok(nodes)
    }

    pub fn node_info(&self, hex: &str) -> Result<Option<NodeInfo>, StoreError> {
        match self.db.get(self.key("nodeinfo", hex))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn long_name(&self, hex: &str) -> Result<Option<String>, StoreError> {
        self.get_string("node", hex)
    }

    fn flag_or_log(&self, flag: NodeFlag, hex: &str) -> bool {
        self.has_flag(flag, hex).unwrap_or_else(|e| {
            self.log
                .error(format_args!("{} lookup for {} failed: {}", flag.kind(), hex, e));
            false
        })
    }
}

#[async_trait]
impl NodeStore for SledNodeStore {
    async fn is_banned_node(&self, node_hex: &str) -> bool {
        self.flag_or_log(NodeFlag::Banned, node_hex)
    }

    async fn is_tracker_node(&self, node_hex: &str) -> bool {
        self.flag_or_log(NodeFlag::Tracker, node_hex)
    }

    async fn is_balloon_node(&self, node_hex: &str) -> bool {
        self.flag_or_log(NodeFlag::Balloon, node_hex)
    }

    async fn update_node_info(
        &self,
        node_hex: &str,
        user: &proto::User,
        hop_start: u32,
        packet_id: u32,
    ) -> Result<(), StoreError> {
        let info = NodeInfo::from_user(user, hop_start, Utc::now().timestamp_millis());
        self.db.insert(self.key("node", node_hex), user.long_name.as_bytes())?;
        self.db
            .insert(self.key("nodeinfo", node_hex), serde_json::to_vec(&info)?)?;
        let or_dash = |s: &str| if s.is_empty() { "-".to_string() } else { escape_log(s) };
        self.log.info(format_args!(
            "updated node info for: {} (packetId: {}) (short: {}, long: {})",
            node_hex,
            packet_id,
            or_dash(&info.short_name),
            or_dash(&info.long_name),
        ));
        Ok(())
    }

    async fn node_infos(&self, node_hexes: &[String]) -> HashMap<String, NodeInfo> {
        let wanted: BTreeSet<&str> = node_hexes.iter().map(String::as_str).collect();
        let mut found = HashMap::new();
        for hex in &wanted {
            match self.node_info(hex) {
                Ok(Some(info)) => {
                    found.insert(info.id.clone(), info);
                }
                Ok(None) => {}
                Err(e) => self.log.error(format_args!("nodeinfo {}: {}", hex, e)),
            }
        }
        if found.len() != wanted.len() {
            let missing: Vec<&str> = wanted
                .iter()
                .copied()
                .filter(|hex| !found.contains_key(*hex))
                .collect();
            self.log
                .debug(format_args!("Missing nodeInfo for nodes: {}", missing.join(",")));
        }
        found
    }

    async fn linked_user(&self, node_hex: &str) -> Option<String> {
        if !is_node_hex(node_hex) {
            return None;
        }
        self.get_string("nodelink", node_hex).unwrap_or_else(|e| {
            self.log
                .error(format_args!("nodelink lookup for {} failed: {}", node_hex, e));
            None
        })
    }
}
