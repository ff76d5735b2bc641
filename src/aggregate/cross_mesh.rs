//! Merge of one packet observed through several deployments.
//!
//! Groups are keyed by `(packet id, sender)` since a 32-bit id alone collides
//! across unrelated senders. Any new observation marks the group dirty for
//! every participant, because gateway and hop provenance changed for all of
//! them. Groups not updated within [`MERGE_WINDOW_SECS`] are swept on drain.
//!
//! A deployment keeps its own group far longer than the merge window, so a
//! late relay can arrive after the shared group is gone. [`merge_group`]
//! seeds the shared group from every relay the deployment holds whenever that
//! deployment has no relays in it yet.
//!
//! [`merge_group`]: CrossMeshAggregator::merge_group

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};

use super::packets::PacketGroup;
use crate::meshtastic::{nodeid::node_id_to_hex, Envelope};

pub const MERGE_WINDOW_SECS: i64 = 10 * 60;

#[derive(Debug, Clone, PartialEq)]
pub struct CrossMeshGroup {
    pub key: String,
    pub id: u32,
    pub from: String,
    pub created_at: DateTime<Utc>,
    pub rx_time: u32,
    pub updated_at: DateTime<Utc>,
    pub meshes: BTreeSet<String>,
    pub dirty_for: BTreeSet<String>,
    pub envelopes: Vec<Envelope>,
}

fn merge_key(id: u32, from_hex: &str) -> String {
    format!("{}:{}", id, from_hex)
}

#[derive(Debug, Default)]
pub struct CrossMeshAggregator {
    groups: HashMap<String, CrossMeshGroup>,
}

impl CrossMeshAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exists(&self, id: u32, from: u32) -> bool {
        self.groups.contains_key(&merge_key(id, &node_id_to_hex(from)))
    }

    pub fn add(&mut self, envelope: Envelope, topic: &str, source: &str, mesh_id: &str) {
        self.add_at(envelope, topic, source, mesh_id, Utc::now());
    }

    pub fn add_at(
        &mut self,
        mut envelope: Envelope,
        topic: &str,
        source: &str,
        mesh_id: &str,
        now: DateTime<Utc>,
    ) {
        envelope.stamp(topic, source, now);
        envelope.mesh_id = Some(mesh_id.to_string());
        let from = envelope.packet.from_hex();
        let key = merge_key(envelope.packet.id, &from);

        if let Some(group) = self.groups.get_mut(&key) {
            group.envelopes.push(envelope);
            group.meshes.insert(mesh_id.to_string());
            group.updated_at = now;
            group.dirty_for = group.meshes.clone();
            return;
        }

        let participants: BTreeSet<String> = [mesh_id.to_string()].into_iter().collect();
        self.groups.insert(
            key.clone(),
            CrossMeshGroup {
                key,
                id: envelope.packet.id,
                from,
                created_at: now,
                rx_time: envelope.packet.rx_time,
                updated_at: now,
                meshes: participants.clone(),
                dirty_for: participants,
                envelopes: vec![envelope],
            },
        );
    }

    /// Forward one drained deployment group. Only its fresh relays are added
    /// while `mesh_id` already participates; otherwise every relay is added,
    /// skipping gateways this deployment has already contributed.
    pub fn merge_group(&mut self, group: &PacketGroup, mesh_id: &str) {
        self.merge_group_at(group, mesh_id, Utc::now());
    }

    pub fn merge_group_at(&mut self, group: &PacketGroup, mesh_id: &str, now: DateTime<Utc>) {
        let first = group.first();
        let key = merge_key(first.packet.id, &first.packet.from_hex());
        let participating = self
            .groups
            .get(&key)
            .is_some_and(|g| g.meshes.contains(mesh_id));

        if participating {
            for envelope in group.fresh_envelopes() {
                let (topic, source) = (envelope.topic.clone(), envelope.source.clone());
                self.add_at(envelope.clone(), &topic, &source, mesh_id, now);
            }
            return;
        }
        for envelope in &group.envelopes {
            if self.has_relay(&key, mesh_id, &envelope.gateway_id) {
                continue;
            }
            let (topic, source) = (envelope.topic.clone(), envelope.source.clone());
            self.add_at(envelope.clone(), &topic, &source, mesh_id, now);
        }
    }

    fn has_relay(&self, key: &str, mesh_id: &str, gateway_id: &str) -> bool {
        self.groups.get(key).is_some_and(|g| {
            g.envelopes
                .iter()
                .any(|e| e.mesh_id.as_deref() == Some(mesh_id) && e.gateway_id == gateway_id)
        })
    }

    /// Groups dirty for `mesh_id`, oldest first. Clears only that deployment's
    /// dirty mark, then sweeps groups idle past the merge window.
    pub fn drain(&mut self, mesh_id: &str) -> Vec<CrossMeshGroup> {
        self.drain_at(mesh_id, Utc::now())
    }

    pub fn drain_at(&mut self, mesh_id: &str, now: DateTime<Utc>) -> Vec<CrossMeshGroup> {
        let mut drained: Vec<CrossMeshGroup> = self
            .groups
            .values_mut()
            .filter(|g| g.meshes.contains(mesh_id))
            .filter_map(|g| g.dirty_for.remove(mesh_id).then(|| g.clone()))
            .collect();
        drained.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.key.cmp(&b.key)));
        self.cleanup(now);
        drained
    }

    fn cleanup(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::seconds(MERGE_WINDOW_SECS);
        self.groups.retain(|_, g| g.updated_at >= cutoff);
    }

    pub fn size(&self) -> usize {
        self.groups.len()
    }
}
