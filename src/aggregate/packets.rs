//! Per-deployment grouping of relay reports.
//!
//! Every envelope for the same packet id lands in one [`PacketGroup`]. A group
//! is dirty from the moment an envelope is appended until the next drain.
//! Drains are also the only eviction point: groups created more than
//! [`RETENTION_SECS`] ago are dropped on every call, dirty or not.

use chrono::{DateTime, Duration, Utc};

use crate::meshtastic::Envelope;

pub const RETENTION_SECS: i64 = 60 * 60;

#[derive(Debug, Clone, PartialEq)]
pub struct PacketGroup {
    pub id: u32,
    pub created_at: DateTime<Utc>,
    pub rx_time: u32,
    pub dirty: bool,
    pub envelopes: Vec<Envelope>,
    forwarded: usize,
}

impl PacketGroup {
    fn new(envelope: Envelope) -> Self {
        Self {
            id: envelope.packet.id,
            created_at: envelope.received_at,
            rx_time: envelope.packet.rx_time,
            dirty: true,
            envelopes: vec![envelope],
            forwarded: 0,
        }
    }

    /// Envelopes appended since the previous drain returned this group.
    pub fn fresh_envelopes(&self) -> &[Envelope] {
        &self.envelopes[self.forwarded.min(self.envelopes.len())..]
    }

    /// The first envelope; every group has at least one.
    pub fn first(&self) -> &Envelope {
        &self.envelopes[0]
    }
}

#[derive(Debug, Default)]
pub struct PacketAggregator {
    groups: Vec<PacketGroup>,
}

impl PacketAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exists(&self, id: u32) -> bool {
        self.groups.iter().any(|g| g.id == id)
    }

    pub fn index_of(&self, id: u32) -> Option<usize> {
        self.groups.iter().position(|g| g.id == id)
    }

    pub fn add(&mut self, envelope: Envelope, topic: &str, source: &str) {
        self.add_at(envelope, topic, source, Utc::now());
    }

    pub fn add_at(&mut self, mut envelope: Envelope, topic: &str, source: &str, now: DateTime<Utc>) {
        envelope.stamp(topic, source, now);
        match self.index_of(envelope.packet.id) {
            Some(idx) => {
                let group = &mut self.groups[idx];
                group.envelopes.push(envelope);
                group.dirty = true;
            }
            None => self.groups.push(PacketGroup::new(envelope)),
        }
    }

    /// Return every dirty group (clearing the flag) and evict expired groups.
    pub fn drain(&mut self) -> Vec<PacketGroup> {
        self.drain_at(Utc::now())
    }

    pub fn drain_at(&mut self, now: DateTime<Utc>) -> Vec<PacketGroup> {
        let mut drained = Vec::new();
        for group in self.groups.iter_mut().filter(|g| g.dirty) {
            group.dirty = false;
            drained.push(group.clone());
            group.forwarded = group.envelopes.len();
        }
        let cutoff = now - Duration::seconds(RETENTION_SECS);
        self.groups.retain(|g| g.created_at >= cutoff);
        drained
    }

    pub fn size(&self) -> usize {
        self.groups.len()
    }
}
