//! Inbound classification: which uplink messages become packet groups.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::aggregate::{FifoCache, PacketAggregator, PacketGroup};
use crate::logutil::MeshLogger;
use crate::meshtastic::crypto::Keyring;
use crate::meshtastic::topic::TopicPattern;
use crate::meshtastic::{is_benign_decode_failure, AppPayload, DecodedData, Envelope, PacketPayload, PortNum};
use crate::metrics;
use crate::storage::NodeStore;

/// One message as received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NotMeshTopic,
    JsonTopic,
    StatusTopic,
    Undecodable,
    NoPacket,
    NotSubscribed,
    Undecrypted,
    UnhandledPort,
    UntrackedPosition,
    NoPositionFix,
    NodeInfoDisabled,
    DuplicateNodeInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Appended to a packet group.
    Grouped,
    /// NODEINFO recorded in the node directory.
    NodeInfo,
    Dropped(DropReason),
}

pub struct IngestSettings {
    pub topics: Vec<TopicPattern>,
    /// Recorded as each envelope's source.
    pub broker_url: String,
    pub node_info_updates: bool,
}

/// Owns a deployment's [`PacketAggregator`] and node-info dedup memory.
pub struct Ingestor {
    settings: IngestSettings,
    keyring: Arc<Keyring>,
    store: Arc<dyn NodeStore>,
    aggregator: PacketAggregator,
    node_info_seen: FifoCache<u32, ()>,
    log: MeshLogger,
}

impl Ingestor {
    pub fn new(
        settings: IngestSettings,
        keyring: Arc<Keyring>,
        store: Arc<dyn NodeStore>,
        log: MeshLogger,
    ) -> Self {
        Self {
            settings,
            keyring,
            store,
            aggregator: PacketAggregator::new(),
            node_info_seen: FifoCache::default(),
            log,
        }
    }

    pub fn aggregator(&self) -> &PacketAggregator {
        &self.aggregator
    }

    fn subscribed(&self, topic: &str) -> bool {
        self.settings.topics.iter().any(|p| p.matches(topic))
    }

    pub async fn ingest(&mut self, message: &InboundMessage) -> Admission {
        self.ingest_at(message, Utc::now()).await
    }

    pub async fn ingest_at(&mut self, message: &InboundMessage, now: DateTime<Utc>) -> Admission {
        let topic = message.topic.as_str();
        if !topic.contains("msh") {
            return Admission::Dropped(DropReason::NotMeshTopic);
        }
        if topic.contains("/json") {
            return Admission::Dropped(DropReason::JsonTopic);
        }
        if topic.contains("/stat/") {
            return Admission::Dropped(DropReason::StatusTopic);
        }

        let mut envelope = match Envelope::decode(&message.payload) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return Admission::Dropped(DropReason::NoPacket),
            Err(e) => {
                if !is_benign_decode_failure(&message.payload) {
                    self.log
                        .error(format_args!("MessageId: Error decoding service envelope: {}", e));
                }
                return Admission::Dropped(DropReason::Undecodable);
            }
        };

        if !self.subscribed(topic) && !self.aggregator.exists(envelope.packet.id) {
            return Admission::Dropped(DropReason::NotSubscribed);
        }
        metrics::inc_envelopes_ingested();

        if let Some(encrypted) = envelope.packet.encrypted().cloned() {
            let (id, from) = (envelope.packet.id, envelope.packet.from);
            match self.keyring.decrypt(id, from, &encrypted) {
                Some(decoded) => envelope.packet.payload = PacketPayload::Decoded(decoded),
                None => {
                    metrics::inc_decrypt_failures();
                    self.log.debug(format_args!(
                        "No channel key decrypts packet {} from {}",
                        id,
                        envelope.packet.from_hex()
                    ));
                    return Admission::Dropped(DropReason::Undecrypted);
                }
            }
        }

        let Some(decoded) = envelope.packet.decoded().cloned() else {
            return Admission::Dropped(DropReason::UnhandledPort);
        };
        match decoded.port() {
            PortNum::TextMessageApp => {
                self.aggregator
                    .add_at(envelope, topic, &self.settings.broker_url, now);
                Admission::Grouped
            }
            PortNum::PositionApp => self.position(envelope, &decoded, topic, now).await,
            PortNum::NodeinfoApp => self.node_info(&envelope, &decoded).await,
            _ => Admission::Dropped(DropReason::UnhandledPort),
        }
    }

    async fn position(
        &mut self,
        envelope: Envelope,
        decoded: &DecodedData,
        topic: &str,
        now: DateTime<Utc>,
    ) -> Admission {
        let from = envelope.packet.from_hex();
        let tracked =
            self.store.is_tracker_node(&from).await || self.store.is_balloon_node(&from).await;
        if !tracked {
            return Admission::Dropped(DropReason::UntrackedPosition);
        }
        let has_fix = match decoded.app_payload() {
            Ok(AppPayload::Position(pos)) => {
                pos.latitude_i.unwrap_or(0) != 0 || pos.longitude_i.unwrap_or(0) != 0
            }
            Ok(_) => false,
            Err(e) => {
                self.log
                    .warn(format_args!("Bad position payload from {}: {}", from, e));
                false
            }
        };
        if !has_fix {
            return Admission::Dropped(DropReason::NoPositionFix);
        }
        self.aggregator
            .add_at(envelope, topic, &self.settings.broker_url, now);
        Admission::Grouped
    }

    async fn node_info(&mut self, envelope: &Envelope, decoded: &DecodedData) -> Admission {
        if !self.settings.node_info_updates {
            return Admission::Dropped(DropReason::NodeInfoDisabled);
        }
        let packet = &envelope.packet;
        if self.node_info_seen.exists(&packet.id) {
            return Admission::Dropped(DropReason::DuplicateNodeInfo);
        }
        self.node_info_seen.set(packet.id, ());

        let user = match decoded.app_payload() {
            Ok(AppPayload::NodeInfo(user)) => user,
            Ok(_) => return Admission::Dropped(DropReason::UnhandledPort),
            Err(e) => {
                self.log.warn(format_args!(
                    "Bad NODEINFO payload from {}: {}",
                    packet.from_hex(),
                    e
                ));
                return Admission::Dropped(DropReason::Undecodable);
            }
        };
        let from = packet.from_hex();
        if let Err(e) = self
            .store
            .update_node_info(&from, &user, packet.hop_start, packet.id)
            .await
        {
            self.log
                .error(format_args!("Failed to store node info for {}: {}", from, e));
        }
        metrics::inc_node_info_updates();
        Admission::NodeInfo
    }

    /// Dirty groups since the previous drain; also evicts expired groups.
    pub fn drain_at(&mut self, now: DateTime<Utc>) -> Vec<PacketGroup> {
        let drained = self.aggregator.drain_at(now);
        metrics::add_groups_drained(drained.len());
        drained
    }

    pub fn drain(&mut self) -> Vec<PacketGroup> {
        self.drain_at(Utc::now())
    }
}
