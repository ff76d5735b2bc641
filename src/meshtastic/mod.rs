//! # Meshtastic Packet Model
//!
//! Typed views over the MQTT uplink traffic produced by Meshtastic gateways.
//! The prost-generated types in [`crate::protobuf`] mirror the wire schema; this
//! module turns them into the shapes the rest of the bridge works with:
//!
//! - [`Envelope`] - one relay report of a packet as heard by one gateway
//! - [`Packet`] - the logical mesh packet (id, sender, hop budget, payload)
//! - [`PacketPayload`] - decoded application data or still-encrypted bytes
//! - [`AppPayload`] - the application message, selected by port number
//!
//! Submodules:
//!
//! - [`topic`] - MQTT subscription pattern matching
//! - [`crypto`] - AES-CTR channel decryption with key trial
//! - [`nodeid`] - node id <-> hex conversions
//!
//! ## Decode failures
//!
//! Gateways publish status strings ("online"/"offline") on the same topic
//! tree as protobuf envelopes. Those decode with an invalid wire type in the
//! very first tag byte; [`is_benign_decode_failure`] recognises that case so
//! callers can drop it without logging.

pub mod crypto;
pub mod nodeid;
pub mod topic;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use prost::Message;
use thiserror::Error;

use crate::protobuf::meshtastic_generated as proto;

pub use proto::PortNum;

/// Destination address used for channel-wide broadcasts.
pub const BROADCAST_ADDR: u32 = 0xffff_ffff;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// True when a decode failure is the known non-envelope traffic signature:
/// an invalid wire type (7) in the first tag byte.
pub fn is_benign_decode_failure(raw: &[u8]) -> bool {
    raw.first().is_some_and(|b| b & 0x07 == 7)
}

/// Decoded application data carried by a packet.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedData {
    pub portnum: i32,
    pub payload: Bytes,
    pub reply_id: Option<u32>,
}

impl DecodedData {
    pub fn port(&self) -> PortNum {
        PortNum::try_from(self.portnum).unwrap_or(PortNum::UnknownApp)
    }

    /// Decode the payload according to the port number.
    pub fn app_payload(&self) -> Result<AppPayload, WireError> {
        let port = self.port();
        let payload = match port {
            PortNum::TextMessageApp => {
                AppPayload::Text(String::from_utf8_lossy(&self.payload).into_owned())
            }
            PortNum::PositionApp => {
                AppPayload::Position(proto::Position::decode(self.payload.clone())?)
            }
            PortNum::NodeinfoApp => AppPayload::NodeInfo(proto::User::decode(self.payload.clone())?),
            other => AppPayload::Other(other),
        };
        Ok(payload)
    }
}

impl From<proto::Data> for DecodedData {
    fn from(data: proto::Data) -> Self {
        Self {
            portnum: data.portnum,
            payload: data.payload,
            reply_id: (data.reply_id != 0).then_some(data.reply_id),
        }
    }
}

/// Application message selected by port number.
#[derive(Debug, Clone, PartialEq)]
pub enum AppPayload {
    Text(String),
    Position(proto::Position),
    NodeInfo(proto::User),
    Other(PortNum),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PacketPayload {
    Decoded(DecodedData),
    Encrypted(Bytes),
    Empty,
}

/// The logical mesh packet. `id` is 32 bits and reused over time.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub id: u32,
    pub from: u32,
    pub to: u32,
    pub channel: u32,
    pub rx_time: u32,
    pub rx_snr: f32,
    pub rx_rssi: i32,
    pub hop_start: u32,
    pub hop_limit: u32,
    pub payload: PacketPayload,
}

impl Packet {
    pub fn decoded(&self) -> Option<&DecodedData> {
        match &self.payload {
            PacketPayload::Decoded(data) => Some(data),
            _ => None,
        }
    }

    pub fn encrypted(&self) -> Option<&Bytes> {
        match &self.payload {
            PacketPayload::Encrypted(bytes) if !bytes.is_empty() => Some(bytes),
            _ => None,
        }
    }

    /// Port number, present only once the payload is decoded.
    pub fn port(&self) -> Option<PortNum> {
        self.decoded().map(DecodedData::port)
    }

    pub fn reply_id(&self) -> Option<u32> {
        self.decoded().and_then(|d| d.reply_id)
    }

    pub fn from_hex(&self) -> String {
        nodeid::node_id_to_hex(self.from)
    }

    pub fn to_hex(&self) -> String {
        nodeid::node_id_to_hex(self.to)
    }

    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST_ADDR
    }

    /// Hops travelled as seen by the reporting gateway.
    pub fn hops_away(&self) -> i64 {
        i64::from(self.hop_start) - i64::from(self.hop_limit)
    }
}

impl From<proto::MeshPacket> for Packet {
    fn from(pkt: proto::MeshPacket) -> Self {
        use proto::mesh_packet::PayloadVariant;
        let payload = match pkt.payload_variant {
            Some(PayloadVariant::Decoded(data)) => PacketPayload::Decoded(data.into()),
            Some(PayloadVariant::Encrypted(bytes)) => PacketPayload::Encrypted(bytes),
            None => PacketPayload::Empty,
        };
        Self {
            id: pkt.id,
            from: pkt.from,
            to: pkt.to,
            channel: pkt.channel,
            rx_time: pkt.rx_time,
            rx_snr: pkt.rx_snr,
            rx_rssi: pkt.rx_rssi,
            hop_start: pkt.hop_start,
            hop_limit: pkt.hop_limit,
            payload,
        }
    }
}

/// One relay report of one packet, as seen through one gateway and topic.
///
/// `received_at`, `topic` and `source` are stamped when the envelope enters an
/// aggregator. `mesh_id` is only set on the cross-deployment path.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub packet: Packet,
    pub channel_id: String,
    pub gateway_id: String,
    pub received_at: DateTime<Utc>,
    pub topic: String,
    pub source: String,
    pub mesh_id: Option<String>,
}

impl Envelope {
    /// Decode a ServiceEnvelope. `Ok(None)` when the envelope carries no packet.
    pub fn decode(raw: &[u8]) -> Result<Option<Self>, WireError> {
        let envelope = proto::ServiceEnvelope::decode(raw)?;
        Ok(envelope.packet.map(|packet| Self {
            packet: packet.into(),
            channel_id: envelope.channel_id,
            gateway_id: envelope.gateway_id,
            received_at: Utc::now(),
            topic: String::new(),
            source: String::new(),
            mesh_id: None,
        }))
    }

    pub fn new(packet: Packet, channel_id: &str, gateway_id: &str) -> Self {
        Self {
            packet,
            channel_id: channel_id.to_string(),
            gateway_id: gateway_id.to_string(),
            received_at: Utc::now(),
            topic: String::new(),
            source: String::new(),
            mesh_id: None,
        }
    }

    pub(crate) fn stamp(&mut self, topic: &str, source: &str, now: DateTime<Utc>) {
        self.received_at = now;
        self.topic = topic.to_string();
        self.source = source.to_string();
    }

    /// Gateway id without the leading `!`.
    pub fn gateway_hex(&self) -> &str {
        self.gateway_id.trim_start_matches('!')
    }
}
