//! Test utilities & fixtures shared by the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use prost::Message;

use meshrelay::config::{self, BridgeConfig};
use meshrelay::delivery::{ChatClient, DeliveryError, OutboundMessage};
use meshrelay::meshtastic::crypto::{apply_keystream, packet_nonce, ChannelKey};
use meshrelay::meshtastic::{PortNum, BROADCAST_ADDR};
use meshrelay::protobuf::meshtastic_generated as proto;

#[derive(Debug, Clone)]
pub struct ChatCall {
    pub action: &'static str,
    pub channel: String,
    pub message_id: String,
    pub parent: Option<String>,
    pub message: OutboundMessage,
}

impl ChatCall {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.message.embeds[0]
            .fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value.as_str())
    }
}

/// Records every call; message ids are `msg-<n>`.
#[derive(Default)]
pub struct RecordingChat {
    calls: Mutex<Vec<ChatCall>>,
    next: AtomicU64,
}

impl RecordingChat {
    pub fn calls(&self) -> Vec<ChatCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, action: &'static str, channel: &str, id: Option<&str>, parent: Option<&str>, msg: &OutboundMessage) -> String {
        let message_id = id
            .map(str::to_string)
            .unwrap_or_else(|| format!("msg-{}", self.next.fetch_add(1, Ordering::SeqCst) + 1));
        self.calls.lock().unwrap().push(ChatCall {
            action,
            channel: channel.to_string(),
            message_id: message_id.clone(),
            parent: parent.map(str::to_string),
            message: msg.clone(),
        });
        message_id
    }
}

#[async_trait]
impl ChatClient for RecordingChat {
    async fn channel_exists(&self, _channel_id: &str) -> bool {
        true
    }

    async fn send(&self, channel_id: &str, message: &OutboundMessage) -> Result<String, DeliveryError> {
        Ok(self.record("send", channel_id, None, None, message))
    }

    async fn reply(&self, channel_id: &str, parent: &str, message: &OutboundMessage) -> Result<String, DeliveryError> {
        Ok(self.record("reply", channel_id, None, Some(parent), message))
    }

    async fn edit(&self, channel_id: &str, message_id: &str, message: &OutboundMessage) -> Result<(), DeliveryError> {
        self.record("edit", channel_id, Some(message_id), None, message);
        Ok(())
    }

    async fn member_avatar_url(&self, user_id: &str) -> Option<String> {
        Some(format!("https://avatars.example.org/{user_id}.png"))
    }
}

pub fn as_chat(chat: &Arc<RecordingChat>) -> Arc<dyn ChatClient> {
    chat.clone()
}

/// A validated single- or multi-deployment config rooted in `store`.
pub fn bridge_config(doc: serde_json::Value) -> BridgeConfig {
    config::validate(&doc).expect("valid config")
}

pub fn mesh_doc(id: &str, topic: &str, channel: &str, peers: &[&str]) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "mqtt": { "brokerUrl": format!("mqtt://{id}.example.org"), "topics": [topic] },
        "discord": { "token": "token", "clientId": "1", "guildId": "2" },
        "routing": { "channelRegex": [{ "pattern": "^LongFast$", "discordChannelId": channel }] },
        "crossMeshPeers": peers,
    })
}

pub struct PacketSpec {
    pub id: u32,
    pub from: u32,
    pub hop_start: u32,
    pub hop_limit: u32,
    pub gateway: String,
    pub reply_id: u32,
}

impl PacketSpec {
    pub fn new(id: u32, from: u32, gateway: &str) -> Self {
        Self {
            id,
            from,
            hop_start: 3,
            hop_limit: 3,
            gateway: gateway.to_string(),
            reply_id: 0,
        }
    }

    pub fn hops(mut self, hop_start: u32, hop_limit: u32) -> Self {
        self.hop_start = hop_start;
        self.hop_limit = hop_limit;
        self
    }

    pub fn reply_to(mut self, id: u32) -> Self {
        self.reply_id = id;
        self
    }

    fn data(&self, port: PortNum, payload: Vec<u8>) -> proto::Data {
        proto::Data {
            portnum: port as i32,
            payload: Bytes::from(payload),
            reply_id: self.reply_id,
            ..Default::default()
        }
    }

    fn envelope(&self, variant: proto::mesh_packet::PayloadVariant) -> Bytes {
        proto::ServiceEnvelope {
            packet: Some(proto::MeshPacket {
                id: self.id,
                from: self.from,
                to: BROADCAST_ADDR,
                rx_time: 1_700_000_000,
                rx_snr: 5.5,
                rx_rssi: -80,
                hop_start: self.hop_start,
                hop_limit: self.hop_limit,
                payload_variant: Some(variant),
                ..Default::default()
            }),
            channel_id: "LongFast".into(),
            gateway_id: self.gateway.clone(),
        }
        .encode_to_vec()
        .into()
    }

    pub fn text(&self, body: &str) -> Bytes {
        let data = self.data(PortNum::TextMessageApp, body.as_bytes().to_vec());
        self.envelope(proto::mesh_packet::PayloadVariant::Decoded(data))
    }

    /// Text encrypted with `key_b64`.
    pub fn encrypted_text(&self, body: &str, key_b64: &str) -> Bytes {
        let key = ChannelKey::from_base64(key_b64).expect("key");
        let mut bytes = self
            .data(PortNum::TextMessageApp, body.as_bytes().to_vec())
            .encode_to_vec();
        apply_keystream(&key, &packet_nonce(self.id, self.from), &mut bytes);
        self.envelope(proto::mesh_packet::PayloadVariant::Encrypted(bytes.into()))
    }

    pub fn node_info(&self, long_name: &str, short_name: &str) -> Bytes {
        let user = proto::User {
            id: format!("!{:08x}", self.from),
            long_name: long_name.into(),
            short_name: short_name.into(),
            ..Default::default()
        };
        let data = self.data(PortNum::NodeinfoApp, user.encode_to_vec());
        self.envelope(proto::mesh_packet::PayloadVariant::Decoded(data))
    }
}
