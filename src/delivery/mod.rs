//! # Delivery Pipeline
//!
//! Takes drained packet groups and turns them into chat messages. Per packet
//! id the lifecycle is: first drain sends (or replies, when the packet answers
//! a message we already posted), later drains edit that message in place as
//! more gateways report it. The mapping packet id -> chat message id lives in
//! a bounded [`FifoCache`] owned by the pipeline.
//!
//! Filters applied before anything is rendered:
//!
//! - cross-deployment groups keep only envelopes from this deployment and its
//!   peers, and are skipped when none came from this deployment
//! - heartbeat texts (`seq <n>`)
//! - non-broadcast packets when running in production
//! - banned senders
//! - channel labels no routing rule matches, or whose destination is gone
//!   (a missing destination is looked up again after
//!   [`MISSING_CHANNEL_RECHECK`])
//!
//! Send failures are logged and dropped. A size-limit rejection gets exactly
//! one retry with links stripped.
//!
//! [`FifoCache`]: crate::aggregate::FifoCache

pub mod chat;
pub mod render;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::aggregate::{CrossMeshGroup, FifoCache, PacketGroup};
use crate::logutil::{escape_log, MeshLogger};
use crate::meshtastic::{AppPayload, Envelope, PortNum};
use crate::metrics;
use crate::routing::ChannelRouter;
use crate::storage::NodeStore;

pub use chat::{ChatClient, ConsoleChat, DeliveryError};
pub use render::{OutboundMessage, Owner, RenderRequest};

/// A drained group handed from ingestion to delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryGroup {
    pub id: u32,
    pub created_at: DateTime<Utc>,
    pub envelopes: Vec<Envelope>,
}

impl From<PacketGroup> for DeliveryGroup {
    fn from(group: PacketGroup) -> Self {
        Self {
            id: group.id,
            created_at: group.created_at,
            envelopes: group.envelopes,
        }
    }
}

impl From<CrossMeshGroup> for DeliveryGroup {
    fn from(group: CrossMeshGroup) -> Self {
        Self {
            id: group.id,
            created_at: group.created_at,
            envelopes: group.envelopes,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeliverySettings {
    pub mesh_id: String,
    pub mesh_view_base_url: String,
    /// Broadcast-only delivery.
    pub production: bool,
    pub cross_mesh_peers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Send,
    Reply,
    Edit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoLocalEnvelope,
    Undecoded,
    Heartbeat,
    NotBroadcast,
    Banned,
    NoRoute,
    MissingChannel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { action: Action, stripped: bool },
    Skipped(SkipReason),
    Failed(DeliveryError),
}

/// How long a channel the platform reported missing stays cached.
pub const MISSING_CHANNEL_RECHECK: Duration = Duration::from_secs(5 * 60);

enum ChannelState {
    Present,
    Missing { checked_at: Instant },
}

/// `seq 123` keep-alive texts some firmwares broadcast.
pub fn is_heartbeat(text: &str) -> bool {
    text.strip_prefix("seq ")
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

pub struct DeliveryPipeline {
    chat: Arc<dyn ChatClient>,
    store: Arc<dyn NodeStore>,
    router: ChannelRouter,
    settings: DeliverySettings,
    message_ids: FifoCache<u32, String>,
    channels: HashMap<String, ChannelState>,
    missing_recheck: Duration,
    log: MeshLogger,
}

impl DeliveryPipeline {
    pub fn new(
        chat: Arc<dyn ChatClient>,
        store: Arc<dyn NodeStore>,
        router: ChannelRouter,
        settings: DeliverySettings,
    ) -> Self {
        let log = MeshLogger::new(settings.mesh_id.clone());
        Self {
            chat,
            store,
            router,
            settings,
            message_ids: FifoCache::default(),
            channels: HashMap::new(),
            missing_recheck: MISSING_CHANNEL_RECHECK,
            log,
        }
    }

    pub fn with_missing_channel_recheck(mut self, recheck: Duration) -> Self {
        self.missing_recheck = recheck;
        self
    }

    /// Chat message id previously posted for `packet_id`.
    pub fn message_id(&self, packet_id: u32) -> Option<&str> {
        self.message_ids.get(&packet_id).map(String::as_str)
    }

    fn local_envelopes(&self, envelopes: Vec<Envelope>) -> Option<Vec<Envelope>> {
        let own = self.settings.mesh_id.as_str();
        let allowed: BTreeSet<&str> = std::iter::once(own)
            .chain(self.settings.cross_mesh_peers.iter().map(String::as_str))
            .collect();
        let kept: Vec<Envelope> = envelopes
            .into_iter()
            .filter(|e| allowed.contains(e.mesh_id.as_deref().unwrap_or(own)))
            .collect();
        kept.iter()
            .any(|e| e.mesh_id.as_deref().unwrap_or(own) == own)
            .then_some(kept)
    }

    async fn channel_exists(&mut self, channel_id: &str) -> bool {
        match self.channels.get(channel_id) {
            Some(ChannelState::Present) => return true,
            Some(ChannelState::Missing { checked_at }) if checked_at.elapsed() < self.missing_recheck => {
                return false
            }
            _ => {}
        }
        let exists = self.chat.channel_exists(channel_id).await;
        let state = if exists {
            ChannelState::Present
        } else {
            ChannelState::Missing {
                checked_at: Instant::now(),
            }
        };
        self.channels.insert(channel_id.to_string(), state);
        exists
    }

    pub async fn deliver(&mut self, group: DeliveryGroup) -> DeliveryOutcome {
        let Some(envelopes) = self.local_envelopes(group.envelopes) else {
            return DeliveryOutcome::Skipped(SkipReason::NoLocalEnvelope);
        };
        let packet = envelopes[0].packet.clone();
        let Some(decoded) = packet.decoded() else {
            return DeliveryOutcome::Skipped(SkipReason::Undecoded);
        };
        let text = match decoded.port() {
            PortNum::PositionApp => "Position Packet".to_string(),
            _ => match decoded.app_payload() {
                Ok(AppPayload::Text(text)) => text,
                _ => String::from_utf8_lossy(&decoded.payload).into_owned(),
            },
        };

        if is_heartbeat(&text) {
            return DeliveryOutcome::Skipped(SkipReason::Heartbeat);
        }

        if self.settings.production && !packet.is_broadcast() {
            let topics: Vec<&str> = envelopes.iter().map(|e| e.topic.as_str()).collect();
            self.log.info(format_args!(
                "MessageId: {} Not to public channel: {}",
                group.id,
                topics.join(",")
            ));
            return DeliveryOutcome::Skipped(SkipReason::NotBroadcast);
        }

        let existing = self.message_ids.get(&packet.id).cloned();
        let gateways = render::gateway_count(&envelopes, &self.settings.mesh_id);
        let reply_suffix = packet
            .reply_id()
            .map(|r| format!(" | reply_id: {}", r))
            .unwrap_or_default();
        self.log.info(format_args!(
            "{} message ( text: {} | gatewayCount: {}{} )",
            if existing.is_some() { "update" } else { "create" },
            escape_log(&text),
            gateways,
            reply_suffix
        ));

        let from_hex = packet.from_hex();
        if self.store.is_banned_node(&from_hex).await {
            self.log
                .info(format_args!("Node {} is banned. Ignoring message.", from_hex));
            return DeliveryOutcome::Skipped(SkipReason::Banned);
        }

        let label = envelopes[0].channel_id.clone();
        let Some(channel) = self.router.resolve(&label).map(str::to_string) else {
            self.log.warn(format_args!(
                "No regex match for channelId '{}', packetId: {}",
                label, packet.id
            ));
            return DeliveryOutcome::Skipped(SkipReason::NoRoute);
        };
        if !self.channel_exists(&channel).await {
            self.log
                .warn(format_args!("No chat channel found for id: {}", channel));
            return DeliveryOutcome::Skipped(SkipReason::MissingChannel);
        }

        let mut lookup: Vec<String> = envelopes.iter().map(|e| e.gateway_hex().to_string()).collect();
        lookup.push(from_hex.clone());
        let node_infos = self.store.node_infos(&lookup).await;
        let owner = match self.store.linked_user(&from_hex).await {
            Some(user_id) => {
                let avatar_url = self.chat.member_avatar_url(&user_id).await;
                Some(Owner { user_id, avatar_url })
            }
            None => None,
        };
        let request = RenderRequest {
            packet_id: packet.id,
            envelopes: &envelopes,
            text: &text,
            node_infos: &node_infos,
            owner: owner.as_ref(),
            mesh_view_base_url: &self.settings.mesh_view_base_url,
            local_mesh: &self.settings.mesh_id,
            log: &self.log,
        };
        let content = render::render(&request, false);

        let (action, parent) = match (&existing, packet.reply_id()) {
            (Some(_), _) => (Action::Edit, None),
            (None, Some(reply_to)) => match self.message_ids.get(&reply_to) {
                Some(parent) => (Action::Reply, Some(parent.clone())),
                None => (Action::Send, None),
            },
            (None, None) => (Action::Send, None),
        };

        let first = self
            .perform(action, &channel, existing.as_deref(), parent.as_deref(), &content)
            .await;
        let (result, stripped) = match first {
            Err(DeliveryError::SizeLimitExceeded) => {
                self.log.error(format_args!(
                    "{:?} rejected as too large, retrying without links ( packetId: {} )",
                    action, packet.id
                ));
                metrics::inc_size_fallbacks();
                let fallback = render::render(&request, true);
                let retry = self
                    .perform(action, &channel, existing.as_deref(), parent.as_deref(), &fallback)
                    .await;
                (retry, true)
            }
            other => (other, false),
        };

        match result {
            Ok(new_id) => {
                if let Some(id) = new_id {
                    self.message_ids.set(packet.id, id);
                }
                match action {
                    Action::Send => metrics::inc_messages_sent(),
                    Action::Reply => metrics::inc_replies_sent(),
                    Action::Edit => metrics::inc_messages_edited(),
                }
                DeliveryOutcome::Delivered { action, stripped }
            }
            Err(e) => {
                metrics::inc_delivery_failures();
                self.log.error(format_args!(
                    "Chat {:?} failed ( packetId: {}, error: {} )",
                    action, packet.id, e
                ));
                self.log.error(format_args!(
                    "Chat payload ( packetId: {} ): {}",
                    packet.id,
                    render::describe(&content)
                ));
                DeliveryOutcome::Failed(e)
            }
        }
    }

    /// One platform call. Returns the new message id for sends and replies.
    async fn perform(
        &self,
        action: Action,
        channel: &str,
        existing: Option<&str>,
        parent: Option<&str>,
        content: &OutboundMessage,
    ) -> Result<Option<String>, DeliveryError> {
        match (action, existing, parent) {
            (Action::Edit, Some(message_id), _) => {
                self.chat.edit(channel, message_id, content).await.map(|_| None)
            }
            (Action::Reply, _, Some(parent)) => {
                self.chat.reply(channel, parent, content).await.map(Some)
            }
            _ => self.chat.send(channel, content).await.map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelRegexRule;
    use crate::meshtastic::test_support::{envelope, text_packet};
    use crate::meshtastic::{DecodedData, PacketPayload};
    use crate::protobuf::meshtastic_generated as proto;
    use crate::storage::{NodeInfo, StoreError};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;

    /// Records successful calls in `calls` and every attempt, rejected or
    /// not, in `attempts`.
    #[derive(Default)]
    struct FakeChat {
        calls: Mutex<Vec<(String, String)>>,
        attempts: Mutex<Vec<String>>,
        reject_large: Mutex<u32>,
        fail_with: Mutex<Option<DeliveryError>>,
        missing: Mutex<Vec<String>>,
        lookups: Mutex<u32>,
    }

    impl FakeChat {
        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }

        fn attempts(&self) -> Vec<String> {
            self.attempts.lock().unwrap().clone()
        }

        fn reject_next(&self, count: u32) {
            *self.reject_large.lock().unwrap() = count;
        }

        fn record(&self, what: &str, msg: &OutboundMessage) -> Result<(), DeliveryError> {
            let embed = &msg.embeds[0];
            let linked = if embed.url.is_some() { "linked" } else { "plain" };
            let label = format!("{what}:{linked}");
            self.attempts.lock().unwrap().push(label.clone());
            if let Some(err) = self.fail_with.lock().unwrap().clone() {
                return Err(err);
            }
            let mut rejects = self.reject_large.lock().unwrap();
            if *rejects > 0 {
                *rejects -= 1;
                return Err(DeliveryError::SizeLimitExceeded);
            }
            self.calls.lock().unwrap().push((label, embed.description.clone()));
            Ok(())
        }
    }

    #[async_trait]
    impl ChatClient for FakeChat {
        async fn channel_exists(&self, channel_id: &str) -> bool {
            *self.lookups.lock().unwrap() += 1;
            !self.missing.lock().unwrap().iter().any(|m| m == channel_id)
        }
        async fn send(&self, channel_id: &str, msg: &OutboundMessage) -> Result<String, DeliveryError> {
            self.record(&format!("send:{channel_id}"), msg)?;
            Ok(format!("m{}", self.calls().len()))
        }
        async fn reply(&self, channel_id: &str, parent: &str, msg: &OutboundMessage) -> Result<String, DeliveryError> {
            self.record(&format!("reply:{channel_id}:{parent}"), msg)?;
            Ok(format!("m{}", self.calls().len()))
        }
        async fn edit(&self, channel_id: &str, id: &str, msg: &OutboundMessage) -> Result<(), DeliveryError> {
            self.record(&format!("edit:{channel_id}:{id}"), msg)
        }
        async fn member_avatar_url(&self, _user_id: &str) -> Option<String> {
            None
        }
    }

    #[derive(Default)]
    struct FakeStore {
        banned: Vec<String>,
    }

    #[async_trait]
    impl NodeStore for FakeStore {
        async fn is_banned_node(&self, hex: &str) -> bool {
            self.banned.iter().any(|b| b == hex)
        }
        async fn is_tracker_node(&self, _hex: &str) -> bool {
            false
        }
        async fn is_balloon_node(&self, _hex: &str) -> bool {
            false
        }
        async fn update_node_info(&self, _: &str, _: &proto::User, _: u32, _: u32) -> Result<(), StoreError> {
            Ok(())
        }
        async fn node_infos(&self, _hexes: &[String]) -> HashMap<String, NodeInfo> {
            HashMap::new()
        }
        async fn linked_user(&self, _hex: &str) -> Option<String> {
            None
        }
    }

    fn pipeline(chat: Arc<FakeChat>, store: FakeStore, settings: DeliverySettings) -> DeliveryPipeline {
        let router = ChannelRouter::compile(&[ChannelRegexRule {
            pattern: "LongFast".into(),
            discord_channel_id: "123".into(),
            flags: None,
        }])
        .unwrap();
        DeliveryPipeline::new(chat, Arc::new(store), router, settings)
    }

    fn settings() -> DeliverySettings {
        DeliverySettings {
            mesh_id: "bay".into(),
            mesh_view_base_url: "https://meshview.example.org".into(),
            ..Default::default()
        }
    }

    fn group(envelopes: Vec<Envelope>) -> DeliveryGroup {
        DeliveryGroup {
            id: envelopes[0].packet.id,
            created_at: Utc::now(),
            envelopes,
        }
    }

    #[tokio::test]
    async fn send_then_edit() {
        let chat = Arc::new(FakeChat::default());
        let mut p = pipeline(chat.clone(), FakeStore::default(), settings());

        let first = p.deliver(group(vec![envelope(1, 5, "!00000001")])).await;
        assert_eq!(first, DeliveryOutcome::Delivered { action: Action::Send, stripped: false });
        assert_eq!(p.message_id(1), Some("m1"));

        let second = p
            .deliver(group(vec![envelope(1, 5, "!00000001"), envelope(1, 5, "!00000002")]))
            .await;
        assert_eq!(second, DeliveryOutcome::Delivered { action: Action::Edit, stripped: false });
        let calls = chat.calls();
        assert_eq!(calls[0].0, "send:123:linked");
        assert_eq!(calls[1].0, "edit:123:m1:linked");
    }

    #[tokio::test]
    async fn reply_threads_to_known_parent() {
        let chat = Arc::new(FakeChat::default());
        let mut p = pipeline(chat.clone(), FakeStore::default(), settings());
        p.deliver(group(vec![envelope(1, 5, "!00000001")])).await;

        let mut answer = envelope(2, 6, "!00000001");
        if let PacketPayload::Decoded(data) = &mut answer.packet.payload {
            data.reply_id = Some(1);
        }
        let outcome = p.deliver(group(vec![answer])).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { action: Action::Reply, stripped: false });
        assert_eq!(chat.calls()[1].0, "reply:123:m1:linked");

        // Unknown parent falls back to a plain send.
        let mut orphan = envelope(3, 6, "!00000001");
        if let PacketPayload::Decoded(data) = &mut orphan.packet.payload {
            data.reply_id = Some(999);
        }
        let outcome = p.deliver(group(vec![orphan])).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { action: Action::Send, stripped: false });
    }

    #[tokio::test]
    async fn size_limit_retries_once_without_links() {
        let chat = Arc::new(FakeChat {
            reject_large: Mutex::new(1),
            ..Default::default()
        });
        let mut p = pipeline(chat.clone(), FakeStore::default(), settings());
        let outcome = p.deliver(group(vec![envelope(1, 5, "!00000001")])).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { action: Action::Send, stripped: true });
        assert_eq!(chat.calls()[0].0, "send:123:plain");
        assert_eq!(p.message_id(1), Some("m1"));
    }

    #[tokio::test]
    async fn second_size_rejection_is_abandoned() {
        let chat = Arc::new(FakeChat {
            reject_large: Mutex::new(3),
            ..Default::default()
        });
        let mut p = pipeline(chat.clone(), FakeStore::default(), settings());
        let outcome = p.deliver(group(vec![envelope(1, 5, "!00000001")])).await;
        assert_eq!(outcome, DeliveryOutcome::Failed(DeliveryError::SizeLimitExceeded));
        assert_eq!(chat.attempts(), vec!["send:123:linked", "send:123:plain"]);
        assert_eq!(*chat.reject_large.lock().unwrap(), 1);
        assert!(p.message_id(1).is_none());
    }

    #[tokio::test]
    async fn edit_size_rejection_retries_as_edit() {
        let chat = Arc::new(FakeChat::default());
        let mut p = pipeline(chat.clone(), FakeStore::default(), settings());
        p.deliver(group(vec![envelope(1, 5, "!00000001")])).await;

        chat.reject_next(1);
        let outcome = p
            .deliver(group(vec![envelope(1, 5, "!00000001"), envelope(1, 5, "!00000002")]))
            .await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { action: Action::Edit, stripped: true });
        assert_eq!(
            chat.attempts(),
            vec!["send:123:linked", "edit:123:m1:linked", "edit:123:m1:plain"]
        );
        assert_eq!(p.message_id(1), Some("m1"));
    }

    #[tokio::test]
    async fn reply_size_rejection_retries_as_reply() {
        let chat = Arc::new(FakeChat::default());
        let mut p = pipeline(chat.clone(), FakeStore::default(), settings());
        p.deliver(group(vec![envelope(1, 5, "!00000001")])).await;

        let mut answer = envelope(2, 6, "!00000001");
        if let PacketPayload::Decoded(data) = &mut answer.packet.payload {
            data.reply_id = Some(1);
        }
        chat.reject_next(1);
        let outcome = p.deliver(group(vec![answer])).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { action: Action::Reply, stripped: true });
        assert_eq!(
            chat.attempts(),
            vec!["send:123:linked", "reply:123:m1:linked", "reply:123:m1:plain"]
        );
        assert_eq!(p.message_id(2), Some("m2"));
    }

    #[tokio::test]
    async fn other_edit_failures_are_not_retried() {
        let chat = Arc::new(FakeChat::default());
        let mut p = pipeline(chat.clone(), FakeStore::default(), settings());
        p.deliver(group(vec![envelope(1, 5, "!00000001")])).await;

        *chat.fail_with.lock().unwrap() = Some(DeliveryError::Platform("unknown message".into()));
        let outcome = p
            .deliver(group(vec![envelope(1, 5, "!00000001"), envelope(1, 5, "!00000002")]))
            .await;
        assert_eq!(
            outcome,
            DeliveryOutcome::Failed(DeliveryError::Platform("unknown message".into()))
        );
        assert_eq!(chat.attempts(), vec!["send:123:linked", "edit:123:m1:linked"]);
        // The posted message stays known for later edits.
        assert_eq!(p.message_id(1), Some("m1"));
    }

    #[tokio::test]
    async fn filters_skip_without_sending() {
        let chat = Arc::new(FakeChat::default());
        let store = FakeStore {
            banned: vec!["00000066".into()],
        };
        let mut p = pipeline(
            chat.clone(),
            store,
            DeliverySettings {
                production: true,
                ..settings()
            },
        );

        let mut seq = envelope(1, 5, "!00000001");
        seq.packet = text_packet(1, 5, "seq 6034");
        assert_eq!(
            p.deliver(group(vec![seq])).await,
            DeliveryOutcome::Skipped(SkipReason::Heartbeat)
        );

        let mut direct = envelope(2, 5, "!00000001");
        direct.packet.to = 0x1234;
        assert_eq!(
            p.deliver(group(vec![direct])).await,
            DeliveryOutcome::Skipped(SkipReason::NotBroadcast)
        );

        assert_eq!(
            p.deliver(group(vec![envelope(3, 0x66, "!00000001")])).await,
            DeliveryOutcome::Skipped(SkipReason::Banned)
        );

        let mut other = envelope(4, 5, "!00000001");
        other.channel_id = "MediumSlow".into();
        assert_eq!(
            p.deliver(group(vec![other])).await,
            DeliveryOutcome::Skipped(SkipReason::NoRoute)
        );
        assert!(chat.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_channel_is_skipped() {
        let chat = Arc::new(FakeChat {
            missing: Mutex::new(vec!["123".into()]),
            ..Default::default()
        });
        let mut p = pipeline(chat.clone(), FakeStore::default(), settings());
        assert_eq!(
            p.deliver(group(vec![envelope(1, 5, "!00000001")])).await,
            DeliveryOutcome::Skipped(SkipReason::MissingChannel)
        );

        // Created afterwards, but the negative answer is still cached.
        chat.missing.lock().unwrap().clear();
        assert_eq!(
            p.deliver(group(vec![envelope(2, 5, "!00000001")])).await,
            DeliveryOutcome::Skipped(SkipReason::MissingChannel)
        );
        assert_eq!(*chat.lookups.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_channel_is_looked_up_again_after_recheck_interval() {
        let chat = Arc::new(FakeChat {
            missing: Mutex::new(vec!["123".into()]),
            ..Default::default()
        });
        let mut p = pipeline(chat.clone(), FakeStore::default(), settings())
            .with_missing_channel_recheck(Duration::ZERO);
        assert_eq!(
            p.deliver(group(vec![envelope(1, 5, "!00000001")])).await,
            DeliveryOutcome::Skipped(SkipReason::MissingChannel)
        );

        chat.missing.lock().unwrap().clear();
        assert_eq!(
            p.deliver(group(vec![envelope(2, 5, "!00000001")])).await,
            DeliveryOutcome::Delivered { action: Action::Send, stripped: false }
        );
        // Present channels are never looked up again.
        p.deliver(group(vec![envelope(3, 5, "!00000001")])).await;
        assert_eq!(*chat.lookups.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn cross_mesh_filters_to_self_and_peers() {
        let chat = Arc::new(FakeChat::default());
        let mut p = pipeline(
            chat.clone(),
            FakeStore::default(),
            DeliverySettings {
                cross_mesh_peers: vec!["sac".into()],
                ..settings()
            },
        );
        let tagged = |gw: &str, mesh: &str| {
            let mut e = envelope(1, 5, gw);
            e.mesh_id = Some(mesh.to_string());
            e
        };

        assert_eq!(
            p.deliver(group(vec![tagged("!00000001", "sac")])).await,
            DeliveryOutcome::Skipped(SkipReason::NoLocalEnvelope)
        );
        let outcome = p
            .deliver(group(vec![
                tagged("!00000001", "sac"),
                tagged("!00000002", "bay"),
                tagged("!00000003", "la"),
            ]))
            .await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { action: Action::Send, stripped: false });
    }

    #[tokio::test]
    async fn position_packets_render_summary() {
        let chat = Arc::new(FakeChat::default());
        let mut p = pipeline(chat.clone(), FakeStore::default(), settings());
        let pos = proto::Position {
            latitude_i: Some(377_749_000),
            longitude_i: Some(-1_224_194_000),
            time: 1_700_000_000,
            ..Default::default()
        };
        let mut e = envelope(8, 5, "!00000001");
        e.packet.payload = PacketPayload::Decoded(DecodedData {
            portnum: PortNum::PositionApp as i32,
            payload: Bytes::from(prost::Message::encode_to_vec(&pos)),
            reply_id: None,
        });
        p.deliver(group(vec![e])).await;
        assert!(chat.calls()[0].1.starts_with("Time: "));
    }

    #[test]
    fn heartbeat_filter() {
        assert!(is_heartbeat("seq 6034"));
        assert!(!is_heartbeat("seq "));
        assert!(!is_heartbeat("seq 12a"));
        assert!(!is_heartbeat("sequence 1"));
        assert!(!is_heartbeat("seq 1\n"));
    }
}
