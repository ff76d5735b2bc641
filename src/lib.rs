//! # Meshrelay - Meshtastic MQTT to chat bridge
//!
//! Meshrelay listens to the MQTT uplink of one or more Meshtastic mesh
//! deployments and mirrors public text traffic (plus position reports of
//! tracked nodes) into chat channels. Every radio packet is heard by many
//! gateways; the bridge posts each packet once and keeps editing that message
//! as further relay reports arrive, so the chat shows who heard what and over
//! how many hops.
//!
//! ## Features
//!
//! - **Topic filtering**: MQTT-style `+`/`#` subscriptions with legacy prefix patterns.
//! - **Channel decryption**: AES-128-CTR trial decryption over a configurable keyring.
//! - **Relay aggregation**: per-packet grouping with an hour of retention, optional
//!   merging across deployments.
//! - **Regex routing**: ordered channel-label rules per deployment.
//! - **Send, reply, edit**: replies thread onto earlier posts; a size rejection is
//!   retried once without links.
//! - **Node directory**: sled-backed node info, ownership links and tracker/balloon/ban
//!   designations.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshrelay::bridge::{start_all, InboundMessage, Services};
//! use meshrelay::delivery::{ChatClient, ConsoleChat};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Arc::new(meshrelay::config::load(None).await?);
//!     let db = meshrelay::storage::open_db(&config.store_path)?;
//!     let chat: Arc<dyn ChatClient> = Arc::new(ConsoleChat::new());
//!     let services = Services::with_chat(db, chat);
//!
//!     let running = start_all(config, services).await;
//!     for deployment in &running {
//!         deployment
//!             .handle
//!             .publish(InboundMessage::new("msh/US/2/e/LongFast/!a1b2c3d4", Vec::new()))
//!             .await;
//!     }
//!     for deployment in running {
//!         deployment.stop().await;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`meshtastic`] - packet model, topic matching, decryption, node ids
//! - [`aggregate`] - packet groups, cross-deployment merging, bounded FIFO cache
//! - [`routing`] - channel label to chat destination rules
//! - [`delivery`] - rendering and the send/reply/edit pipeline
//! - [`storage`] - node directory trait and its sled implementation
//! - [`bridge`] - ingestion and the per-deployment actors
//! - [`config`] - configuration loading and validation
//! - [`logutil`], [`metrics`] - per-deployment logging and process counters
//! - [`protobuf`] - generated wire types
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  (topic, bytes)  ┌──────────────┐  groups  ┌──────────────┐
//! │  MQTT feed   │ ───────────────► │  Ingestion   │ ───────► │   Delivery   │ ──► chat
//! └──────────────┘                  │  (5 s drain) │          │  (in order)  │
//!                                   └──────┬───────┘          └──────────────┘
//!                                          │ cross mode
//!                                   ┌──────▼───────┐
//!                                   │  CrossMesh   │  shared by all deployments
//!                                   └──────────────┘
//! ```

pub mod aggregate;
pub mod bridge;
pub mod config;
pub mod delivery;
pub mod logutil;
pub mod meshtastic;
pub mod metrics;
pub mod protobuf;
pub mod routing;
pub mod storage;
