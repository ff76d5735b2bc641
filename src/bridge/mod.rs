//! # Bridge Runtime
//!
//! Wires configuration, storage and a chat client into running deployments.
//!
//! - [`ingest`] decides which broker messages become packet groups
//! - [`deployment`] runs the ingestion/delivery actor pair
//! - [`start_all`] starts every configured deployment concurrently and keeps
//!   whichever succeed
//!
//! The broker connection itself lives outside the library: anything that can
//! produce `(topic, payload)` pairs feeds a [`DeploymentHandle`].

pub mod deployment;
pub mod ingest;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::task::{JoinHandle, JoinSet};

use crate::aggregate::{shared_cross_mesh, SharedCrossMesh};
use crate::config::{BridgeConfig, MeshConfig};
use crate::delivery::{ChatClient, DeliveryPipeline, DeliverySettings};
use crate::logutil::MeshLogger;
use crate::storage::{NodeStore, SledNodeStore};

pub use deployment::{spawn_deployment, DeploymentHandle, DeploymentOptions, DRAIN_INTERVAL};
pub use ingest::{Admission, DropReason, InboundMessage, IngestSettings, Ingestor};

/// Produces the chat client for one deployment (each has its own token).
pub type ChatFactory = Arc<dyn Fn(&MeshConfig) -> Result<Arc<dyn ChatClient>> + Send + Sync>;

pub struct RunningDeployment {
    pub handle: DeploymentHandle,
    pub task: JoinHandle<()>,
}

impl RunningDeployment {
    pub fn mesh_id(&self) -> &str {
        self.handle.mesh_id()
    }

    /// Final drain, then wait for both tasks.
    pub async fn stop(self) {
        self.handle.shutdown().await;
        let _ = self.task.await;
    }
}

/// Shared state for every deployment of one process.
#[derive(Clone)]
pub struct Services {
    pub db: sled::Db,
    pub chat: ChatFactory,
    pub cross_mesh: SharedCrossMesh,
}

impl Services {
    pub fn new(db: sled::Db, chat: ChatFactory) -> Self {
        Self {
            db,
            chat,
            cross_mesh: shared_cross_mesh(),
        }
    }

    /// Every deployment shares one chat client.
    pub fn with_chat(db: sled::Db, chat: Arc<dyn ChatClient>) -> Self {
        let factory: ChatFactory =
            Arc::new(move |_: &MeshConfig| -> Result<Arc<dyn ChatClient>> { Ok(chat.clone()) });
        Self::new(db, factory)
    }
}

/// Build and spawn one deployment.
pub async fn start_deployment(
    config: &BridgeConfig,
    mesh: &MeshConfig,
    services: &Services,
) -> Result<RunningDeployment> {
    let log = MeshLogger::new(mesh.id.clone());
    let router = mesh
        .router()
        .with_context(|| format!("routing rules for mesh '{}'", mesh.id))?;
    let keyring = Arc::new(config.keyring()?);
    let chat = (services.chat)(mesh)?;
    let store: Arc<dyn NodeStore> = Arc::new(SledNodeStore::new(services.db.clone(), &mesh.id));

    let ingestor = Ingestor::new(
        IngestSettings {
            topics: mesh.topic_patterns(),
            broker_url: mesh.mqtt.broker_url.clone(),
            node_info_updates: config.node_info_updates(mesh),
        },
        keyring,
        store.clone(),
        log.clone(),
    );
    let pipeline = DeliveryPipeline::new(
        chat,
        store,
        router,
        DeliverySettings {
            mesh_id: mesh.id.clone(),
            mesh_view_base_url: config.mesh_view_base_url(mesh),
            production: config.is_production(),
            cross_mesh_peers: mesh.cross_mesh_peers.clone(),
        },
    );
    let options = DeploymentOptions {
        cross_mesh: mesh
            .cross_mesh_enabled()
            .then(|| services.cross_mesh.clone()),
        ..Default::default()
    };

    log.info(format_args!(
        "Starting deployment '{}' ({} topic(s), {} routing rule(s){})",
        mesh.display_name(),
        mesh.mqtt.topics.len(),
        mesh.routing.channel_regex.len(),
        if mesh.cross_mesh_enabled() { ", cross-mesh" } else { "" }
    ));
    let (handle, task) = spawn_deployment(ingestor, pipeline, log, options);
    Ok(RunningDeployment { handle, task })
}

/// Start every deployment concurrently. Failures are logged with the
/// deployment id; the rest keep running. Results follow config order.
pub async fn start_all(config: Arc<BridgeConfig>, services: Services) -> Vec<RunningDeployment> {
    let mut set = JoinSet::new();
    for (index, mesh) in config.meshes.iter().enumerate() {
        let config = config.clone();
        let services = services.clone();
        let mesh = mesh.clone();
        set.spawn(async move {
            let started = start_deployment(&config, &mesh, &services).await;
            (index, mesh.id, started)
        });
    }

    let mut running = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, _, Ok(deployment))) => running.push((index, deployment)),
            Ok((_, mesh_id, Err(e))) => {
                log::error!("[mesh:{}] Failed to start runtime: {:#}", mesh_id, e);
            }
            Err(e) => log::error!("Deployment startup task failed: {}", e),
        }
    }
    running.sort_by_key(|(index, _)| *index);
    running.into_iter().map(|(_, d)| d).collect()
}

/// Handle for `mesh_id`, or an error naming the configured ids.
pub fn find_deployment<'a>(running: &'a [RunningDeployment], mesh_id: &str) -> Result<&'a RunningDeployment> {
    running.iter().find(|d| d.mesh_id() == mesh_id).ok_or_else(|| {
        let ids: Vec<&str> = running.iter().map(RunningDeployment::mesh_id).collect();
        anyhow!("no running deployment '{}' (running: {})", mesh_id, ids.join(", "))
    })
}
