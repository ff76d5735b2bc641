//! The per-deployment actor.
//!
//! ```text
//! inbound ──► ingestion task ──(mpsc DeliveryGroup)──► delivery task ──► chat
//!               │ 5 s tick / Drain
//!               └─ (cross mode) shared CrossMeshAggregator
//! ```
//!
//! The ingestion task owns the [`Ingestor`] and never awaits a chat call; the
//! delivery task owns the [`DeliveryPipeline`] and handles groups strictly in
//! the order they were drained.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::ingest::{InboundMessage, Ingestor};
use crate::aggregate::{lock_cross_mesh, SharedCrossMesh};
use crate::delivery::{DeliveryGroup, DeliveryPipeline};
use crate::logutil::MeshLogger;

pub const DRAIN_INTERVAL: Duration = Duration::from_secs(5);
const INBOUND_QUEUE: usize = 1024;

pub enum Control {
    /// Drain now; replies with the number of groups handed to delivery.
    Drain(oneshot::Sender<usize>),
    /// Final drain, wait for delivery to finish, then stop.
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone, Debug)]
pub struct DeploymentHandle {
    mesh_id: String,
    inbound: mpsc::Sender<InboundMessage>,
    control: mpsc::UnboundedSender<Control>,
}

impl DeploymentHandle {
    pub fn mesh_id(&self) -> &str {
        &self.mesh_id
    }

    /// Queue one broker message. False once the deployment has stopped.
    pub async fn publish(&self, message: InboundMessage) -> bool {
        self.inbound.send(message).await.is_ok()
    }

    pub async fn drain(&self) -> Option<usize> {
        let (tx, rx) = oneshot::channel();
        self.control.send(Control::Drain(tx)).ok()?;
        rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.control.send(Control::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

pub struct DeploymentOptions {
    pub tick: Duration,
    /// Present when this deployment merges relays with its peers.
    pub cross_mesh: Option<SharedCrossMesh>,
}

impl Default for DeploymentOptions {
    fn default() -> Self {
        Self {
            tick: DRAIN_INTERVAL,
            cross_mesh: None,
        }
    }
}

struct IngestionTask {
    ingestor: Ingestor,
    cross_mesh: Option<SharedCrossMesh>,
    groups: mpsc::UnboundedSender<DeliveryGroup>,
    log: MeshLogger,
}

impl IngestionTask {
    fn drain(&mut self) -> usize {
        let drained = self.ingestor.drain();
        let ready: Vec<DeliveryGroup> = match &self.cross_mesh {
            None => drained.into_iter().map(DeliveryGroup::from).collect(),
            Some(shared) => {
                let mesh_id = self.log.mesh_id();
                let mut cross = lock_cross_mesh(shared);
                for group in &drained {
                    cross.merge_group(group, mesh_id);
                }
                cross
                    .drain(mesh_id)
                    .into_iter()
                    .map(DeliveryGroup::from)
                    .collect()
            }
        };
        let count = ready.len();
        if count > 0 {
            self.log
                .debug(format_args!("Drained {} packet group(s) for delivery", count));
        }
        for group in ready {
            if self.groups.send(group).is_err() {
                self.log.error(format_args!("Delivery task stopped; dropping drained groups"));
                break;
            }
        }
        count
    }
}

/// Spawn the ingestion and delivery tasks for one deployment.
pub fn spawn_deployment(
    ingestor: Ingestor,
    mut pipeline: DeliveryPipeline,
    log: MeshLogger,
    options: DeploymentOptions,
) -> (DeploymentHandle, JoinHandle<()>) {
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<InboundMessage>(INBOUND_QUEUE);
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Control>();
    let (group_tx, mut group_rx) = mpsc::unbounded_channel::<DeliveryGroup>();

    let handle = DeploymentHandle {
        mesh_id: log.mesh_id().to_string(),
        inbound: inbound_tx,
        control: control_tx,
    };

    let delivery = tokio::spawn(async move {
        while let Some(group) = group_rx.recv().await {
            pipeline.deliver(group).await;
        }
    });

    let mut task = IngestionTask {
        ingestor,
        cross_mesh: options.cross_mesh,
        groups: group_tx,
        log,
    };
    let tick = options.tick;

    let join = tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut done: Option<oneshot::Sender<()>> = None;
        loop {
            tokio::select! {
                msg = inbound_rx.recv() => match msg {
                    Some(msg) => {
                        task.ingestor.ingest(&msg).await;
                    }
                    None => break,
                },
                _ = interval.tick() => {
                    task.drain();
                }
                Some(cmd) = control_rx.recv() => match cmd {
                    Control::Drain(reply) => {
                        let _ = reply.send(task.drain());
                    }
                    Control::Shutdown(reply) => {
                        done = Some(reply);
                        break;
                    }
                },
            }
        }

        // Anything already queued is ingested before the final drain.
        inbound_rx.close();
        while let Some(msg) = inbound_rx.recv().await {
            task.ingestor.ingest(&msg).await;
        }
        task.drain();
        task.log.info(format_args!("Deployment stopping"));
        let IngestionTask { groups, log, .. } = task;
        drop(groups);
        if let Err(e) = delivery.await {
            log.error(format_args!("Delivery task failed: {}", e));
        }
        if let Some(reply) = done {
            let _ = reply.send(());
        }
    });

    (handle, join)
}
