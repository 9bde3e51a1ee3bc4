//! Server-level room registry.
//!
//! The registry owns the map of live rooms, builds a room's media
//! resources on demand (one router and audio level observer per engine
//! worker), and removes entries once a room's actor task has finished.
//! It also owns the server-wide peer routing directory the balancer
//! reads.

use crate::access::RoomPolicy;
use crate::config::Config;
use crate::errors::RoomError;
use crate::room::{RoomContext, RoomHandle, RoomStatus};
use crate::turn::TurnFetcher;
use common::types::{PeerId, RoomId, RouterId};
use dashmap::DashMap;
use media_engine::{AudioLevelObserverConfig, MediaEngine};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 64;

/// How often finished room tasks are reaped.
const ROOM_REAP_INTERVAL: Duration = Duration::from_secs(2);

/// Server-wide peer → router assignments, read by the balancer.
///
/// Rooms write their own peers' assignments; reads are snapshots and
/// tolerate staleness.
#[derive(Default)]
pub struct PeerDirectory {
    assignments: DashMap<PeerId, RouterId>,
}

impl PeerDirectory {
    /// Record a peer's router assignment.
    pub fn assign(&self, peer_id: PeerId, router_id: RouterId) {
        self.assignments.insert(peer_id, router_id);
    }

    /// Remove a peer's assignment.
    pub fn remove(&self, peer_id: &PeerId) {
        self.assignments.remove(peer_id);
    }

    /// Snapshot of every assignment, one entry per peer.
    #[must_use]
    pub fn assignments(&self) -> Vec<RouterId> {
        self.assignments.iter().map(|entry| *entry.value()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

/// Messages sent to the `RegistryActor`.
enum RegistryMessage {
    GetOrCreate {
        room_id: RoomId,
        respond_to: oneshot::Sender<Result<RoomHandle, RoomError>>,
    },
    Status {
        respond_to: oneshot::Sender<Vec<RoomStatus>>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle to the room registry.
#[derive(Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RegistryHandle {
    /// Get the room with this id, creating it if needed.
    pub async fn get_or_create(&self, room_id: RoomId) -> Result<RoomHandle, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetOrCreate {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|_| RoomError::internal("registry stopped"))?;
        rx.await.map_err(|_| RoomError::internal("registry stopped"))?
    }

    /// Status of every live room.
    pub async fn status(&self) -> Result<Vec<RoomStatus>, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Status { respond_to: tx })
            .await
            .map_err(|_| RoomError::internal("registry stopped"))?;
        rx.await.map_err(|_| RoomError::internal("registry stopped"))
    }

    /// Close every room and stop the registry.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(RegistryMessage::Shutdown { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
        self.cancel_token.cancel();
    }
}

struct ManagedRoom {
    handle: RoomHandle,
    task_handle: JoinHandle<()>,
}

/// The registry actor.
pub struct RegistryActor {
    receiver: mpsc::Receiver<RegistryMessage>,
    cancel_token: CancellationToken,
    config: Arc<Config>,
    policy: Arc<RoomPolicy>,
    engine: Arc<dyn MediaEngine>,
    directory: Arc<PeerDirectory>,
    turn: Arc<TurnFetcher>,
    rooms: HashMap<RoomId, ManagedRoom>,
}

impl RegistryActor {
    /// Spawn the registry.
    pub fn spawn(
        config: Arc<Config>,
        engine: Arc<dyn MediaEngine>,
        cancel_token: CancellationToken,
    ) -> (RegistryHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);

        let policy = Arc::new(RoomPolicy::from_overrides(&config.policy_overrides));
        let turn = Arc::new(TurnFetcher::from_config(&config));

        let actor = Self {
            receiver,
            cancel_token: cancel_token.clone(),
            config,
            policy,
            engine,
            directory: Arc::new(PeerDirectory::default()),
            turn,
            rooms: HashMap::new(),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RegistryHandle {
            sender,
            cancel_token,
        };

        (handle, task_handle)
    }

    async fn run(mut self) {
        info!(target: "registry", "room registry started");

        let mut reap = tokio::time::interval(ROOM_REAP_INTERVAL);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    self.shutdown_rooms().await;
                    break;
                }

                _ = reap.tick() => {
                    self.reap_closed_rooms();
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message).await,
                        None => break,
                    }
                }
            }
        }

        info!(target: "registry", "room registry stopped");
    }

    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::GetOrCreate {
                room_id,
                respond_to,
            } => {
                let result = self.get_or_create(room_id).await;
                let _ = respond_to.send(result);
            }
            RegistryMessage::Status { respond_to } => {
                let mut statuses = Vec::with_capacity(self.rooms.len());
                for managed in self.rooms.values() {
                    if let Ok(status) = managed.handle.status().await {
                        statuses.push(status);
                    }
                }
                let _ = respond_to.send(statuses);
            }
            RegistryMessage::Shutdown { respond_to } => {
                self.shutdown_rooms().await;
                let _ = respond_to.send(());
                self.cancel_token.cancel();
            }
        }
    }

    async fn get_or_create(&mut self, room_id: RoomId) -> Result<RoomHandle, RoomError> {
        self.reap_closed_rooms();

        if let Some(managed) = self.rooms.get(&room_id) {
            if !managed.handle.is_closed() {
                return Ok(managed.handle.clone());
            }
        }

        info!(target: "registry", room_id = %room_id, "creating room");

        let context = self.build_room_context().await?;
        let room_token = self.cancel_token.child_token();
        let (handle, task_handle) =
            crate::room::RoomActor::spawn(room_id.clone(), context, room_token);

        self.rooms.insert(
            room_id,
            ManagedRoom {
                handle: handle.clone(),
                task_handle,
            },
        );

        Ok(handle)
    }

    /// One router and one audio level observer per engine worker.
    async fn build_room_context(&self) -> Result<RoomContext, RoomError> {
        let mut routers = HashMap::new();
        let mut audio_observers = HashMap::new();
        let mut audio_events = Vec::new();

        for worker_id in self.engine.worker_ids() {
            let router = self
                .engine
                .create_router(worker_id, &self.config.router_media_codecs)
                .await
                .map_err(|err| {
                    error!(target: "registry", worker_id = %worker_id, error = %err, "router creation failed");
                    RoomError::from(err)
                })?;

            let bundle = router
                .create_audio_level_observer(AudioLevelObserverConfig::default())
                .await?;

            audio_events.push((router.id(), bundle.events));
            audio_observers.insert(router.id(), bundle.observer);
            routers.insert(router.id(), router);
        }

        Ok(RoomContext {
            config: Arc::clone(&self.config),
            policy: Arc::clone(&self.policy),
            engine: Arc::clone(&self.engine),
            routers,
            audio_observers,
            audio_events,
            directory: Arc::clone(&self.directory),
            turn: Arc::clone(&self.turn),
        })
    }

    /// Drop rooms whose actor task has finished.
    fn reap_closed_rooms(&mut self) {
        let finished: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(room_id, _)| room_id.clone())
            .collect();

        for room_id in finished {
            debug!(target: "registry", room_id = %room_id, "room closed, dropping");
            self.rooms.remove(&room_id);
        }
    }

    async fn shutdown_rooms(&mut self) {
        info!(target: "registry", rooms = self.rooms.len(), "closing all rooms");
        for (room_id, managed) in self.rooms.drain() {
            if managed.handle.close().await.is_err() {
                managed.handle.cancel();
            }
            match tokio::time::timeout(Duration::from_secs(5), managed.task_handle).await {
                Ok(Ok(())) => {}
                Ok(Err(join_error)) => {
                    warn!(
                        target: "registry",
                        room_id = %room_id,
                        error = ?join_error,
                        "room task failed during shutdown"
                    );
                }
                Err(_) => {
                    warn!(target: "registry", room_id = %room_id, "room shutdown timed out");
                    managed.handle.cancel();
                }
            }
        }
    }
}
