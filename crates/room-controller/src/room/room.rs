//! The per-room actor.
//!
//! Each `RoomActor`:
//! - Owns all state for one room (peers, lobby, routers, history, lock)
//! - Runs every mutating operation on one single-threaded timeline
//! - Funnels join side effects through the room's [`JoinQueue`]
//! - Dispatches the signaling request protocol exhaustively
//! - Closes itself after a self-destruct countdown once deserted
//!
//! Media engine events and queued join steps re-enter through the
//! mailbox, so nothing mutates room state concurrently.

use crate::access::policy::{Access, Permission};
use crate::access::roles::{self, Role};
use crate::config::Config;
use crate::access::RoomPolicy;
use crate::errors::RoomError;
use crate::registry::PeerDirectory;
use crate::room::audio::{ActiveSpeakerTracker, AudioLevelState};
use crate::room::balancer::{self, LoadSnapshot, WorkerView};
use crate::room::join_queue::JoinQueue;
use crate::room::lobby::Lobby;
use crate::room::peer::Peer;
use crate::signaling::protocol::{ClientRequest, Notification, ReplyError};
use crate::signaling::socket::PeerSocket;
use crate::turn::TurnFetcher;
use chrono::{DateTime, Utc};
use common::token::RoomTokenSigner;
use common::types::{ConsumerId, PeerId, ProducerId, RoomId, RouterId};
use media_engine::{
    AudioLevelEvent, AudioLevelObserver, ConsumerEvent, MediaEngine, ProducerEvent, Router,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 256;

/// How often pending self-destruct deadlines are checked.
const SELF_DESTRUCT_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// An arriving peer, as handed over by the signaling edge.
pub struct NewPeer {
    pub peer_id: PeerId,
    pub display_name: String,
    pub picture: Option<String>,
    pub from: Option<String>,
    /// Roles established by the signaling edge (authentication).
    pub roles: Vec<Role>,
    /// Join token presented by a returning peer.
    pub token: Option<String>,
    pub socket: PeerSocket,
    pub client_ip: Option<IpAddr>,
}

/// Where a request reply goes.
pub enum RequestReply {
    /// Reply onto the peer's socket, correlated by the wire request id.
    /// Keeps reply/notification ordering on the connection.
    Socket { request_id: u64 },
    /// Reply to a programmatic caller.
    Channel(oneshot::Sender<Result<Value, RoomError>>),
}

impl RequestReply {
    fn deliver(self, socket: Option<&PeerSocket>, result: Result<Value, RoomError>) {
        match self {
            RequestReply::Socket { request_id } => {
                if let Some(socket) = socket {
                    let wire = result.map_err(|error| {
                        serde_json::to_value(ReplyError::from(&error)).unwrap_or(Value::Null)
                    });
                    socket.reply(request_id, wire);
                }
            }
            RequestReply::Channel(sender) => {
                let _ = sender.send(result);
            }
        }
    }
}

/// Media engine events folded into the room timeline.
#[derive(Debug)]
pub enum MediaEvent {
    Consumer {
        peer_id: PeerId,
        consumer_id: ConsumerId,
        event: ConsumerEvent,
    },
    Producer {
        peer_id: PeerId,
        producer_id: ProducerId,
        event: ProducerEvent,
    },
    AudioLevel {
        router_id: RouterId,
        event: AudioLevelEvent,
    },
}

/// Messages sent to a `RoomActor`.
pub enum RoomMessage {
    /// A peer arrived at the room door; run the admission decision.
    PeerArrived { peer: NewPeer },

    /// A signaling request from a peer.
    Request {
        peer_id: PeerId,
        request: ClientRequest,
        reply: RequestReply,
    },

    /// A peer's connection went away.
    PeerDisconnected { peer_id: PeerId },

    /// The signaling edge re-established a peer's role set.
    PeerRolesUpdated { peer_id: PeerId, roles: Vec<Role> },

    /// One queued join step; only ever in flight once at a time.
    ExecuteJoin {
        peer_id: PeerId,
        returning: bool,
        client_ip: Option<IpAddr>,
        done: oneshot::Sender<Result<(), RoomError>>,
    },

    /// A media engine event relayed from an event stream.
    Media(MediaEvent),

    /// Current room status (for health and the registry).
    GetStatus {
        respond_to: oneshot::Sender<RoomStatus>,
    },

    /// The join token minted for a peer, if any.
    GetToken {
        peer_id: PeerId,
        respond_to: oneshot::Sender<Option<String>>,
    },

    /// Close the room.
    Close,
}

/// Current status of a room.
#[derive(Debug, Clone)]
pub struct RoomStatus {
    pub room_id: RoomId,
    pub peer_count: usize,
    pub lobby_count: usize,
    pub locked: bool,
    pub closed: bool,
    pub created_at: DateTime<Utc>,
}

/// Handle to a `RoomActor`.
#[derive(Clone)]
pub struct RoomHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: RoomId,
}

impl RoomHandle {
    /// Get the room ID.
    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Hand an arriving peer to the admission state machine.
    pub async fn handle_peer(&self, peer: NewPeer) -> Result<(), RoomError> {
        self.send(RoomMessage::PeerArrived { peer }).await
    }

    /// Submit a request whose reply goes back over the peer's socket.
    pub async fn submit_request(
        &self,
        peer_id: PeerId,
        request_id: u64,
        request: ClientRequest,
    ) -> Result<(), RoomError> {
        self.send(RoomMessage::Request {
            peer_id,
            request,
            reply: RequestReply::Socket { request_id },
        })
        .await
    }

    /// Submit a request and await its result.
    pub async fn request(
        &self,
        peer_id: PeerId,
        request: ClientRequest,
    ) -> Result<Value, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomMessage::Request {
            peer_id,
            request,
            reply: RequestReply::Channel(tx),
        })
        .await?;
        rx.await.map_err(|_| RoomError::RoomClosed)?
    }

    /// Notify the room of a peer disconnect.
    pub async fn peer_disconnected(&self, peer_id: PeerId) -> Result<(), RoomError> {
        self.send(RoomMessage::PeerDisconnected { peer_id }).await
    }

    /// Replace a peer's role set (identity refresh from the edge).
    pub async fn peer_roles_updated(
        &self,
        peer_id: PeerId,
        roles: Vec<Role>,
    ) -> Result<(), RoomError> {
        self.send(RoomMessage::PeerRolesUpdated { peer_id, roles })
            .await
    }

    /// Get current room status.
    pub async fn status(&self) -> Result<RoomStatus, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomMessage::GetStatus { respond_to: tx }).await?;
        rx.await.map_err(|_| RoomError::RoomClosed)
    }

    /// The join token minted for a peer on its first join, used by the
    /// signaling edge to hand out rejoin credentials.
    pub async fn token(&self, peer_id: PeerId) -> Result<Option<String>, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomMessage::GetToken {
            peer_id,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| RoomError::RoomClosed)
    }

    /// Close the room.
    pub async fn close(&self) -> Result<(), RoomError> {
        self.send(RoomMessage::Close).await
    }

    /// Whether the room actor has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Cancel the room actor (hard stop, used by the registry).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    async fn send(&self, message: RoomMessage) -> Result<(), RoomError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| RoomError::RoomClosed)
    }
}

/// Everything a room needs from the outside world.
pub struct RoomContext {
    pub config: Arc<Config>,
    pub policy: Arc<RoomPolicy>,
    pub engine: Arc<dyn MediaEngine>,
    /// This room's routers, one per engine worker.
    pub routers: HashMap<RouterId, Arc<dyn Router>>,
    /// This room's audio level observers, one per router.
    pub audio_observers: HashMap<RouterId, Arc<dyn AudioLevelObserver>>,
    /// Event streams of the audio level observers.
    pub audio_events: Vec<(RouterId, mpsc::UnboundedReceiver<AudioLevelEvent>)>,
    /// Server-wide peer routing directory, read by the balancer.
    pub directory: Arc<PeerDirectory>,
    pub turn: Arc<TurnFetcher>,
}

/// The `RoomActor` implementation.
pub(crate) struct RoomActor {
    pub(super) room_id: RoomId,
    pub(super) receiver: mpsc::Receiver<RoomMessage>,
    pub(super) self_sender: mpsc::Sender<RoomMessage>,
    pub(super) cancel_token: CancellationToken,

    pub(super) config: Arc<Config>,
    pub(super) policy: Arc<RoomPolicy>,
    pub(super) engine: Arc<dyn MediaEngine>,
    pub(super) routers: HashMap<RouterId, Arc<dyn Router>>,
    pub(super) audio_observers: HashMap<RouterId, Arc<dyn AudioLevelObserver>>,
    pub(super) directory: Arc<PeerDirectory>,
    pub(super) turn: Arc<TurnFetcher>,

    pub(super) closed: bool,
    pub(super) locked: bool,
    pub(super) access_code: String,
    pub(super) join_by_access_code: bool,
    pub(super) chat_history: Vec<Value>,
    pub(super) file_history: Vec<Value>,
    pub(super) last_n: Vec<PeerId>,
    /// Peers admitted but not yet registered by their queued join step.
    pub(super) arriving: HashMap<PeerId, Peer>,
    pub(super) peers: HashMap<PeerId, Peer>,
    pub(super) lobby: Lobby,
    pub(super) join_queue: JoinQueue,
    pub(super) token_signer: RoomTokenSigner,
    pub(super) tokens: HashMap<PeerId, String>,
    pub(super) piped_routers: HashSet<RouterId>,
    pub(super) audio_levels: HashMap<RouterId, AudioLevelState>,
    pub(super) speaker_tracker: ActiveSpeakerTracker,
    pub(super) self_destruct_at: Option<Instant>,
    pub(super) created_at: DateTime<Utc>,
    pub(super) closed_at: Option<DateTime<Utc>>,
}

impl RoomActor {
    /// Spawn a new room actor.
    ///
    /// Returns a handle and the task join handle; the registry watches
    /// the task to learn when the room has closed.
    pub(crate) fn spawn(
        room_id: RoomId,
        context: RoomContext,
        cancel_token: CancellationToken,
    ) -> (RoomHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);

        let RoomContext {
            config,
            policy,
            engine,
            routers,
            audio_observers,
            audio_events,
            directory,
            turn,
        } = context;

        for (router_id, events) in audio_events {
            spawn_audio_relay(router_id, events, sender.clone(), cancel_token.child_token());
        }

        let locked = config.room_starts_locked(room_id.as_str());
        let audio_levels = routers
            .keys()
            .map(|router_id| (*router_id, AudioLevelState::default()))
            .collect();

        let actor = Self {
            join_queue: JoinQueue::new(room_id.as_str()),
            room_id: room_id.clone(),
            receiver,
            self_sender: sender.clone(),
            cancel_token: cancel_token.clone(),
            config,
            policy,
            engine,
            routers,
            audio_observers,
            directory,
            turn,
            closed: false,
            locked,
            access_code: String::new(),
            join_by_access_code: true,
            chat_history: Vec::new(),
            file_history: Vec::new(),
            last_n: Vec::new(),
            arriving: HashMap::new(),
            peers: HashMap::new(),
            lobby: Lobby::default(),
            token_signer: RoomTokenSigner::generate(),
            tokens: HashMap::new(),
            piped_routers: HashSet::new(),
            audio_levels,
            speaker_tracker: ActiveSpeakerTracker::default(),
            self_destruct_at: None,
            created_at: Utc::now(),
            closed_at: None,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomHandle {
            sender,
            cancel_token,
            room_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "room.actor", fields(room_id = %self.room_id))]
    async fn run(mut self) {
        info!(target: "room.actor", room_id = %self.room_id, "room opened");

        let mut destruct_check = tokio::time::interval(SELF_DESTRUCT_CHECK_INTERVAL);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    self.close_room();
                    break;
                }

                _ = destruct_check.tick() => {
                    self.check_self_destruct();
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message).await,
                        None => break,
                    }
                }
            }

            if self.closed {
                break;
            }
        }

        if !self.closed {
            self.close_room();
        }

        info!(
            target: "room.actor",
            room_id = %self.room_id,
            closed_at = ?self.closed_at,
            "room actor stopped"
        );
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::PeerArrived { peer } => self.handle_peer_arrived(peer),

            RoomMessage::Request {
                peer_id,
                request,
                reply,
            } => self.handle_request(peer_id, request, reply).await,

            RoomMessage::PeerDisconnected { peer_id } => self.handle_peer_disconnected(&peer_id),

            RoomMessage::PeerRolesUpdated { peer_id, roles } => {
                self.handle_peer_roles_updated(&peer_id, roles);
            }

            RoomMessage::ExecuteJoin {
                peer_id,
                returning,
                client_ip,
                done,
            } => {
                let result = self.execute_join(&peer_id, returning, client_ip).await;
                let _ = done.send(result);
            }

            RoomMessage::Media(event) => self.handle_media_event(event),

            RoomMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(RoomStatus {
                    room_id: self.room_id.clone(),
                    peer_count: self.peers.len(),
                    lobby_count: self.lobby.len(),
                    locked: self.locked,
                    closed: self.closed,
                    created_at: self.created_at,
                });
            }

            RoomMessage::GetToken {
                peer_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.tokens.get(&peer_id).cloned());
            }

            RoomMessage::Close => self.close_room(),
        }
    }

    // ------------------------------------------------------------------
    // Admission & lobby
    // ------------------------------------------------------------------

    /// Run the admission decision for an arriving peer.
    ///
    /// First match wins: returning token, lock bypass, capacity,
    /// room lock, host activation, lobby bypass, park.
    fn handle_peer_arrived(&mut self, new_peer: NewPeer) {
        if self.closed {
            return;
        }

        let NewPeer {
            peer_id,
            display_name,
            picture,
            from,
            roles: arrival_roles,
            token,
            socket,
            client_ip,
        } = new_peer;

        info!(
            target: "room.actor",
            room_id = %self.room_id,
            peer_id = %peer_id,
            "peer arrived"
        );

        // A lingering entry with the same id is a stale connection;
        // close it before admitting the new one.
        if self.peers.contains_key(&peer_id)
            || self.arriving.contains_key(&peer_id)
            || self.lobby.contains(&peer_id)
        {
            warn!(
                target: "room.actor",
                room_id = %self.room_id,
                peer_id = %peer_id,
                "peer id already present, closing stale entry"
            );
            self.handle_peer_disconnected(&peer_id);
        }

        let returning = token
            .as_deref()
            .is_some_and(|token| self.verify_peer(&peer_id, token));

        let mut peer = Peer::new(peer_id, display_name, socket, arrival_roles);
        peer.picture = picture;
        peer.from = from;

        if returning {
            self.admit(peer, true, client_ip);
        } else if self.policy.grants_access(peer.roles(), Access::BypassRoomLock) {
            self.admit(peer, false, client_ip);
        } else if self.over_room_limit() {
            peer.socket.notify(&Notification::OverRoomLimit);
        } else if self.locked {
            self.park_peer(peer);
        } else if self.config.activate_on_host_join && self.room_empty() {
            let socket = peer.socket.clone();
            self.park_peer(peer);
            socket.notify(&Notification::SignInRequired);
        } else if self.policy.grants_access(peer.roles(), Access::BypassLobby) {
            self.admit(peer, false, client_ip);
        } else {
            self.park_peer(peer);
        }
    }

    /// Whether a presented join token authenticates the peer.
    fn verify_peer(&self, peer_id: &PeerId, token: &str) -> bool {
        let valid =
            self.tokens.get(peer_id).map(String::as_str) == Some(token)
                && self.token_signer.verify(peer_id, token);
        if !valid && self.tokens.contains_key(peer_id) {
            warn!(target: "room.actor", peer_id = %peer_id, "invalid join token");
        }
        valid
    }

    fn over_room_limit(&self) -> bool {
        let Some(limit) = self.config.max_peers_per_room else {
            return false;
        };
        self.peers.len() + self.arriving.len() + self.lobby.len() >= limit as usize
    }

    /// No peer is registered in the room (lobby not counted).
    fn room_empty(&self) -> bool {
        self.peers.is_empty() && self.arriving.is_empty()
    }

    /// Queue the peer's join side effects.
    fn admit(&mut self, peer: Peer, returning: bool, client_ip: Option<IpAddr>) {
        let peer_id = peer.id.clone();
        self.self_destruct_at = None;
        self.arriving.insert(peer_id.clone(), peer);

        let sender = self.self_sender.clone();
        let task_peer_id = peer_id.clone();
        let submitted = self.join_queue.submit(async move {
            let (done_tx, done_rx) = oneshot::channel();
            sender
                .send(RoomMessage::ExecuteJoin {
                    peer_id: task_peer_id,
                    returning,
                    client_ip,
                    done: done_tx,
                })
                .await
                .map_err(|_| RoomError::RoomClosed)?;
            done_rx.await.map_err(|_| RoomError::RoomClosed)?
        });

        if submitted.is_err() {
            warn!(
                target: "room.actor",
                room_id = %self.room_id,
                peer_id = %peer_id,
                "join rejected, queue closed"
            );
            self.arriving.remove(&peer_id);
        }
    }

    /// The queued join step: registration, last-N, router assignment,
    /// token/credentials, ready notification.
    async fn execute_join(
        &mut self,
        peer_id: &PeerId,
        returning: bool,
        client_ip: Option<IpAddr>,
    ) -> Result<(), RoomError> {
        if self.closed {
            return Err(RoomError::RoomClosed);
        }
        let Some(mut peer) = self.arriving.remove(peer_id) else {
            // Peer left while waiting in the queue.
            debug!(target: "room.actor", peer_id = %peer_id, "peer gone before join step");
            return Ok(());
        };

        if !self.last_n.contains(peer_id) {
            self.last_n.push(peer_id.clone());
        }

        match self.assign_router(peer_id).await {
            Some(router_id) => {
                peer.assign_router(router_id);
                self.directory.assign(peer_id.clone(), router_id);
                self.piped_routers.insert(router_id);
            }
            None => {
                warn!(
                    target: "room.actor",
                    room_id = %self.room_id,
                    peer_id = %peer_id,
                    "no router available for peer"
                );
            }
        }

        let socket = peer.socket.clone();
        let peer_roles: Vec<Role> = peer.roles().to_vec();
        self.peers.insert(peer_id.clone(), peer);

        if returning {
            socket.notify(&Notification::RoomBack);
            return Ok(());
        }

        let token = self.token_signer.mint(peer_id);
        self.tokens.insert(peer_id.clone(), token);

        let turn_servers = self.turn.fetch(client_ip).await;
        socket.notify(&Notification::RoomReady { turn_servers });

        if self.config.activate_on_host_join
            && !self.lobby.is_empty()
            && !self.locked
            && self.policy.permits(&peer_roles, Permission::PromotePeer)
        {
            self.promote_all_peers();
        }

        Ok(())
    }

    /// Pick a router from the current load snapshot and pipe existing
    /// producers into it.
    async fn assign_router(&mut self, peer_id: &PeerId) -> Option<RouterId> {
        let snapshot = self.load_snapshot();
        let router_id = balancer::select_router(&snapshot, self.config.router_scale_size)?;

        if let Err(error) = self.pipe_producers_to_router(router_id).await {
            warn!(
                target: "room.balancer",
                room_id = %self.room_id,
                peer_id = %peer_id,
                router_id = %router_id,
                %error,
                "piping producers to selected router failed"
            );
        }

        Some(router_id)
    }

    fn load_snapshot(&self) -> LoadSnapshot {
        let workers = self
            .engine
            .worker_ids()
            .into_iter()
            .map(|worker_id| WorkerView {
                id: worker_id,
                routers: self.engine.worker_routers(worker_id),
            })
            .collect();

        LoadSnapshot {
            workers,
            peer_assignments: self.directory.assignments(),
            room_routers: self.routers.keys().copied().collect(),
            piped_routers: self.piped_routers.clone(),
        }
    }

    fn park_peer(&mut self, peer: Peer) {
        let peer_id = peer.id.clone();
        self.lobby.park(peer);

        let notification = Notification::ParkedPeer { peer_id };
        for socket in self.allowed_sockets(Permission::PromotePeer) {
            socket.notify(&notification);
        }
    }

    /// Promote one parked peer into the room.
    fn promote_one(&mut self, peer_id: &PeerId) {
        let Some(peer) = self.lobby.promote(peer_id) else {
            return;
        };
        info!(target: "room.lobby", room_id = %self.room_id, peer_id = %peer_id, "peer promoted");

        self.admit(peer, false, None);

        let notification = Notification::LobbyPromotedPeer {
            peer_id: peer_id.clone(),
        };
        for socket in self.allowed_sockets(Permission::PromotePeer) {
            socket.notify(&notification);
        }
    }

    fn promote_all_peers(&mut self) {
        let parked: Vec<PeerId> = self
            .lobby
            .peer_list()
            .into_iter()
            .map(|entry| entry.id)
            .collect();
        for peer_id in parked {
            self.promote_one(&peer_id);
        }
    }

    /// A parked peer's roles changed; promote it if bypass rules now
    /// apply. Lock bypass always promotes, lobby bypass only while the
    /// room is unlocked.
    fn handle_peer_roles_updated(&mut self, peer_id: &PeerId, new_roles: Vec<Role>) {
        if self.closed {
            return;
        }

        if let Some(parked) = self.lobby.peer_mut(peer_id) {
            parked.set_roles(new_roles);
            let held = parked.roles().to_vec();

            if self.policy.grants_access(&held, Access::BypassRoomLock)
                || (!self.locked && self.policy.grants_access(&held, Access::BypassLobby))
            {
                self.promote_one(peer_id);
            }
            return;
        }

        // Joined peer: apply the diff and spread role notifications.
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };
        let old_roles: Vec<Role> = peer.roles().to_vec();
        peer.set_roles(new_roles.clone());

        for role in &new_roles {
            if !old_roles.iter().any(|held| held.id == role.id) {
                self.notify_got_role(peer_id, *role);
            }
        }
        for role in old_roles {
            if !new_roles.iter().any(|held| held.id == role.id) {
                self.notify_lost_role(peer_id, role);
            }
        }
    }

    // ------------------------------------------------------------------
    // Peer close & self-destruct
    // ------------------------------------------------------------------

    fn handle_peer_disconnected(&mut self, peer_id: &PeerId) {
        if self.closed {
            return;
        }

        // Parked peers leave through the lobby.
        if let Some(peer) = self.lobby.remove(peer_id) {
            debug!(target: "room.lobby", room_id = %self.room_id, peer_id = %peer_id, "parked peer left");
            peer.socket.close();

            let notification = Notification::LobbyPeerClosed {
                peer_id: peer_id.clone(),
            };
            for socket in self.allowed_sockets(Permission::PromotePeer) {
                socket.notify(&notification);
            }

            // Lobby drained: the room itself may now be deserted.
            if self.lobby.is_empty() && self.room_empty() {
                self.start_self_destruct();
            }
            return;
        }

        if let Some(peer) = self.arriving.remove(peer_id) {
            debug!(target: "room.actor", peer_id = %peer_id, "peer left before joining");
            peer.socket.close();
            return;
        }

        let Some(mut peer) = self.peers.remove(peer_id) else {
            return;
        };

        if peer.joined {
            self.broadcast(
                Some(peer_id),
                &Notification::PeerClosed {
                    peer_id: peer_id.clone(),
                },
            );
        }

        self.last_n.retain(|id| id != peer_id);
        let had_promote_permission = self.policy.permits(peer.roles(), Permission::PromotePeer);

        peer.release_resources();
        peer.socket.close();
        self.directory.remove(peer_id);

        info!(
            target: "room.actor",
            room_id = %self.room_id,
            peer_id = %peer_id,
            remaining_peers = self.peers.len(),
            "peer closed"
        );

        // The last promote-permission holder left while the permission
        // falls open: the broadcast target set changed, re-send the
        // lobby contents to the new holders.
        if had_promote_permission
            && !self.lobby.is_empty()
            && self.policy.fails_open(Permission::PromotePeer)
            && self.count_with_permission(Permission::PromotePeer) == 0
        {
            let lobby_peers = self.lobby.peer_list();
            let notification = Notification::ParkedPeers { lobby_peers };
            for socket in self.allowed_sockets(Permission::PromotePeer) {
                socket.notify(&notification);
            }
        }

        if self.room_empty() && (self.lobby.is_empty() || self.locked) {
            self.start_self_destruct();
        }
    }

    fn start_self_destruct(&mut self) {
        debug!(target: "room.actor", room_id = %self.room_id, "self destruct countdown started");
        self.self_destruct_at =
            Some(Instant::now() + Duration::from_secs(self.config.self_destruct_delay_seconds));
    }

    fn check_self_destruct(&mut self) {
        let Some(deadline) = self.self_destruct_at else {
            return;
        };
        if Instant::now() < deadline || self.closed {
            return;
        }
        self.self_destruct_at = None;

        if self.room_empty() && (self.lobby.is_empty() || self.locked) {
            info!(
                target: "room.actor",
                room_id = %self.room_id,
                "room deserted, closing"
            );
            self.close_room();
        } else {
            debug!(target: "room.actor", room_id = %self.room_id, "self destruct aborted, room is not empty");
        }
    }

    // ------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------

    /// Close the room. Idempotent; runs the full teardown once.
    pub(super) fn close_room(&mut self) {
        if self.closed {
            return;
        }
        info!(target: "room.actor", room_id = %self.room_id, "closing room");

        self.closed = true;
        self.self_destruct_at = None;
        self.join_queue.close();
        self.chat_history.clear();
        self.file_history.clear();
        self.last_n.clear();

        for peer in self.lobby.close() {
            peer.socket.close();
        }

        for (peer_id, mut peer) in self.peers.drain() {
            peer.release_resources();
            peer.socket.close();
            self.directory.remove(&peer_id);
        }
        for (_, peer) in self.arriving.drain() {
            peer.socket.close();
        }

        for observer in self.audio_observers.values() {
            observer.close();
        }
        self.audio_observers.clear();
        for router in self.routers.values() {
            router.close();
        }
        self.routers.clear();
        self.piped_routers.clear();
        self.audio_levels.clear();
        self.tokens.clear();

        self.closed_at = Some(Utc::now());

        // Stops event relays and signals the registry.
        self.cancel_token.cancel();
    }

    // ------------------------------------------------------------------
    // Request dispatch
    // ------------------------------------------------------------------

    async fn handle_request(&mut self, peer_id: PeerId, request: ClientRequest, reply: RequestReply) {
        if self.closed {
            let socket = self.find_socket(&peer_id);
            reply.deliver(socket.as_ref(), Err(RoomError::RoomClosed));
            return;
        }

        debug!(
            target: "room.actor",
            room_id = %self.room_id,
            peer_id = %peer_id,
            method = request.method(),
            "request"
        );

        let request = match request {
            ClientRequest::Join {
                display_name,
                picture,
                from,
                rtp_capabilities,
                returning,
            } => {
                self.handle_join_request(
                    &peer_id,
                    display_name,
                    picture,
                    from,
                    rtp_capabilities,
                    returning,
                    reply,
                )
                .await;
                return;
            }
            other => other,
        };

        let result = self.dispatch_request(&peer_id, request).await;
        if let Err(error) = &result {
            debug!(
                target: "room.actor",
                room_id = %self.room_id,
                peer_id = %peer_id,
                %error,
                "request failed"
            );
        }
        let socket = self.find_socket(&peer_id);
        reply.deliver(socket.as_ref(), result);
    }

    async fn dispatch_request(
        &mut self,
        peer_id: &PeerId,
        request: ClientRequest,
    ) -> Result<Value, RoomError> {
        // Parked peers may only update their lobby card.
        if self.lobby.contains(peer_id) {
            return self.dispatch_lobby_request(peer_id, request);
        }

        match request {
            ClientRequest::Join { .. } => Err(RoomError::internal("join handled separately")),

            ClientRequest::GetRouterRtpCapabilities {} => {
                let router = self.peer_router(peer_id)?;
                to_result(router.rtp_capabilities())
            }

            ClientRequest::CreateWebRtcTransport {
                force_tcp,
                producing,
                consuming,
            } => {
                self.handle_create_transport(peer_id, force_tcp, producing, consuming)
                    .await
            }

            ClientRequest::ConnectWebRtcTransport {
                transport_id,
                dtls_parameters,
            } => {
                let transport = self.peer_transport(peer_id, transport_id)?;
                transport.connect(dtls_parameters).await?;
                Ok(Value::Null)
            }

            ClientRequest::RestartIce { transport_id } => {
                let transport = self.peer_transport(peer_id, transport_id)?;
                let ice_parameters = transport.restart_ice().await?;
                to_result(ice_parameters)
            }

            ClientRequest::Produce {
                transport_id,
                kind,
                rtp_parameters,
                app_data,
            } => {
                self.handle_produce(peer_id, transport_id, kind, rtp_parameters, app_data)
                    .await
            }

            ClientRequest::CloseProducer { producer_id } => {
                self.handle_close_producer(peer_id, producer_id).await
            }

            ClientRequest::PauseProducer { producer_id } => {
                self.require_joined(peer_id)?;
                let producer = self.peer_producer(peer_id, producer_id)?;
                producer.pause().await?;
                Ok(Value::Null)
            }

            ClientRequest::ResumeProducer { producer_id } => {
                self.require_joined(peer_id)?;
                let producer = self.peer_producer(peer_id, producer_id)?;
                producer.resume().await?;
                Ok(Value::Null)
            }

            ClientRequest::PauseConsumer { consumer_id } => {
                self.require_joined(peer_id)?;
                let consumer = self.peer_consumer(peer_id, consumer_id)?;
                consumer.pause().await?;
                Ok(Value::Null)
            }

            ClientRequest::ResumeConsumer { consumer_id } => {
                self.require_joined(peer_id)?;
                let consumer = self.peer_consumer(peer_id, consumer_id)?;
                consumer.resume().await?;
                Ok(Value::Null)
            }

            ClientRequest::SetConsumerPreferedLayers {
                consumer_id,
                spatial_layer,
                temporal_layer,
            } => {
                self.require_joined(peer_id)?;
                let consumer = self.peer_consumer(peer_id, consumer_id)?;
                consumer
                    .set_preferred_layers(media_engine::ConsumerLayers {
                        spatial_layer,
                        temporal_layer,
                    })
                    .await?;
                Ok(Value::Null)
            }

            ClientRequest::SetConsumerPriority {
                consumer_id,
                priority,
            } => {
                self.require_joined(peer_id)?;
                let consumer = self.peer_consumer(peer_id, consumer_id)?;
                consumer.set_priority(priority).await?;
                Ok(Value::Null)
            }

            ClientRequest::RequestConsumerKeyFrame { consumer_id } => {
                self.require_joined(peer_id)?;
                let consumer = self.peer_consumer(peer_id, consumer_id)?;
                consumer.request_key_frame().await?;
                Ok(Value::Null)
            }

            ClientRequest::GetTransportStats { transport_id } => {
                let transport = self.peer_transport(peer_id, transport_id)?;
                Ok(transport.stats().await?)
            }

            ClientRequest::GetProducerStats { producer_id } => {
                let producer = self.peer_producer(peer_id, producer_id)?;
                Ok(producer.stats().await?)
            }

            ClientRequest::GetConsumerStats { consumer_id } => {
                let consumer = self.peer_consumer(peer_id, consumer_id)?;
                Ok(consumer.stats().await?)
            }

            ClientRequest::ChangeDisplayName { display_name } => {
                self.require_joined(peer_id)?;
                let peer = self
                    .peers
                    .get_mut(peer_id)
                    .ok_or_else(|| RoomError::NotFound(format!("peer {peer_id}")))?;
                let old_display_name = std::mem::replace(&mut peer.display_name, display_name.clone());
                self.broadcast(
                    Some(peer_id),
                    &Notification::ChangeDisplayName {
                        peer_id: peer_id.clone(),
                        display_name,
                        old_display_name,
                    },
                );
                Ok(Value::Null)
            }

            ClientRequest::ChangePicture { picture } => {
                self.require_joined(peer_id)?;
                let peer = self
                    .peers
                    .get_mut(peer_id)
                    .ok_or_else(|| RoomError::NotFound(format!("peer {peer_id}")))?;
                peer.picture = Some(picture.clone());
                self.broadcast(
                    Some(peer_id),
                    &Notification::ChangePicture {
                        peer_id: peer_id.clone(),
                        picture,
                    },
                );
                Ok(Value::Null)
            }

            ClientRequest::ChatMessage { chat_message } => {
                self.require_permission(peer_id, Permission::SendChat)?;
                self.chat_history.push(chat_message.clone());
                self.broadcast(
                    Some(peer_id),
                    &Notification::ChatMessage {
                        peer_id: peer_id.clone(),
                        chat_message,
                    },
                );
                Ok(Value::Null)
            }

            ClientRequest::ModeratorGiveRole {
                peer_id: target_id,
                role_id,
            } => self.handle_give_role(peer_id, &target_id, role_id),

            ClientRequest::ModeratorRemoveRole {
                peer_id: target_id,
                role_id,
            } => self.handle_remove_role(peer_id, &target_id, role_id),

            ClientRequest::ModeratorClearChat {} => {
                self.require_permission(peer_id, Permission::ModerateChat)?;
                self.require_permission(peer_id, Permission::ModerateFiles)?;
                self.chat_history.clear();
                self.file_history.clear();
                self.broadcast(Some(peer_id), &Notification::ModeratorClearChat);
                Ok(Value::Null)
            }

            ClientRequest::SetLocalRecording {
                local_recording_state,
            } => {
                self.require_permission(peer_id, Permission::LocalRecordRoom)?;
                let peer = self
                    .peers
                    .get_mut(peer_id)
                    .ok_or_else(|| RoomError::NotFound(format!("peer {peer_id}")))?;
                peer.local_recording_state = Some(local_recording_state.clone());
                self.broadcast(
                    Some(peer_id),
                    &Notification::SetLocalRecording {
                        peer_id: peer_id.clone(),
                        local_recording_state,
                    },
                );
                Ok(Value::Null)
            }

            ClientRequest::LockRoom {} => {
                self.require_permission(peer_id, Permission::ChangeRoomLock)?;
                self.locked = true;
                self.broadcast(
                    Some(peer_id),
                    &Notification::LockRoom {
                        peer_id: peer_id.clone(),
                    },
                );
                Ok(Value::Null)
            }

            ClientRequest::UnlockRoom {} => {
                self.require_permission(peer_id, Permission::ChangeRoomLock)?;
                self.locked = false;
                self.broadcast(
                    Some(peer_id),
                    &Notification::UnlockRoom {
                        peer_id: peer_id.clone(),
                    },
                );
                Ok(Value::Null)
            }

            ClientRequest::SetAccessCode { access_code } => {
                self.require_permission(peer_id, Permission::ChangeRoomLock)?;
                self.access_code = access_code.clone();
                self.broadcast(
                    Some(peer_id),
                    &Notification::SetAccessCode {
                        peer_id: peer_id.clone(),
                        access_code,
                    },
                );
                Ok(Value::Null)
            }

            ClientRequest::SetJoinByAccessCode { join_by_access_code } => {
                self.require_permission(peer_id, Permission::ChangeRoomLock)?;
                self.join_by_access_code = join_by_access_code;
                self.broadcast(
                    Some(peer_id),
                    &Notification::SetJoinByAccessCode {
                        peer_id: peer_id.clone(),
                        join_by_access_code,
                    },
                );
                Ok(Value::Null)
            }

            ClientRequest::PromotePeer { peer_id: target_id } => {
                self.require_permission(peer_id, Permission::PromotePeer)?;
                self.promote_one(&target_id);
                Ok(Value::Null)
            }

            ClientRequest::PromoteAllPeers {} => {
                self.require_permission(peer_id, Permission::PromotePeer)?;
                self.promote_all_peers();
                Ok(Value::Null)
            }

            ClientRequest::SendFile(file) => {
                self.require_permission(peer_id, Permission::ShareFile)?;
                self.file_history.push(file.clone());
                self.broadcast(Some(peer_id), &Notification::SendFile(file));
                Ok(Value::Null)
            }

            ClientRequest::RaisedHand { raised_hand } => {
                let peer = self
                    .peers
                    .get_mut(peer_id)
                    .ok_or_else(|| RoomError::NotFound(format!("peer {peer_id}")))?;
                peer.raised_hand = raised_hand;
                peer.raised_hand_timestamp = Some(Utc::now());
                let raised_hand_timestamp = peer.raised_hand_timestamp;
                self.broadcast(
                    Some(peer_id),
                    &Notification::RaisedHand {
                        peer_id: peer_id.clone(),
                        raised_hand,
                        raised_hand_timestamp,
                    },
                );
                Ok(Value::Null)
            }

            ClientRequest::ModeratorMute { peer_id: target_id } => {
                self.moderator_notify_one(peer_id, &target_id, &Notification::ModeratorMute)
            }

            ClientRequest::ModeratorMuteAll {} => {
                self.moderator_notify_all(peer_id, &Notification::ModeratorMute)
            }

            ClientRequest::ModeratorStopVideo { peer_id: target_id } => {
                self.moderator_notify_one(peer_id, &target_id, &Notification::ModeratorStopVideo)
            }

            ClientRequest::ModeratorStopAllVideo {} => {
                self.moderator_notify_all(peer_id, &Notification::ModeratorStopVideo)
            }

            ClientRequest::ModeratorStopScreenSharing { peer_id: target_id } => self
                .moderator_notify_one(
                    peer_id,
                    &target_id,
                    &Notification::ModeratorStopScreenSharing,
                ),

            ClientRequest::ModeratorStopAllScreenSharing {} => {
                self.moderator_notify_all(peer_id, &Notification::ModeratorStopScreenSharing)
            }

            ClientRequest::ModeratorCloseMeeting {} => {
                self.require_permission(peer_id, Permission::ModerateRoom)?;
                self.broadcast(Some(peer_id), &Notification::ModeratorKick);
                self.close_room();
                Ok(Value::Null)
            }

            ClientRequest::ModeratorKickPeer { peer_id: target_id } => {
                self.require_permission(peer_id, Permission::ModerateRoom)?;
                let target = self
                    .peers
                    .get(&target_id)
                    .ok_or_else(|| RoomError::NotFound(format!("peer {target_id}")))?;
                target.socket.notify(&Notification::ModeratorKick);
                self.handle_peer_disconnected(&target_id);
                Ok(Value::Null)
            }

            ClientRequest::ModeratorLowerHand { peer_id: target_id } => {
                self.moderator_notify_one(peer_id, &target_id, &Notification::ModeratorLowerHand)
            }

            ClientRequest::AddConsentForRecording { consent } => {
                self.broadcast(
                    Some(peer_id),
                    &Notification::AddConsentForRecording {
                        peer_id: peer_id.clone(),
                        consent,
                    },
                );
                Ok(Value::Null)
            }
        }
    }

    /// Requests a parked peer is allowed to make.
    fn dispatch_lobby_request(
        &mut self,
        peer_id: &PeerId,
        request: ClientRequest,
    ) -> Result<Value, RoomError> {
        match request {
            ClientRequest::ChangeDisplayName { display_name } => {
                if let Some(peer) = self.lobby.peer_mut(peer_id) {
                    peer.display_name = display_name.clone();
                }
                let notification = Notification::LobbyChangeDisplayName {
                    peer_id: peer_id.clone(),
                    display_name,
                };
                for socket in self.allowed_sockets(Permission::PromotePeer) {
                    socket.notify(&notification);
                }
                Ok(Value::Null)
            }
            ClientRequest::ChangePicture { picture } => {
                if let Some(peer) = self.lobby.peer_mut(peer_id) {
                    peer.picture = Some(picture.clone());
                }
                let notification = Notification::LobbyChangePicture {
                    peer_id: peer_id.clone(),
                    picture,
                };
                for socket in self.allowed_sockets(Permission::PromotePeer) {
                    socket.notify(&notification);
                }
                Ok(Value::Null)
            }
            _ => Err(RoomError::NotJoined),
        }
    }

    /// The join request: reply first, then backfill consumers and
    /// announce the peer, so the reply precedes every follow-up
    /// notification on the wire.
    #[allow(clippy::too_many_arguments)]
    async fn handle_join_request(
        &mut self,
        peer_id: &PeerId,
        display_name: Option<String>,
        picture: Option<String>,
        from: Option<String>,
        rtp_capabilities: Option<media_engine::RtpCapabilities>,
        returning: bool,
        reply: RequestReply,
    ) {
        let result = self.prepare_join_reply(peer_id, display_name, picture, from, rtp_capabilities);
        let failed = result.is_err();
        let socket = self.find_socket(peer_id);
        reply.deliver(socket.as_ref(), result);
        if failed {
            return;
        }

        // Mark joined, then wire up media both directions.
        let peer_info = {
            let Some(peer) = self.peers.get_mut(peer_id) else {
                return;
            };
            peer.joined = true;
            peer.peer_info()
        };

        let producers: Vec<(PeerId, Arc<dyn media_engine::Producer>)> = self
            .joined_peers_except(peer_id)
            .into_iter()
            .flat_map(|other_id| {
                self.peers
                    .get(&other_id)
                    .map(|other| {
                        other
                            .producers()
                            .map(|producer| (other_id.clone(), Arc::clone(producer)))
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default()
            })
            .collect();

        for (producer_peer_id, producer) in producers {
            self.create_consumer(peer_id, &producer_peer_id, &producer)
                .await;
        }

        let notification = Notification::NewPeer {
            peer: peer_info,
            returning,
        };
        for other_id in self.joined_peers_except(peer_id) {
            if let Some(other) = self.peers.get(&other_id) {
                other.socket.notify(&notification);
            }
        }

        info!(
            target: "room.actor",
            room_id = %self.room_id,
            peer_id = %peer_id,
            "peer joined"
        );
    }

    fn prepare_join_reply(
        &mut self,
        peer_id: &PeerId,
        display_name: Option<String>,
        picture: Option<String>,
        from: Option<String>,
        rtp_capabilities: Option<media_engine::RtpCapabilities>,
    ) -> Result<Value, RoomError> {
        let has_promote = self.has_permission(peer_id, Permission::PromotePeer);
        let lobby_peers = if has_promote {
            self.lobby.peer_list()
        } else {
            Vec::new()
        };

        let joined_infos: Vec<_> = self
            .joined_peers_except(peer_id)
            .into_iter()
            .filter_map(|id| self.peers.get(&id).map(Peer::peer_info))
            .collect();

        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| RoomError::NotFound(format!("peer {peer_id}")))?;
        if peer.joined {
            return Err(RoomError::AlreadyJoined);
        }

        if let Some(display_name) = display_name {
            peer.display_name = display_name;
        }
        peer.picture = picture.or(peer.picture.take());
        peer.from = from.or(peer.from.take());
        peer.rtp_capabilities = rtp_capabilities;

        let roles: Vec<u32> = peer.roles().iter().map(|role| role.id.0).collect();

        Ok(json!({
            "roles": roles,
            "peers": joined_infos,
            "chatHistory": self.chat_history,
            "fileHistory": self.file_history,
            "lastNHistory": self.last_n,
            "locked": self.locked,
            "lobbyPeers": lobby_peers,
            "accessCode": self.access_code,
            "joinByAccessCode": self.join_by_access_code,
        }))
    }

    fn handle_give_role(
        &mut self,
        actor_id: &PeerId,
        target_id: &PeerId,
        role_id: crate::access::RoleId,
    ) -> Result<Value, RoomError> {
        self.require_permission(actor_id, Permission::ModifyRole)?;
        let role = roles::find(role_id)
            .filter(|role| role.promotable)
            .ok_or_else(|| RoomError::NotFound(format!("role {role_id}")))?;
        self.require_role_level(actor_id, role)?;

        let target = self
            .peers
            .get_mut(target_id)
            .ok_or_else(|| RoomError::NotFound(format!("peer {target_id}")))?;
        if target.add_role(role) {
            self.notify_got_role(target_id, role);
        }
        Ok(Value::Null)
    }

    fn handle_remove_role(
        &mut self,
        actor_id: &PeerId,
        target_id: &PeerId,
        role_id: crate::access::RoleId,
    ) -> Result<Value, RoomError> {
        self.require_permission(actor_id, Permission::ModifyRole)?;
        let role = roles::find(role_id)
            .filter(|role| role.promotable)
            .ok_or_else(|| RoomError::NotFound(format!("role {role_id}")))?;
        self.require_role_level(actor_id, role)?;

        let target = self
            .peers
            .get_mut(target_id)
            .ok_or_else(|| RoomError::NotFound(format!("peer {target_id}")))?;
        if target.remove_role(role) {
            self.notify_lost_role(target_id, role);
        }
        Ok(Value::Null)
    }

    fn notify_got_role(&mut self, peer_id: &PeerId, role: Role) {
        let Some(peer) = self.peers.get(peer_id) else {
            return;
        };
        if !peer.joined {
            return;
        }
        self.broadcast_including_sender(&Notification::GotRole {
            peer_id: peer_id.clone(),
            role_id: role.id,
        });

        // Newly able to promote: show the current lobby.
        if self.policy.permits(&[role], Permission::PromotePeer) {
            let lobby_peers = self.lobby.peer_list();
            if !lobby_peers.is_empty() {
                if let Some(peer) = self.peers.get(peer_id) {
                    peer.socket.notify(&Notification::ParkedPeers { lobby_peers });
                }
            }
        }
    }

    fn notify_lost_role(&mut self, peer_id: &PeerId, role: Role) {
        let Some(peer) = self.peers.get(peer_id) else {
            return;
        };
        if !peer.joined {
            return;
        }
        self.broadcast_including_sender(&Notification::LostRole {
            peer_id: peer_id.clone(),
            role_id: role.id,
        });
    }

    fn moderator_notify_one(
        &mut self,
        actor_id: &PeerId,
        target_id: &PeerId,
        notification: &Notification,
    ) -> Result<Value, RoomError> {
        self.require_permission(actor_id, Permission::ModerateRoom)?;
        let target = self
            .peers
            .get(target_id)
            .ok_or_else(|| RoomError::NotFound(format!("peer {target_id}")))?;
        target.socket.notify(notification);
        Ok(Value::Null)
    }

    fn moderator_notify_all(
        &mut self,
        actor_id: &PeerId,
        notification: &Notification,
    ) -> Result<Value, RoomError> {
        self.require_permission(actor_id, Permission::ModerateRoom)?;
        self.broadcast(Some(actor_id), notification);
        Ok(Value::Null)
    }

    // ------------------------------------------------------------------
    // Permission engine
    // ------------------------------------------------------------------

    /// Permission check with the fail-open fallback: allowed when a held
    /// role is in the table, or when the kind falls open and no joined
    /// peer holds it.
    pub(super) fn has_permission(&self, peer_id: &PeerId, permission: Permission) -> bool {
        let Some(peer) = self.peers.get(peer_id) else {
            return false;
        };
        if self.policy.permits(peer.roles(), permission) {
            return true;
        }
        self.policy.fails_open(permission) && self.count_with_permission(permission) == 0
    }

    fn require_permission(&self, peer_id: &PeerId, permission: Permission) -> Result<(), RoomError> {
        if self.has_permission(peer_id, permission) {
            Ok(())
        } else {
            Err(RoomError::Authorization)
        }
    }

    fn require_role_level(&self, actor_id: &PeerId, role: Role) -> Result<(), RoomError> {
        let Some(actor) = self.peers.get(actor_id) else {
            return Err(RoomError::NotFound(format!("peer {actor_id}")));
        };
        if actor.max_role_level() >= role.level {
            Ok(())
        } else {
            Err(RoomError::Authorization)
        }
    }

    pub(super) fn require_joined(&self, peer_id: &PeerId) -> Result<(), RoomError> {
        match self.peers.get(peer_id) {
            Some(peer) if peer.joined => Ok(()),
            Some(_) => Err(RoomError::NotJoined),
            None => Err(RoomError::NotFound(format!("peer {peer_id}"))),
        }
    }

    /// Joined peers holding the permission.
    fn count_with_permission(&self, permission: Permission) -> usize {
        self.peers
            .values()
            .filter(|peer| peer.joined && self.policy.permits(peer.roles(), permission))
            .count()
    }

    /// Sockets of the permission's broadcast target set: the holders,
    /// or every joined peer when the kind falls open and nobody holds it.
    pub(super) fn allowed_sockets(&self, permission: Permission) -> Vec<PeerSocket> {
        let holders: Vec<PeerSocket> = self
            .peers
            .values()
            .filter(|peer| peer.joined && self.policy.permits(peer.roles(), permission))
            .map(|peer| peer.socket.clone())
            .collect();
        if !holders.is_empty() {
            return holders;
        }
        if self.policy.fails_open(permission) {
            return self
                .peers
                .values()
                .map(|peer| peer.socket.clone())
                .collect();
        }
        holders
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    pub(super) fn joined_peers_except(&self, except: &PeerId) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|peer| peer.joined && &peer.id != except)
            .map(|peer| peer.id.clone())
            .collect()
    }

    /// Notify every registered peer except `except`.
    pub(super) fn broadcast(&self, except: Option<&PeerId>, notification: &Notification) {
        for peer in self.peers.values() {
            if Some(&peer.id) != except {
                peer.socket.notify(notification);
            }
        }
    }

    fn broadcast_including_sender(&self, notification: &Notification) {
        self.broadcast(None, notification);
    }

    fn find_socket(&self, peer_id: &PeerId) -> Option<PeerSocket> {
        if let Some(peer) = self.peers.get(peer_id) {
            return Some(peer.socket.clone());
        }
        if let Some(peer) = self.arriving.get(peer_id) {
            return Some(peer.socket.clone());
        }
        self.lobby.peer(peer_id).map(|peer| peer.socket.clone())
    }

    pub(super) fn peer_router(&self, peer_id: &PeerId) -> Result<Arc<dyn Router>, RoomError> {
        let peer = self
            .peers
            .get(peer_id)
            .ok_or_else(|| RoomError::NotFound(format!("peer {peer_id}")))?;
        let router_id = peer
            .router_id()
            .ok_or_else(|| RoomError::NotFound("router".to_string()))?;
        self.routers
            .get(&router_id)
            .cloned()
            .ok_or_else(|| RoomError::NotFound("router".to_string()))
    }

    fn peer_transport(
        &self,
        peer_id: &PeerId,
        transport_id: common::types::TransportId,
    ) -> Result<Arc<dyn media_engine::Transport>, RoomError> {
        let peer = self
            .peers
            .get(peer_id)
            .ok_or_else(|| RoomError::NotFound(format!("peer {peer_id}")))?;
        peer.transport(transport_id)
            .cloned()
            .ok_or_else(|| RoomError::NotFound(format!("transport {transport_id}")))
    }

    fn peer_producer(
        &self,
        peer_id: &PeerId,
        producer_id: ProducerId,
    ) -> Result<Arc<dyn media_engine::Producer>, RoomError> {
        let peer = self
            .peers
            .get(peer_id)
            .ok_or_else(|| RoomError::NotFound(format!("peer {peer_id}")))?;
        peer.producer(producer_id)
            .cloned()
            .ok_or_else(|| RoomError::NotFound(format!("producer {producer_id}")))
    }

    fn peer_consumer(
        &self,
        peer_id: &PeerId,
        consumer_id: ConsumerId,
    ) -> Result<Arc<dyn media_engine::Consumer>, RoomError> {
        let peer = self
            .peers
            .get(peer_id)
            .ok_or_else(|| RoomError::NotFound(format!("peer {peer_id}")))?;
        peer.consumer(consumer_id)
            .cloned()
            // Consumers close unilaterally on engine events; a missing
            // one is a benign race for the client.
            .ok_or_else(|| RoomError::NotFoundInEngine(format!("consumer {consumer_id}")))
    }

    async fn handle_create_transport(
        &mut self,
        peer_id: &PeerId,
        force_tcp: bool,
        producing: bool,
        consuming: bool,
    ) -> Result<Value, RoomError> {
        // The peer need not be joined yet; clients prepare transports
        // right after the room is ready.
        let router = self.peer_router(peer_id)?;
        let transport = router
            .create_transport(media_engine::TransportOptions {
                force_tcp,
                producing,
                consuming,
            })
            .await?;

        if let Some(bitrate) = self.config.max_incoming_bitrate {
            if let Err(error) = transport.set_max_incoming_bitrate(bitrate).await {
                warn!(
                    target: "room.media",
                    room_id = %self.room_id,
                    transport_id = %transport.id(),
                    %error,
                    "setting max incoming bitrate failed"
                );
            }
        }

        let result = json!({
            "id": transport.id(),
            "iceParameters": transport.ice_parameters(),
            "iceCandidates": transport.ice_candidates(),
            "dtlsParameters": transport.dtls_parameters(),
        });

        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| RoomError::NotFound(format!("peer {peer_id}")))?;
        peer.add_transport(transport);

        Ok(result)
    }
}

/// Relay one router's audio level events into the room mailbox.
fn spawn_audio_relay(
    router_id: RouterId,
    mut events: mpsc::UnboundedReceiver<AudioLevelEvent>,
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel_token.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let message = RoomMessage::Media(MediaEvent::AudioLevel { router_id, event });
                    if sender.send(message).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

fn to_result<T: serde::Serialize>(value: T) -> Result<Value, RoomError> {
    serde_json::to_value(value).map_err(|err| RoomError::internal(err.to_string()))
}
