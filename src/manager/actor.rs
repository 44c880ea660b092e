use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use serenity::gateway::ConnectionStage;
use serenity::model::id::{ChannelId, GuildId};
use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::failover::FailoverQueue;
use super::pending::{JoinWaiter, PendingJoin, PendingJoins};
use super::region::{find_ideal_node, region_from_endpoint};
use super::{Command, JoinOptions, ManagerEvent, ManagerOptions};
use crate::audio::session::{MigrationSnapshot, SessionSignal, SignalSink};
use crate::audio::{Player, PlayerEvent, SessionRef, VoiceSession};
use crate::error::{LinkError, Result};
use crate::gateway::{GatewayClient, VoiceServerUpdate};
use crate::node::{NodeAddress, NodeConnection, NodeEvent, NodeEventKind, NodeEventSink};
use crate::protocol::{
    parse_snowflake, GatewayPayload, IncomingMessage, OutgoingMessage, PlayOptions,
    TrackEventKind, VoiceUpdateEvent, VOICE_STATE_UPDATE,
};

/// One queued node switch
pub(crate) struct FailoverAction {
    session: SessionRef,
    leave: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

/// State owned by the manager task. Only this type mutates the registries.
pub(crate) struct ManagerCore {
    options: ManagerOptions,
    gateway: Arc<dyn GatewayClient>,
    events: WeakUnboundedSender<ManagerEvent>,
    nodes: BTreeMap<String, NodeConnection>,
    sessions: BTreeMap<GuildId, SessionRef>,
    pending: PendingJoins,
    failover: FailoverQueue<FailoverAction>,
    failover_timer: Option<JoinHandle<()>>,
}

fn guild_from_wire(raw: &str) -> Option<GuildId> {
    parse_snowflake(raw).map(|id| GuildId::new(id.get()))
}

fn shard_connected(stage: Option<ConnectionStage>) -> bool {
    matches!(stage, Some(ConnectionStage::Connected))
}

impl ManagerCore {
    pub fn new(
        options: ManagerOptions,
        gateway: Arc<dyn GatewayClient>,
        events: WeakUnboundedSender<ManagerEvent>,
    ) -> Self {
        let failover = FailoverQueue::new(options.failover_limit);
        Self {
            options,
            gateway,
            events,
            nodes: BTreeMap::new(),
            sessions: BTreeMap::new(),
            pending: PendingJoins::default(),
            failover,
            failover_timer: None,
        }
    }

    /// Sink handed to every node so its events land on this loop
    pub fn node_sink(&self) -> NodeEventSink {
        let events = self.events.clone();
        Arc::new(move |event| {
            if let Some(tx) = events.upgrade() {
                let _ = tx.send(ManagerEvent::Node(event));
            }
        })
    }

    fn signal_sink(&self) -> SignalSink {
        let events = self.events.clone();
        Arc::new(move |signal| {
            if let Some(tx) = events.upgrade() {
                let _ = tx.send(ManagerEvent::Session(signal));
            }
        })
    }

    /// Runs `event` on a later turn of the loop
    fn schedule(&self, event: ManagerEvent) {
        if let Some(tx) = self.events.upgrade() {
            let _ = tx.send(event);
        }
    }

    fn schedule_after(&self, delay: Duration, event: ManagerEvent) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = events.upgrade() {
                let _ = tx.send(event);
            }
        })
    }

    fn player(&self, session: SessionRef) -> Player {
        Player::new(session, self.gateway.clone())
    }

    pub async fn handle(&mut self, event: ManagerEvent) -> Flow {
        match event {
            ManagerEvent::Command(command) => return self.command(command).await,
            ManagerEvent::Node(event) => self.node_event(event).await,
            ManagerEvent::Session(signal) => self.session_signal(signal).await,
            ManagerEvent::JoinTimeout { guild_id, join_id } => self.join_timeout(guild_id, join_id),
            ManagerEvent::FailoverTick => self.failover_tick().await,
            ManagerEvent::Rejoin { session, snapshot } => self.rejoin(session, snapshot),
        }
        Flow::Continue
    }

    async fn command(&mut self, command: Command) -> Flow {
        match command {
            Command::Join {
                guild_id,
                channel_id,
                options,
                reply,
            } => self.join(guild_id, channel_id, options, None, JoinWaiter::Caller(reply)),
            Command::VoiceServerUpdate(data) => self.voice_server_update(data),
            Command::ShardReady(shard_id) => self.shard_ready(shard_id).await,
            Command::Leave { guild_id, reply } => {
                self.leave(guild_id);
                let _ = reply.send(());
            }
            Command::CreateNode { address, reply } => {
                let _ = reply.send(self.create_node(address));
            }
            Command::RemoveNode { key, reply } => {
                let removed = self.remove_node(&key).await;
                let _ = reply.send(removed);
            }
            Command::SetDraining {
                key,
                draining,
                reply,
            } => {
                let _ = reply.send(self.set_draining(&key, draining));
            }
            Command::Nodes { reply } => {
                let _ = reply.send(self.nodes.values().map(NodeConnection::status).collect());
            }
            Command::Get { guild_id, reply } => {
                let player = self.sessions.get(&guild_id).cloned().map(|s| self.player(s));
                let _ = reply.send(player);
            }
            Command::Players { reply } => {
                let _ = reply.send(self.sessions.keys().copied().collect());
            }
            Command::FindIdealNode { region, reply } => {
                let node = find_ideal_node(self.nodes.values(), region.as_deref());
                let _ = reply.send(node.map(|n| n.key().to_string()));
            }
            Command::RegionFor { endpoint, reply } => {
                let _ = reply.send(self.region_for(endpoint.as_deref()));
            }
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    // Nodos

    /// Registers a node built elsewhere; the caller decides when it connects
    pub fn insert_node(&mut self, node: NodeConnection) -> bool {
        let key = node.key().to_string();
        if self.nodes.contains_key(&key) {
            warn!("⚠️ El nodo {} ya está registrado", key);
            return false;
        }
        info!("➕ Nodo {} registrado (región {:?})", key, node.region());
        self.nodes.insert(key, node);
        true
    }

    pub fn create_node(&mut self, address: NodeAddress) -> bool {
        let options = address.into_options(
            &self.options.password,
            self.options.user_id,
            self.options.num_shards,
        );
        let node = NodeConnection::new(options, self.node_sink());
        if !self.insert_node(node.clone()) {
            return false;
        }
        node.connect();
        true
    }

    async fn remove_node(&mut self, key: &str) -> bool {
        let Some(node) = self.nodes.remove(key) else {
            return false;
        };
        node.destroy();
        info!("➖ Nodo {} eliminado", key);
        self.on_disconnect(key).await;
        true
    }

    fn set_draining(&mut self, key: &str, draining: bool) -> bool {
        match self.nodes.get(key) {
            Some(node) => {
                node.set_draining(draining);
                info!("🚰 Nodo {} drenando: {}", key, draining);
                true
            }
            None => false,
        }
    }

    fn region_for(&self, endpoint: Option<&str>) -> String {
        region_from_endpoint(
            endpoint,
            &self.options.regions,
            self.nodes.values(),
            &self.options.default_region,
        )
    }

    async fn node_event(&mut self, event: NodeEvent) {
        match event.kind {
            NodeEventKind::Ready => debug!("Nodo {} listo para sesiones", event.node),
            NodeEventKind::Disconnect => {
                if self.nodes.contains_key(&event.node) {
                    self.on_disconnect(&event.node).await;
                }
            }
            NodeEventKind::Message(message) => self.on_message(&event.node, message).await,
            NodeEventKind::Error(e) => warn!("⚠️ Error en nodo {}: {}", event.node, e),
        }
    }

    async fn on_disconnect(&mut self, key: &str) {
        let affected: Vec<SessionRef> = self
            .sessions
            .values()
            .filter(|session| session.lock().node().key() == key)
            .cloned()
            .collect();

        if !affected.is_empty() {
            warn!("🔀 {} sesiones en el nodo caído {}, migrando", affected.len(), key);
        }
        for session in affected {
            self.queue_failover(FailoverAction {
                session,
                leave: true,
            })
            .await;
        }
    }

    async fn shard_ready(&mut self, shard_id: u64) {
        let affected: Vec<SessionRef> = self
            .sessions
            .values()
            .filter(|session| session.lock().shard_id() == shard_id)
            .cloned()
            .collect();

        debug!("Shard {} listo, {} sesiones a revisar", shard_id, affected.len());
        for session in affected {
            self.queue_failover(FailoverAction {
                session,
                leave: false,
            })
            .await;
        }
    }

    // Failover

    async fn queue_failover(&mut self, action: FailoverAction) {
        if let Some(action) = self.failover.push(action) {
            self.arm_failover_timer();
            self.run_failover(action).await;
        } else {
            debug!("⏳ Failover en cola ({} pendientes)", self.failover.len());
        }
    }

    fn arm_failover_timer(&mut self) {
        let timer = self.schedule_after(self.options.failover_rate, ManagerEvent::FailoverTick);
        if let Some(previous) = self.failover_timer.replace(timer) {
            previous.abort();
        }
    }

    async fn failover_tick(&mut self) {
        let batch = self.failover.tick();
        if batch.is_empty() {
            self.failover_timer = None;
            return;
        }

        self.arm_failover_timer();
        for action in batch {
            self.run_failover(action).await;
        }
    }

    async fn run_failover(&mut self, action: FailoverAction) {
        let guild_id = action.session.lock().guild_id();
        let registered = self
            .sessions
            .get(&guild_id)
            .is_some_and(|current| Arc::ptr_eq(current, &action.session));
        if !registered {
            debug!("Failover de guild {} descartado: la sesión ya no está registrada", guild_id);
            return;
        }
        self.switch_node(action.session, action.leave).await;
    }

    /// Detaches the session and rejoins it on the next turn, resuming playback
    async fn switch_node(&mut self, session: SessionRef, leave: bool) {
        let reconnect_threshold = self.options.reconnect_threshold.as_millis() as u64;
        let (snapshot, shard_id, old_node, leave_payload) = {
            let mut s = session.lock();
            let snapshot = s.begin_migration(reconnect_threshold);
            let leave_payload = s.voice_state_payload(None, false, false);
            (snapshot, s.shard_id(), s.node().clone(), leave_payload)
        };
        let guild_id = snapshot.guild_id;

        if self
            .sessions
            .get(&guild_id)
            .is_some_and(|current| Arc::ptr_eq(current, &session))
        {
            self.sessions.remove(&guild_id);
        }

        info!(
            "🚚 Migrando guild {} desde {} (reanuda en {}ms)",
            guild_id,
            old_node.key(),
            snapshot.position
        );

        if leave {
            if let Err(e) = self
                .gateway
                .send_ws(shard_id, VOICE_STATE_UPDATE, leave_payload)
                .await
            {
                warn!("⚠️ No se pudo salir del canal de voz en guild {}: {}", guild_id, e);
            }
        } else {
            old_node.send(&OutgoingMessage::Disconnect {
                guild_id: guild_id.to_string(),
            });
        }

        self.schedule(ManagerEvent::Rejoin { session, snapshot });
    }

    fn rejoin(&mut self, session: SessionRef, snapshot: MigrationSnapshot) {
        if session.lock().is_disconnected() {
            debug!("Guild {} desconectado durante la migración", snapshot.guild_id);
            return;
        }
        self.join(
            snapshot.guild_id,
            snapshot.channel_id,
            JoinOptions::default(),
            Some(session.clone()),
            JoinWaiter::Failover { session, snapshot },
        );
    }

    fn complete_migration(&mut self, session: SessionRef, snapshot: MigrationSnapshot) {
        let node = {
            let mut s = session.lock();
            if snapshot.paused {
                s.set_pause(true);
            }
            if let Some(track) = snapshot.track {
                s.play(track, PlayOptions::starting_at(snapshot.position));
            }
            s.finish_migration();
            s.node().key().to_string()
        };
        info!("✅ Guild {} reconectado en {}", snapshot.guild_id, node);
        self.sessions.insert(snapshot.guild_id, session);
    }

    // Handshake de join

    fn join(
        &mut self,
        guild_id: GuildId,
        channel_id: ChannelId,
        options: JoinOptions,
        migrating: Option<SessionRef>,
        waiter: JoinWaiter,
    ) {
        if migrating.is_none() {
            if let Some(session) = self.sessions.get(&guild_id).cloned() {
                let moved = {
                    let mut s = session.lock();
                    let from = s.channel_id();
                    s.switch_channel(channel_id, false);
                    from != channel_id
                };
                if moved {
                    info!("🔀 Guild {} cambia al canal {}", guild_id, channel_id);
                }
                self.settle_waiter(waiter, Ok(session));
                return;
            }
        }

        let region = self.region_for(options.region.as_deref());
        let Some(node) = find_ideal_node(self.nodes.values(), Some(&region)) else {
            warn!("❌ Sin nodos disponibles para guild {} (región {})", guild_id, region);
            self.settle_waiter(waiter, Err(LinkError::NoAvailableNode { region }));
            return;
        };

        let join_id = self.pending.next_id();
        let timeout = self.schedule_after(
            self.options.join_timeout,
            ManagerEvent::JoinTimeout { guild_id, join_id },
        );
        let entry = PendingJoin {
            join_id,
            channel_id,
            node: node.clone(),
            session: migrating,
            waiter,
            timeout,
            armed: false,
        };

        if let Some(previous) = self.pending.insert(guild_id, entry) {
            debug!("Join previo de guild {} reemplazado", guild_id);
            self.fail_pending(guild_id, previous, LinkError::JoinSuperseded { guild_id });
        }

        debug!("🎧 Join de guild {} en {} (región {})", guild_id, node.key(), region);
        node.send(&OutgoingMessage::Connect {
            guild_id: guild_id.to_string(),
            channel_id: channel_id.to_string(),
        });
    }

    fn voice_server_update(&mut self, data: VoiceServerUpdate) {
        let guild_id = data.guild_id;
        let event = VoiceUpdateEvent {
            endpoint: data.endpoint,
            guild_id: guild_id.to_string(),
            token: data.token,
        };
        let signals = self.signal_sink();

        if let Some(entry) = self.pending.get_mut(guild_id) {
            entry.timeout.abort();
            entry.armed = true;

            let session = match &entry.session {
                Some(session) => {
                    session.lock().rehome(entry.node.clone(), data.shard_id);
                    session.clone()
                }
                None => VoiceSession::create(
                    guild_id,
                    entry.channel_id,
                    data.shard_id,
                    entry.node.clone(),
                    signals,
                ),
            };
            entry.session = Some(session.clone());
            debug!("🔑 Credenciales de voz para guild {} en {}", guild_id, entry.node.key());

            self.sessions.insert(guild_id, session.clone());
            session.lock().connect(data.session_id, event);
            return;
        }

        debug!("Voice server update sin join pendiente para guild {}", guild_id);
    }

    fn join_timeout(&mut self, guild_id: GuildId, join_id: u64) {
        let Some(entry) = self
            .pending
            .take_if(guild_id, |entry| entry.join_id == join_id && !entry.armed)
        else {
            return;
        };

        warn!("⏱️ Timeout de conexión de voz en guild {}", guild_id);
        entry.node.send(&OutgoingMessage::Disconnect {
            guild_id: guild_id.to_string(),
        });
        self.settle_waiter(entry.waiter, Err(LinkError::JoinTimeout { guild_id }));
    }

    fn fail_pending(&mut self, guild_id: GuildId, entry: PendingJoin, error: LinkError) {
        entry.node.send(&OutgoingMessage::Disconnect {
            guild_id: guild_id.to_string(),
        });
        self.settle_waiter(entry.waiter, Err(error));
    }

    fn settle_waiter(&mut self, waiter: JoinWaiter, result: Result<SessionRef>) {
        match waiter {
            JoinWaiter::Caller(reply) => {
                let result = result.map(|session| self.player(session));
                let _ = reply.send(result);
            }
            JoinWaiter::Failover { session, snapshot } => match result {
                Ok(rejoined) => self.complete_migration(rejoined, snapshot),
                Err(e) => {
                    warn!("❌ Falló la migración de guild {}: {}", snapshot.guild_id, e);
                    session.lock().disconnect(Some(e.to_string()));
                }
            },
        }
    }

    async fn session_signal(&mut self, signal: SessionSignal) {
        match signal {
            SessionSignal::Drain(session) => session.lock().drain_next(),
            SessionSignal::Ready(session) => {
                let (guild_id, disconnected) = {
                    let s = session.lock();
                    (s.guild_id(), s.is_disconnected())
                };
                if !disconnected {
                    session.lock().mark_ready();
                }
                if let Some(entry) = self.pending.take_armed(guild_id, &session) {
                    let result = if disconnected {
                        Err(LinkError::Disconnected)
                    } else {
                        info!("✅ Guild {} conectado", guild_id);
                        Ok(session.clone())
                    };
                    self.settle_waiter(entry.waiter, result);
                }
            }
            SessionSignal::StuckEnd(session, message) => session.lock().emit_end(message),
            SessionSignal::Disconnected(session) => {
                let guild_id = session.lock().guild_id();
                if self
                    .sessions
                    .get(&guild_id)
                    .is_some_and(|current| Arc::ptr_eq(current, &session))
                {
                    self.sessions.remove(&guild_id);
                    debug!("Sesión de guild {} eliminada", guild_id);
                }
                if let Some(entry) = self.pending.take_armed(guild_id, &session) {
                    self.settle_waiter(entry.waiter, Err(LinkError::Disconnected));
                }
            }
            SessionSignal::SwitchNode(session) => self.switch_node(session, false).await,
        }
    }

    fn leave(&mut self, guild_id: GuildId) {
        if let Some(session) = self.sessions.remove(&guild_id) {
            info!("👋 Saliendo de guild {}", guild_id);
            session.lock().disconnect(None);
        }
        // Los joins ya armados se resuelven con la señal de desconexión
        if let Some(entry) = self.pending.take_if(guild_id, |entry| !entry.armed) {
            self.fail_pending(guild_id, entry, LinkError::Disconnected);
        }
    }

    // Mensajes de nodo

    fn session_on(&self, guild_id: &str, node_key: &str) -> Option<SessionRef> {
        let guild_id = guild_from_wire(guild_id)?;
        self.sessions
            .get(&guild_id)
            .filter(|session| session.lock().node().key() == node_key)
            .cloned()
    }

    async fn on_message(&mut self, node_key: &str, message: Value) {
        let Some(node) = self.nodes.get(node_key).cloned() else {
            return;
        };
        let message = match IncomingMessage::from_value(message) {
            None => return,
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                warn!("⚠️ Mensaje inválido desde {}: {}", node_key, e);
                return;
            }
        };

        match message {
            IncomingMessage::Stats(stats) => {
                debug!("📊 {} reproduce {}/{}", node_key, stats.playing_players, stats.players);
            }
            IncomingMessage::PlayerUpdate { guild_id, state } => {
                if let Some(session) = self.session_on(&guild_id, node_key) {
                    session.lock().state_update(state);
                }
            }
            IncomingMessage::Event(event) => {
                let Some(session) = self.session_on(&event.guild_id, node_key) else {
                    return;
                };
                let mut s = session.lock();
                match event.event_kind() {
                    Some(TrackEventKind::End) => s.on_track_end(event),
                    Some(TrackEventKind::Exception) => s.on_track_exception(event),
                    Some(TrackEventKind::Stuck) => s.on_track_stuck(event),
                    None => s.emit(PlayerEvent::Warn(format!(
                        "Unexpected event type: {}",
                        event.kind
                    ))),
                }
            }
            IncomingMessage::ValidationReq {
                guild_id,
                channel_id,
            } => {
                let (channel_id, valid) = match channel_id.filter(|c| !c.is_empty()) {
                    None => (None, true),
                    Some(raw) => match parse_snowflake(&raw) {
                        Some(id) => match self.gateway.get_channel(ChannelId::new(id.get())).await {
                            Some(channel) => (Some(channel.to_string()), true),
                            None => (None, false),
                        },
                        None => (None, false),
                    },
                };
                node.send(&OutgoingMessage::ValidationRes {
                    guild_id,
                    channel_id,
                    valid,
                });
            }
            IncomingMessage::IsConnectedReq { shard_id } => {
                let connected = shard_connected(self.gateway.shard_stage(shard_id));
                node.send(&OutgoingMessage::IsConnectedRes {
                    shard_id,
                    connected,
                });
            }
            IncomingMessage::SendWs { shard_id, message } => self.relay(shard_id, &message).await,
            IncomingMessage::Unknown => debug!("Op desconocido desde {}", node_key),
        }
    }

    /// Forwards a node's raw gateway payload to its shard
    async fn relay(&mut self, shard_id: u64, raw: &str) {
        if !shard_connected(self.gateway.shard_stage(shard_id)) {
            debug!("Shard {} no conectado, sendWS descartado", shard_id);
            return;
        }
        let payload: GatewayPayload = match serde_json::from_str(raw) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("⚠️ sendWS con payload inválido: {}", e);
                return;
            }
        };

        let leaves_voice = payload.op == VOICE_STATE_UPDATE
            && payload.d.get("channel_id").is_some_and(Value::is_null);
        if leaves_voice {
            let guild_id = payload
                .d
                .get("guild_id")
                .and_then(Value::as_str)
                .and_then(guild_from_wire);
            if let Some(guild_id) = guild_id {
                if self.sessions.remove(&guild_id).is_some() {
                    info!("👋 Guild {} salió del canal de voz, sesión eliminada", guild_id);
                }
            }
        }

        if let Err(e) = self.gateway.send_ws(shard_id, payload.op, payload.d).await {
            warn!("⚠️ Falló el relay al shard {}: {}", shard_id, e);
        }
    }

    /// Destroys every node and fails whatever is still waiting
    pub fn shutdown(&mut self) {
        self.failover.clear();
        if let Some(timer) = self.failover_timer.take() {
            timer.abort();
        }
        for (_, entry) in self.pending.drain() {
            self.settle_waiter(entry.waiter, Err(LinkError::ManagerClosed));
        }
        self.sessions.clear();

        let nodes = std::mem::take(&mut self.nodes);
        if !nodes.is_empty() {
            info!("🛑 Cerrando {} nodos", nodes.len());
        }
        for node in nodes.values() {
            node.destroy();
        }
    }
}
