use parking_lot::Mutex;
use serde_json::{json, Value};
use serenity::model::id::{ChannelId, GuildId};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::node::NodeConnection;
use crate::protocol::{OutgoingMessage, PlayOptions, PlayerState, TrackEvent, VoiceUpdateEvent};

/// Capacidad del canal de eventos por guild
const EVENT_CAPACITY: usize = 64;

pub type SessionRef = Arc<Mutex<VoiceSession>>;

/// Events a session publishes to the embedding application
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    Connect,
    Ready,
    End(TrackEvent),
    Error(TrackEvent),
    Warn(String),
    Disconnect(Option<String>),
    Reconnect,
}

/// Work a session hands back to the manager loop.
///
/// Everything here runs on a later turn of that loop, never inside the call
/// that produced it.
pub(crate) enum SessionSignal {
    /// Send the next queued command
    Drain(SessionRef),
    /// `connect` was acknowledged
    Ready(SessionRef),
    /// Emit `End` for a stuck track after its `stop`
    StuckEnd(SessionRef, TrackEvent),
    /// The session tore itself down
    Disconnected(SessionRef),
    /// The owning node is draining; move before playing
    SwitchNode(SessionRef),
}

pub(crate) type SignalSink = Arc<dyn Fn(SessionSignal) + Send + Sync>;

/// What a migration needs to restore on the replacement node
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MigrationSnapshot {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub track: Option<String>,
    pub paused: bool,
    pub position: u64,
}

/// One guild's voice link on one node.
///
/// Queued commands leave strictly in order, one per loop turn. `pause`,
/// `seek` and `volume` skip the queue.
pub struct VoiceSession {
    me: Weak<Mutex<VoiceSession>>,
    guild_id: GuildId,
    channel_id: ChannelId,
    shard_id: u64,
    session_id: Option<String>,
    voice_event: Option<VoiceUpdateEvent>,
    node: NodeConnection,
    track: Option<String>,
    last_track: Option<String>,
    play_options: PlayOptions,
    playing: bool,
    paused: bool,
    volume: Option<u16>,
    state: PlayerState,
    timestamp: Instant,
    queue: VecDeque<OutgoingMessage>,
    in_flight: bool,
    end_muted: bool,
    disconnected: bool,
    events: broadcast::Sender<PlayerEvent>,
    signals: SignalSink,
}

impl VoiceSession {
    pub(crate) fn create(
        guild_id: GuildId,
        channel_id: ChannelId,
        shard_id: u64,
        node: NodeConnection,
        signals: SignalSink,
    ) -> SessionRef {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new_cyclic(|me| {
            Mutex::new(Self {
                me: me.clone(),
                guild_id,
                channel_id,
                shard_id,
                session_id: None,
                voice_event: None,
                node,
                track: None,
                last_track: None,
                play_options: PlayOptions::default(),
                playing: false,
                paused: false,
                volume: None,
                state: PlayerState::default(),
                timestamp: Instant::now(),
                queue: VecDeque::new(),
                in_flight: false,
                end_muted: false,
                disconnected: false,
                events,
                signals,
            })
        })
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn shard_id(&self) -> u64 {
        self.shard_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn node(&self) -> &NodeConnection {
        &self.node
    }

    pub fn track(&self) -> Option<&str> {
        self.track.as_deref()
    }

    pub fn last_track(&self) -> Option<&str> {
        self.last_track.as_deref()
    }

    pub fn play_options(&self) -> &PlayOptions {
        &self.play_options
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    pub fn volume(&self) -> Option<u16> {
        self.volume
    }

    pub fn state(&self) -> &PlayerState {
        &self.state
    }

    /// Last position reported by the node
    pub fn position(&self) -> Option<u64> {
        self.state.position
    }

    /// Wall-clock time since the last `play`
    pub fn timestamp(&self) -> Duration {
        self.timestamp.elapsed()
    }

    /// Commands waiting behind the one in flight
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: PlayerEvent) {
        // Sin suscriptores el evento simplemente se pierde
        let _ = self.events.send(event);
    }

    fn signal(&self, make: impl FnOnce(SessionRef) -> SessionSignal) {
        if let Some(me) = self.me.upgrade() {
            (self.signals)(make(me));
        }
    }

    pub(crate) fn queue_event(&mut self, message: OutgoingMessage) {
        if self.in_flight || !self.queue.is_empty() {
            self.queue.push_back(message);
        } else {
            self.send_event(message);
        }
    }

    fn send_event(&mut self, message: OutgoingMessage) {
        debug!("🎛️ guild {} -> {} [{}]", self.guild_id, self.node.key(), message.op());
        self.node.send(&message);
        self.in_flight = true;
        self.signal(SessionSignal::Drain);
    }

    /// Releases the in-flight slot and sends the next queued command
    pub(crate) fn drain_next(&mut self) {
        self.in_flight = false;
        if let Some(next) = self.queue.pop_front() {
            self.send_event(next);
        }
    }

    /// Hands gateway credentials to the node; `Ready` follows on a later turn
    pub(crate) fn connect(&mut self, session_id: String, event: VoiceUpdateEvent) {
        self.emit(PlayerEvent::Connect);
        self.session_id = Some(session_id.clone());
        self.voice_event = Some(event.clone());
        self.queue_event(OutgoingMessage::VoiceUpdate {
            guild_id: self.guild_id.to_string(),
            session_id,
            event,
        });
        self.signal(SessionSignal::Ready);
    }

    pub(crate) fn mark_ready(&self) {
        self.emit(PlayerEvent::Ready);
    }

    pub fn play(&mut self, track: impl Into<String>, options: PlayOptions) {
        let track = track.into();
        self.last_track = self.track.replace(track.clone());
        self.play_options = options.clone();

        if self.node.is_draining() {
            // El nodo que se abandona ya no es dueño de la posición
            self.state.position = Some(0);
            info!("🚚 Nodo {} en drenaje, moviendo guild {}", self.node.key(), self.guild_id);
            self.signal(SessionSignal::SwitchNode);
            return;
        }

        self.queue_event(OutgoingMessage::play(self.guild_id, track, &options));
        self.playing = !self.paused;
        self.timestamp = Instant::now();
    }

    pub fn stop(&mut self) {
        self.queue_event(OutgoingMessage::Stop {
            guild_id: self.guild_id.to_string(),
        });
        self.playing = false;
        self.last_track = self.track.take();
    }

    pub fn set_pause(&mut self, pause: bool) {
        self.node.send(&OutgoingMessage::Pause {
            guild_id: self.guild_id.to_string(),
            pause,
        });
        self.playing = !pause;
        self.paused = pause;
    }

    pub fn pause(&mut self) {
        if self.playing {
            self.set_pause(true);
        }
    }

    pub fn resume(&mut self) {
        if self.paused {
            self.set_pause(false);
        }
    }

    pub fn seek(&mut self, position: u64) {
        self.node.send(&OutgoingMessage::Seek {
            guild_id: self.guild_id.to_string(),
            position,
        });
    }

    pub fn set_volume(&mut self, volume: u16) {
        self.node.send(&OutgoingMessage::Volume {
            guild_id: self.guild_id.to_string(),
            volume,
        });
        self.volume = Some(volume);
    }

    /// Replaces the cached snapshot; the node is the only source of position
    pub(crate) fn state_update(&mut self, state: PlayerState) {
        self.state = state;
    }

    pub(crate) fn on_track_end(&mut self, message: TrackEvent) {
        if !message.is_replaced() {
            self.playing = false;
            self.last_track = self.track.take();
        }
        self.emit_end(message);
    }

    pub(crate) fn on_track_exception(&mut self, message: TrackEvent) {
        self.emit(PlayerEvent::Error(message));
    }

    /// A stuck track counts as ended
    pub(crate) fn on_track_stuck(&mut self, message: TrackEvent) {
        self.stop();
        self.signal(|me| SessionSignal::StuckEnd(me, message));
    }

    pub(crate) fn emit_end(&self, message: TrackEvent) {
        if !self.end_muted {
            self.emit(PlayerEvent::End(message));
        }
    }

    /// Terminal for this session; later calls are ignored
    pub fn disconnect(&mut self, reason: Option<String>) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;

        if self.paused {
            self.resume();
        }
        self.queue_event(OutgoingMessage::Destroy {
            guild_id: self.guild_id.to_string(),
        });
        self.stop();
        self.emit(PlayerEvent::Disconnect(reason));
        self.signal(SessionSignal::Disconnected);
    }

    /// Updates the channel; returns the gateway payload to send when `reactive`
    pub(crate) fn switch_channel(&mut self, channel_id: ChannelId, reactive: bool) -> Option<Value> {
        if self.channel_id == channel_id {
            return None;
        }
        self.channel_id = channel_id;
        reactive.then(|| self.voice_state_payload(Some(channel_id), false, false))
    }

    /// Gateway op 4 body for this guild
    pub(crate) fn voice_state_payload(
        &self,
        channel_id: Option<ChannelId>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Value {
        json!({
            "guild_id": self.guild_id.to_string(),
            "channel_id": channel_id.map(|id| id.to_string()),
            "self_mute": self_mute,
            "self_deaf": self_deaf,
        })
    }

    /// Freezes what must survive a node switch and mutes `End` meanwhile
    pub(crate) fn begin_migration(&mut self, reconnect_threshold: u64) -> MigrationSnapshot {
        self.end_muted = true;
        self.playing = false;
        MigrationSnapshot {
            guild_id: self.guild_id,
            channel_id: self.channel_id,
            track: self.track.clone(),
            paused: self.paused,
            position: self
                .state
                .position
                .unwrap_or(0)
                .saturating_add(reconnect_threshold),
        }
    }

    /// Moves the session onto a new node with a fresh command queue
    pub(crate) fn rehome(&mut self, node: NodeConnection, shard_id: u64) {
        self.node = node;
        self.shard_id = shard_id;
        self.queue.clear();
        self.in_flight = false;
    }

    pub(crate) fn finish_migration(&mut self) {
        self.end_muted = false;
        self.emit(PlayerEvent::Reconnect);
    }
}

impl std::fmt::Debug for VoiceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceSession")
            .field("guild_id", &self.guild_id)
            .field("channel_id", &self.channel_id)
            .field("node", &self.node.key())
            .field("track", &self.track)
            .field("playing", &self.playing)
            .field("paused", &self.paused)
            .field("queued", &self.queue.len())
            .finish()
    }
}
