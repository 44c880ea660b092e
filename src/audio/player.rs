use serenity::model::id::{ChannelId, GuildId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

use crate::audio::session::{PlayerEvent, SessionRef};
use crate::error::Result;
use crate::gateway::GatewayClient;
use crate::protocol::{PlayOptions, PlayerState, VOICE_STATE_UPDATE};

/// Application handle to one guild's voice session.
///
/// Clones share the session. After a node failover the same handle keeps
/// working against the new node.
#[derive(Clone)]
pub struct Player {
    session: SessionRef,
    gateway: Arc<dyn GatewayClient>,
}

impl Player {
    pub(crate) fn new(session: SessionRef, gateway: Arc<dyn GatewayClient>) -> Self {
        Self { session, gateway }
    }

    #[cfg(test)]
    pub(crate) fn session(&self) -> &SessionRef {
        &self.session
    }

    pub fn guild_id(&self) -> GuildId {
        self.session.lock().guild_id()
    }

    pub fn channel_id(&self) -> ChannelId {
        self.session.lock().channel_id()
    }

    pub fn shard_id(&self) -> u64 {
        self.session.lock().shard_id()
    }

    /// Key of the node currently hosting this guild
    pub fn node(&self) -> String {
        self.session.lock().node().key().to_string()
    }

    pub fn track(&self) -> Option<String> {
        self.session.lock().track().map(str::to_string)
    }

    pub fn last_track(&self) -> Option<String> {
        self.session.lock().last_track().map(str::to_string)
    }

    pub fn is_playing(&self) -> bool {
        self.session.lock().is_playing()
    }

    pub fn is_paused(&self) -> bool {
        self.session.lock().is_paused()
    }

    pub fn volume(&self) -> Option<u16> {
        self.session.lock().volume()
    }

    pub fn state(&self) -> PlayerState {
        self.session.lock().state().clone()
    }

    pub fn position(&self) -> Option<u64> {
        self.session.lock().position()
    }

    /// Tiempo transcurrido desde el último `play`
    pub fn timestamp(&self) -> Duration {
        self.session.lock().timestamp()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.session.lock().subscribe()
    }

    pub fn play(&self, track: impl Into<String>, options: PlayOptions) {
        self.session.lock().play(track, options);
    }

    pub fn stop(&self) {
        self.session.lock().stop();
    }

    pub fn set_pause(&self, pause: bool) {
        self.session.lock().set_pause(pause);
    }

    pub fn pause(&self) {
        self.session.lock().pause();
    }

    pub fn resume(&self) {
        self.session.lock().resume();
    }

    pub fn seek(&self, position: u64) {
        self.session.lock().seek(position);
    }

    pub fn set_volume(&self, volume: u16) {
        self.session.lock().set_volume(volume);
    }

    /// Tears the session down; the manager drops it on its next turn
    pub fn disconnect(&self, reason: Option<String>) {
        self.session.lock().disconnect(reason);
    }

    /// Moves the bot to another channel of the same guild.
    ///
    /// With `reactive` the gateway is told to move; otherwise only the local
    /// record changes, for moves the gateway already performed.
    pub async fn switch_channel(&self, channel_id: ChannelId, reactive: bool) -> Result<()> {
        let (shard_id, payload) = {
            let mut session = self.session.lock();
            let payload = session.switch_channel(channel_id, reactive);
            (session.shard_id(), payload)
        };

        match payload {
            Some(payload) => {
                debug!("🔀 Cambiando a canal {} (shard {})", channel_id, shard_id);
                self.gateway.send_ws(shard_id, VOICE_STATE_UPDATE, payload).await
            }
            None => Ok(()),
        }
    }

    /// Sends a voice state update for this guild; `None` leaves the channel
    pub async fn update_voice_state(
        &self,
        channel_id: Option<ChannelId>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<()> {
        let (shard_id, payload) = {
            let session = self.session.lock();
            (
                session.shard_id(),
                session.voice_state_payload(channel_id, self_mute, self_deaf),
            )
        };
        self.gateway.send_ws(shard_id, VOICE_STATE_UPDATE, payload).await
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Player").field(&*self.session.lock()).finish()
    }
}
