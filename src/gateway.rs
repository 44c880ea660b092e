//! External voice-gateway boundary.
//!
//! The gateway client (shards, channel cache, raw socket) lives outside this
//! crate. The manager only needs three things from it, captured by
//! [`GatewayClient`], plus the `VOICE_SERVER_UPDATE` payload it forwards in.

use async_trait::async_trait;
use serde_json::Value;
use serenity::gateway::ConnectionStage;
use serenity::model::id::{ChannelId, GuildId};
use tracing::info;

use crate::error::{LinkError, Result};

#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Resolves a channel the bot can see
    async fn get_channel(&self, channel_id: ChannelId) -> Option<ChannelId>;

    /// Connection stage of a shard, `None` when the shard is unknown
    fn shard_stage(&self, shard_id: u64) -> Option<ConnectionStage>;

    /// Writes a raw `{op, d}` payload on the shard's gateway socket
    async fn send_ws(&self, shard_id: u64, op: u8, payload: Value) -> Result<()>;
}

/// Gateway-issued voice credentials for one guild
#[derive(Debug, Clone)]
pub struct VoiceServerUpdate {
    pub guild_id: GuildId,
    pub session_id: String,
    pub endpoint: String,
    pub token: String,
    /// Accepted as delivered by the gateway but not read; the pending join's
    /// channel is the one the session binds to
    pub channel_id: Option<ChannelId>,
    pub shard_id: u64,
}

/// Gateway stand-in for running the control plane without a bot attached.
///
/// Knows no shards or channels; relayed payloads are only logged.
#[derive(Debug, Default)]
pub struct DetachedGateway;

#[async_trait]
impl GatewayClient for DetachedGateway {
    async fn get_channel(&self, _channel_id: ChannelId) -> Option<ChannelId> {
        None
    }

    fn shard_stage(&self, _shard_id: u64) -> Option<ConnectionStage> {
        None
    }

    async fn send_ws(&self, shard_id: u64, op: u8, payload: Value) -> Result<()> {
        info!("📡 Gateway desacoplado: shard {} op {} {}", shard_id, op, payload);
        Err(LinkError::gateway(format!("shard {shard_id} is not attached")))
    }
}
