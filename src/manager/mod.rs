//! # Manager Module
//!
//! Orchestrates audio nodes and the per-guild sessions placed on them.
//!
//! One task owns the node registry, the session registry, the pending joins
//! and the failover queue. Everything reaches it as a [`ManagerEvent`] on a
//! single FIFO channel: application commands, node events, session signals
//! and timers. Work deferred "to the next turn" is just another event pushed
//! to the back of that channel.
//!
//! ### [`region`] - Placement
//! - Endpoint → region bucket routing, honouring only buckets with a live node
//! - Least-loaded ready node, regional subset first
//!
//! ### [`failover`] - Failover Queue
//! - Migrations released `failover_limit` at a time every `failover_rate`
//!
//! ### Join handshake
//! - `join` picks a node, sends `connect` and waits for gateway credentials
//! - `voice_server_update` creates or rehomes the session and connects it
//! - Ready, disconnect and timeout race to settle the join; the first wins

mod actor;
pub(crate) mod failover;
pub(crate) mod pending;
pub mod region;

use std::sync::Arc;
use std::time::Duration;

use serenity::model::id::{ChannelId, GuildId, UserId};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use self::actor::{Flow, ManagerCore};
use crate::audio::session::{MigrationSnapshot, SessionSignal};
use crate::audio::{Player, SessionRef};
use crate::error::{LinkError, Result};
use crate::gateway::{GatewayClient, VoiceServerUpdate};
use crate::node::{NodeAddress, NodeEvent, NodeStatus};
pub use region::{default_buckets, RegionBuckets};

/// Tunables shared by every node and session the manager creates
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub user_id: UserId,
    pub password: String,
    pub num_shards: u64,
    /// Delay between failover batches
    pub failover_rate: Duration,
    /// Migrations per batch
    pub failover_limit: usize,
    /// Added to the last reported position when resuming elsewhere
    pub reconnect_threshold: Duration,
    pub join_timeout: Duration,
    pub default_region: String,
    pub regions: RegionBuckets,
}

impl ManagerOptions {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            password: "youshallnotpass".to_string(),
            num_shards: 1,
            failover_rate: Duration::from_millis(250),
            failover_limit: 1,
            reconnect_threshold: Duration::from_millis(2000),
            join_timeout: Duration::from_secs(10),
            default_region: "us".to_string(),
            regions: default_buckets(),
        }
    }
}

/// Per-join placement hints
#[derive(Debug, Clone, Default)]
pub struct JoinOptions {
    /// Voice endpoint (or region key) used to pick a regional node
    pub region: Option<String>,
}

impl JoinOptions {
    pub fn in_region(endpoint: impl Into<String>) -> Self {
        Self {
            region: Some(endpoint.into()),
        }
    }
}

pub(crate) enum Command {
    Join {
        guild_id: GuildId,
        channel_id: ChannelId,
        options: JoinOptions,
        reply: oneshot::Sender<Result<Player>>,
    },
    VoiceServerUpdate(VoiceServerUpdate),
    ShardReady(u64),
    Leave {
        guild_id: GuildId,
        reply: oneshot::Sender<()>,
    },
    CreateNode {
        address: NodeAddress,
        reply: oneshot::Sender<bool>,
    },
    RemoveNode {
        key: String,
        reply: oneshot::Sender<bool>,
    },
    SetDraining {
        key: String,
        draining: bool,
        reply: oneshot::Sender<bool>,
    },
    Nodes {
        reply: oneshot::Sender<Vec<NodeStatus>>,
    },
    Get {
        guild_id: GuildId,
        reply: oneshot::Sender<Option<Player>>,
    },
    Players {
        reply: oneshot::Sender<Vec<GuildId>>,
    },
    FindIdealNode {
        region: Option<String>,
        reply: oneshot::Sender<Option<String>>,
    },
    RegionFor {
        endpoint: Option<String>,
        reply: oneshot::Sender<String>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Everything the manager task reacts to
pub(crate) enum ManagerEvent {
    Command(Command),
    Node(NodeEvent),
    Session(SessionSignal),
    JoinTimeout { guild_id: GuildId, join_id: u64 },
    FailoverTick,
    Rejoin {
        session: SessionRef,
        snapshot: MigrationSnapshot,
    },
}

/// Cloneable handle to the manager task.
///
/// The task stops when the last handle is dropped or on
/// [`shutdown`](Self::shutdown). Players outliving it no longer drain their
/// queues.
#[derive(Clone)]
pub struct PlayerManager {
    tx: mpsc::UnboundedSender<ManagerEvent>,
}

impl std::fmt::Debug for PlayerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerManager")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl PlayerManager {
    /// Spawns the manager task and starts connecting to `nodes`.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(
        nodes: impl IntoIterator<Item = NodeAddress>,
        options: ManagerOptions,
        gateway: Arc<dyn GatewayClient>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut core = ManagerCore::new(options, gateway, tx.downgrade());
        for address in nodes {
            core.create_node(address);
        }
        tokio::spawn(run(core, rx));
        Self { tx }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(ManagerEvent::Command(command))
            .map_err(|_| LinkError::ManagerClosed)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply))?;
        rx.await.map_err(|_| LinkError::ManagerClosed)
    }

    /// Joins a voice channel, resolving once the node acknowledges the credentials.
    ///
    /// With a session already in the guild this only switches its channel.
    pub async fn join(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        options: JoinOptions,
    ) -> Result<Player> {
        self.request(|reply| Command::Join {
            guild_id,
            channel_id,
            options,
            reply,
        })
        .await?
    }

    /// Forwards gateway voice credentials
    pub fn voice_server_update(&self, data: VoiceServerUpdate) -> Result<()> {
        self.send(Command::VoiceServerUpdate(data))
    }

    /// A gateway shard (re)connected; its voice links are re-established
    pub fn shard_ready(&self, shard_id: u64) -> Result<()> {
        self.send(Command::ShardReady(shard_id))
    }

    pub async fn leave(&self, guild_id: GuildId) -> Result<()> {
        self.request(|reply| Command::Leave { guild_id, reply }).await
    }

    /// Adds and connects a node; `false` when its key is already registered
    pub async fn create_node(&self, address: NodeAddress) -> Result<bool> {
        self.request(|reply| Command::CreateNode { address, reply })
            .await
    }

    /// Destroys a node and fails its sessions over
    pub async fn remove_node(&self, key: impl Into<String>) -> Result<bool> {
        let key = key.into();
        self.request(|reply| Command::RemoveNode { key, reply }).await
    }

    pub async fn set_draining(&self, key: impl Into<String>, draining: bool) -> Result<bool> {
        let key = key.into();
        self.request(|reply| Command::SetDraining {
            key,
            draining,
            reply,
        })
        .await
    }

    pub async fn nodes(&self) -> Result<Vec<NodeStatus>> {
        self.request(|reply| Command::Nodes { reply }).await
    }

    pub async fn get(&self, guild_id: GuildId) -> Result<Option<Player>> {
        self.request(|reply| Command::Get { guild_id, reply }).await
    }

    /// Guilds with a registered session
    pub async fn players(&self) -> Result<Vec<GuildId>> {
        self.request(|reply| Command::Players { reply }).await
    }

    /// Key of the node a new session in `region` would land on
    pub async fn find_ideal_node(&self, region: Option<&str>) -> Result<Option<String>> {
        let region = region.map(str::to_string);
        self.request(|reply| Command::FindIdealNode { region, reply })
            .await
    }

    /// Region key chosen for a voice endpoint
    pub async fn region_for(&self, endpoint: Option<&str>) -> Result<String> {
        let endpoint = endpoint.map(str::to_string);
        self.request(|reply| Command::RegionFor { endpoint, reply })
            .await
    }

    /// Closes every node and stops the task
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

async fn run(mut core: ManagerCore, mut events: mpsc::UnboundedReceiver<ManagerEvent>) {
    while let Some(event) = events.recv().await {
        if core.handle(event).await == Flow::Stop {
            break;
        }
    }
    core.shutdown();
    debug!("Manager detenido");
}
