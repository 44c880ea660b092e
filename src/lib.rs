//! # voicelink
//!
//! Control-plane client for external audio nodes speaking the Lavalink
//! WebSocket protocol.
//!
//! - [`node`]: one reconnecting WebSocket per node, with load statistics
//! - [`audio`]: per-guild voice sessions and the [`Player`] handle
//! - [`manager`]: node registry, placement, join handshake and failover
//! - [`gateway`]: what the embedding bot must provide
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serenity::model::id::{ChannelId, GuildId, UserId};
//! use voicelink::{DetachedGateway, JoinOptions, ManagerOptions, NodeAddress, PlayerManager};
//!
//! # async fn example() -> voicelink::Result<()> {
//! let nodes = vec!["localhost:2333@us".parse::<NodeAddress>()?];
//! let manager = PlayerManager::new(
//!     nodes,
//!     ManagerOptions::new(UserId::new(1234)),
//!     Arc::new(DetachedGateway),
//! );
//!
//! // Resuelve cuando llega el voice server update del gateway
//! let player = manager
//!     .join(GuildId::new(1), ChannelId::new(5), JoinOptions::default())
//!     .await?;
//! player.play("QAAAjQIAJVJpY2sgQXN0bGV5", Default::default());
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod gateway;
pub mod manager;
pub mod node;
pub mod protocol;

pub use audio::{Player, PlayerEvent};
pub use config::Config;
pub use error::{LinkError, Result};
pub use gateway::{DetachedGateway, GatewayClient, VoiceServerUpdate};
pub use manager::{JoinOptions, ManagerOptions, PlayerManager};
pub use node::{NodeAddress, NodeState, NodeStatus};
pub use protocol::PlayOptions;
