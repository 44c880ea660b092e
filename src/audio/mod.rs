//! # Audio Module
//!
//! Per-guild voice sessions hosted on an audio node.
//!
//! ### [`session`] - Voice Session
//! - Playback state mirrored from the node (`track`, `paused`, position)
//! - Ordered command queue: one command leaves per manager turn
//! - `pause`, `seek` and `volume` bypass the queue
//!
//! ### [`player`] - Player Handle
//! - Cloneable application-facing handle over a session
//! - Voice state updates relayed through the gateway client
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use voicelink::audio::PlayerEvent;
//! use voicelink::protocol::PlayOptions;
//! # async fn example(player: voicelink::audio::Player) {
//! let mut events = player.subscribe();
//! player.play("QAAAjQIAJVJpY2sgQXN0bGV5", PlayOptions::default());
//!
//! while let Ok(event) = events.recv().await {
//!     if let PlayerEvent::End(_) = event {
//!         break;
//!     }
//! }
//! # }
//! ```

pub mod player;
pub mod session;

pub use player::Player;
pub use session::{PlayerEvent, SessionRef, VoiceSession};
