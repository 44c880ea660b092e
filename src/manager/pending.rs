use std::collections::HashMap;
use std::sync::Arc;

use serenity::model::id::{ChannelId, GuildId};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::audio::session::{MigrationSnapshot, SessionRef};
use crate::audio::Player;
use crate::error::Result;
use crate::node::NodeConnection;

/// Who is waiting on a join
pub(crate) enum JoinWaiter {
    /// An application `join` call
    Caller(oneshot::Sender<Result<Player>>),
    /// A node switch resuming `session` once rejoined
    Failover {
        session: SessionRef,
        snapshot: MigrationSnapshot,
    },
}

/// In-flight join for one guild
pub(crate) struct PendingJoin {
    pub join_id: u64,
    pub channel_id: ChannelId,
    pub node: NodeConnection,
    /// Session being rehomed, or the one created once credentials arrive
    pub session: Option<SessionRef>,
    pub waiter: JoinWaiter,
    pub timeout: JoinHandle<()>,
    /// Credentials delivered; only `ready` or `disconnect` settle it now
    pub armed: bool,
}

/// Pending joins keyed by guild.
///
/// Every outcome settles through [`take_if`](Self::take_if), so an entry is
/// removed at most once and later outcomes find nothing.
#[derive(Default)]
pub(crate) struct PendingJoins {
    entries: HashMap<GuildId, PendingJoin>,
    next_id: u64,
}

impl PendingJoins {
    pub fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Registers `entry`, handing back any entry it supersedes
    pub fn insert(&mut self, guild_id: GuildId, entry: PendingJoin) -> Option<PendingJoin> {
        let previous = self.entries.insert(guild_id, entry);
        if let Some(previous) = &previous {
            previous.timeout.abort();
        }
        previous
    }

    pub fn get_mut(&mut self, guild_id: GuildId) -> Option<&mut PendingJoin> {
        self.entries.get_mut(&guild_id)
    }

    #[cfg(test)]
    pub fn contains(&self, guild_id: GuildId) -> bool {
        self.entries.contains_key(&guild_id)
    }

    /// Removes the entry if `accept` agrees, cancelling its timeout
    pub fn take_if(
        &mut self,
        guild_id: GuildId,
        accept: impl FnOnce(&PendingJoin) -> bool,
    ) -> Option<PendingJoin> {
        if !accept(self.entries.get(&guild_id)?) {
            return None;
        }
        let entry = self.entries.remove(&guild_id)?;
        entry.timeout.abort();
        Some(entry)
    }

    /// Entry whose credentials were delivered to `session`
    pub fn take_armed(&mut self, guild_id: GuildId, session: &SessionRef) -> Option<PendingJoin> {
        self.take_if(guild_id, |entry| {
            entry.armed
                && entry
                    .session
                    .as_ref()
                    .is_some_and(|own| Arc::ptr_eq(own, session))
        })
    }

    pub fn drain(&mut self) -> Vec<(GuildId, PendingJoin)> {
        let entries: Vec<_> = self.entries.drain().collect();
        for (_, entry) in &entries {
            entry.timeout.abort();
        }
        entries
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::connection::test_support::{channel_sink, options};

    fn entry(pending: &mut PendingJoins) -> (PendingJoin, oneshot::Receiver<Result<Player>>) {
        let (sink, _events) = channel_sink();
        let (node, _frames) = NodeConnection::attached(options("a", None), sink);
        let (tx, rx) = oneshot::channel();
        let entry = PendingJoin {
            join_id: pending.next_id(),
            channel_id: ChannelId::new(5),
            node,
            session: None,
            waiter: JoinWaiter::Caller(tx),
            timeout: tokio::spawn(std::future::pending()),
            armed: false,
        };
        (entry, rx)
    }

    #[tokio::test]
    async fn test_settles_once() {
        let mut pending = PendingJoins::default();
        let guild = GuildId::new(1);
        let (first, _rx) = entry(&mut pending);
        let id = first.join_id;
        assert!(pending.insert(guild, first).is_none());

        assert!(pending.take_if(guild, |e| e.join_id == id + 1).is_none());
        assert!(pending.contains(guild));

        let taken = pending.take_if(guild, |e| e.join_id == id).unwrap();
        assert_eq!(taken.join_id, id);
        assert!(pending.take_if(guild, |_| true).is_none());
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn test_insert_supersedes_and_cancels_timer() {
        let mut pending = PendingJoins::default();
        let guild = GuildId::new(1);
        let (first, _rx1) = entry(&mut pending);
        let (second, _rx2) = entry(&mut pending);
        assert_ne!(first.join_id, second.join_id);

        pending.insert(guild, first);
        let old = pending.insert(guild, second).unwrap();
        assert_eq!(pending.len(), 1);
        let cancelled = old.timeout.await.unwrap_err();
        assert!(cancelled.is_cancelled());
    }

    #[tokio::test]
    async fn test_unarmed_entry_ignores_ready() {
        let mut pending = PendingJoins::default();
        let guild = GuildId::new(1);
        let (first, _rx) = entry(&mut pending);
        pending.insert(guild, first);

        let (sink, _events) = channel_sink();
        let (node, _frames) = NodeConnection::attached(options("b", None), sink);
        let (signals, _signal_rx) = crate::audio::session::test_support::signal_sink();
        let session =
            crate::audio::VoiceSession::create(guild, ChannelId::new(5), 0, node, signals);

        assert!(pending.take_armed(guild, &session).is_none());

        let entry = pending.get_mut(guild).unwrap();
        entry.session = Some(session.clone());
        entry.armed = true;
        assert!(pending.take_armed(guild, &session).is_some());
    }
}
