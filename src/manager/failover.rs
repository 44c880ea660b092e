use std::collections::VecDeque;

/// Rate-limited queue of migration actions.
///
/// The first action pushed while idle runs at once and arms the batch timer;
/// anything pushed while the timer is armed waits for a tick. Each tick
/// releases up to `limit` actions and re-arms only if it released something.
#[derive(Debug)]
pub(crate) struct FailoverQueue<A> {
    pending: VecDeque<A>,
    limit: usize,
    armed: bool,
}

impl<A> FailoverQueue<A> {
    pub fn new(limit: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            limit: limit.max(1),
            armed: false,
        }
    }

    /// Returns the action back when it must run now; the caller then arms the timer
    pub fn push(&mut self, action: A) -> Option<A> {
        if self.pending.is_empty() && !self.armed {
            self.armed = true;
            Some(action)
        } else {
            self.pending.push_back(action);
            None
        }
    }

    /// Next batch; when non-empty the caller re-arms the timer
    pub fn tick(&mut self) -> Vec<A> {
        let take = self.limit.min(self.pending.len());
        let batch: Vec<A> = self.pending.drain(..take).collect();
        self.armed = !batch.is_empty();
        batch
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.armed = false;
    }
}
