use crate::models::{Consistency, ConsistencyToken};
use parking_lot::RwLock;

/// Holds the most recently observed consistency token.
///
/// Every write stores the token it received and every read or check asks the
/// permission service for a view at least as fresh as the stored token. The
/// store is last-writer-wins: tokens are not compared, so a slow response can
/// move the floor backwards when responses are reordered.
#[derive(Debug, Default)]
pub struct ConsistencyTracker {
    latest: RwLock<Option<ConsistencyToken>>,
}

impl ConsistencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest observed token, `None` until the first write.
    pub fn load(&self) -> Option<ConsistencyToken> {
        self.latest.read().clone()
    }

    pub fn store(&self, token: ConsistencyToken) {
        *self.latest.write() = Some(token);
    }

    /// Consistency requirement for the next read or check.
    pub fn requirement(&self) -> Consistency {
        Consistency::from(self.load())
    }
}
