use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier for a logical stream within a session.
///
/// Locally initiated ids keep the parity of the session side: odd for
/// clients, even for servers.
#[derive(Deserialize, Serialize, Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

impl StreamId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
    pub fn id(&self) -> u32 {
        self.0
    }
    /// Whether this id was issued by the client side of a session.
    pub fn is_client_initiated(&self) -> bool {
        self.0 % 2 == 1
    }
}

impl nohash_hasher::IsEnabled for StreamId {}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
