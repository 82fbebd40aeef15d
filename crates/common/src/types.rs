//! Common data types for the real-time channel engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A user identifier within a channel.
///
/// `0` is reserved: in a join request it asks the server to assign an id,
/// and in reports it denotes the local user.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Uid(pub u32);

impl Uid {
    /// The local user / "assign automatically".
    pub const LOCAL: Uid = Uid(0);

    /// Whether this is the reserved local id.
    #[must_use]
    pub const fn is_local(self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for Uid {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one participation in a channel, generated per join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Caller-chosen identifier of a data stream, unique within a session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct DataStreamId(pub u16);

impl From<u16> for DataStreamId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl fmt::Display for DataStreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
