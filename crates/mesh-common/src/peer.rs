//! Peer identity and the initiator tie-break.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identity of a call participant, unique within one call.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `self` is the side that sends the offer to `remote`.
    ///
    /// The lexicographically smaller id initiates. Both sides evaluate this
    /// with swapped arguments and always reach complementary answers, so
    /// exactly one of them offers regardless of event arrival order.
    pub fn initiates_to(&self, remote: &PeerId) -> bool {
        self < remote
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}
