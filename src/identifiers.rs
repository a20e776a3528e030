// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed identifiers shared by all verification steps.
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unix timestamp in milliseconds.
pub type Timestamp = u64;

/// Identifier of a user within the messaging system.
///
/// Treated as an opaque string; the ordering used by the simultaneous-start tie-break is plain
/// lexicographic byte comparison.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Identifier of one device (session) of a user.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Identity of one verification attempt between two parties.
///
/// Exactly one of the two forms is used for the whole lifetime of an attempt: an opaque token
/// (device-to-device transports) or a reference to the originating request event (conversation
/// timeline transports). Immutable once constructed.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum TransactionId {
    #[serde(rename = "transaction_id")]
    Opaque(String),
    #[serde(rename = "m.relates_to")]
    Reference(RequestReference),
}

impl TransactionId {
    pub fn opaque(id: impl Into<String>) -> Self {
        Self::Opaque(id.into())
    }

    pub fn reference(event_id: impl Into<String>) -> Self {
        Self::Reference(RequestReference {
            rel_type: "m.reference".to_owned(),
            event_id: event_id.into(),
        })
    }

    /// String form used inside info strings for code derivation and MAC computation.
    pub fn id_str(&self) -> &str {
        match self {
            Self::Opaque(id) => id,
            Self::Reference(reference) => &reference.event_id,
        }
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id_str())
    }
}

/// Reference to the request event an in-conversation verification relates to.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RequestReference {
    pub rel_type: String,
    pub event_id: String,
}
