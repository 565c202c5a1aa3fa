//! Correlation ids: link a produced message to its processing outcome.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Opaque correlation id chosen by the producer.
///
/// `None` inside means "no correlation assigned", which is distinct from an id
/// whose 128 bits happen to be zero. Serializes as a ULID string or `null`, so
/// the value never depends on the producing process's memory layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Option<Ulid>);

impl CorrelationId {
    /// A correlation id with no value.
    pub const fn none() -> Self {
        Self(None)
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(Some(ulid))
    }

    pub fn has_value(&self) -> bool {
        self.0.is_some()
    }

    pub fn value(&self) -> Option<Ulid> {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(ulid) => fmt::Display::fmt(&ulid, f),
            None => f.write_str("-"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid correlation id '{input}': {reason}")]
pub struct CorrelationParseError {
    input: String,
    reason: String,
}

impl FromStr for CorrelationId {
    type Err = CorrelationParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s)
            .map(Self::from_ulid)
            .map_err(|e| CorrelationParseError {
                input: s.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Generates and validates correlation ids.
///
/// Stateless: uniqueness comes from the ULID random component, so several
/// producer processes can mint ids without coordinating.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrelationRegistry;

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self
    }

    pub fn generate(&self) -> CorrelationId {
        CorrelationId::from_ulid(Ulid::new())
    }

    /// Use the caller's id when it carries a value, otherwise mint one.
    pub fn resolve(&self, requested: Option<CorrelationId>) -> CorrelationId {
        match requested {
            Some(id) if id.has_value() => id,
            _ => self.generate(),
        }
    }

    pub fn parse(&self, s: &str) -> Result<CorrelationId, CorrelationParseError> {
        s.parse()
    }
}
