use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Width of a sequence-based identity rendering (`u64::MAX` has 20 digits).
const SEQUENCE_WIDTH: usize = 20;

/// Identity of an event, entity, or transaction.
///
/// Identities are opaque strings handed out by a storage backend's identity
/// generator. Generators render them at a fixed width so that the lexical
/// order of two identities equals their allocation order; the derived `Ord`
/// is therefore the replay order of events that share a root.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Create an identity from an arbitrary string.
    ///
    /// Rejects empty strings and strings containing whitespace.
    pub fn new(value: impl Into<String>) -> Result<Self, TypeError> {
        let value = value.into();
        if value.is_empty() || value.chars().any(char::is_whitespace) {
            return Err(TypeError::InvalidIdentity(value));
        }
        Ok(Self(value))
    }

    /// Wrap a generator-rendered string that is known to be non-empty ASCII.
    pub(crate) fn from_trusted(value: String) -> Self {
        Self(value)
    }

    /// Render a sequence number as a zero-padded, order-preserving identity.
    pub fn from_sequence(seq: u64) -> Self {
        Self(format!("{seq:0width$}", width = SEQUENCE_WIDTH))
    }

    /// Parse the sequence number back out of a sequence-based identity.
    ///
    /// Returns `None` for identities produced by other generators.
    pub fn sequence(&self) -> Option<u64> {
        if self.0.len() != SEQUENCE_WIDTH {
            return None;
        }
        self.0.parse().ok()
    }

    /// The identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.0)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identity {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Identity {
    fn borrow(&self) -> &str {
        &self.0
    }
}
