use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::identity::Identity;

/// Hex widths of the three clock components inside a rendered identity.
const PHYSICAL_HEX: usize = 16;
const LOGICAL_HEX: usize = 8;
const NODE_HEX: usize = 4;

/// Hybrid Logical Clock reading.
///
/// Combines a physical wall-clock component with a logical counter and a
/// node identifier. Ordering: `physical_ms` → `logical` → `node_id` (total
/// order), which is also the lexical order of [`ClockStamp::to_identity`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClockStamp {
    /// Wall-clock milliseconds since UNIX epoch.
    pub physical_ms: u64,
    /// Logical counter for stamps taken within the same physical millisecond.
    pub logical: u32,
    /// Node identifier to break ties between nodes.
    pub node_id: u16,
}

impl ClockStamp {
    /// Create a new stamp with explicit values.
    pub fn new(physical_ms: u64, logical: u32, node_id: u16) -> Self {
        Self {
            physical_ms,
            logical,
            node_id,
        }
    }

    /// A stamp for the current wall-clock time with a zero logical counter.
    pub fn now(node_id: u16) -> Self {
        let physical_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            physical_ms,
            logical: 0,
            node_id,
        }
    }

    /// The zero stamp.
    pub const fn zero() -> Self {
        Self {
            physical_ms: 0,
            logical: 0,
            node_id: 0,
        }
    }

    /// Render as a fixed-width hex identity whose lexical order equals the
    /// stamp order.
    pub fn to_identity(&self) -> Identity {
        Identity::from_trusted(format!(
            "{:0pw$x}{:0lw$x}{:0nw$x}",
            self.physical_ms,
            self.logical,
            self.node_id,
            pw = PHYSICAL_HEX,
            lw = LOGICAL_HEX,
            nw = NODE_HEX,
        ))
    }

    /// Parse a stamp back out of an identity produced by [`Self::to_identity`].
    pub fn from_identity(identity: &Identity) -> Result<Self, TypeError> {
        let s = identity.as_str();
        if s.len() != PHYSICAL_HEX + LOGICAL_HEX + NODE_HEX {
            return Err(TypeError::InvalidClockStamp(s.to_string()));
        }
        let parse_err = |_| TypeError::InvalidClockStamp(s.to_string());
        let physical_ms = u64::from_str_radix(&s[..PHYSICAL_HEX], 16).map_err(parse_err)?;
        let logical =
            u32::from_str_radix(&s[PHYSICAL_HEX..PHYSICAL_HEX + LOGICAL_HEX], 16).map_err(parse_err)?;
        let node_id =
            u16::from_str_radix(&s[PHYSICAL_HEX + LOGICAL_HEX..], 16).map_err(parse_err)?;
        Ok(Self::new(physical_ms, logical, node_id))
    }

    /// The smallest stamp for `node_id` that orders after this one at the
    /// same physical time. An exhausted logical counter carries into the
    /// next millisecond.
    pub fn successor(&self, node_id: u16) -> Self {
        match self.logical.checked_add(1) {
            Some(logical) => Self::new(self.physical_ms, logical, node_id),
            None => Self::new(self.physical_ms.saturating_add(1), 0, node_id),
        }
    }
}

impl PartialOrd for ClockStamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ClockStamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.physical_ms
            .cmp(&other.physical_ms)
            .then(self.logical.cmp(&other.logical))
            .then(self.node_id.cmp(&other.node_id))
    }
}

impl fmt::Debug for ClockStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ClockStamp({}ms.{}.n{})",
            self.physical_ms, self.logical, self.node_id
        )
    }
}

impl fmt::Display for ClockStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}@{}", self.physical_ms, self.logical, self.node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ordering_is_physical_then_logical_then_node() {
        let a = ClockStamp::new(10, 5, 9);
        let b = ClockStamp::new(11, 0, 0);
        let c = ClockStamp::new(11, 1, 0);
        let d = ClockStamp::new(11, 1, 1);
        assert!(a < b && b < c && c < d);
    }

    #[test]
    fn successor_orders_after_regardless_of_node() {
        let stamp = ClockStamp::new(10, 5, 9);
        assert_eq!(stamp.successor(1), ClockStamp::new(10, 6, 1));
        assert!(stamp.successor(0) > stamp);
        assert_eq!(
            ClockStamp::new(10, u32::MAX, 0).successor(0),
            ClockStamp::new(11, 0, 0)
        );
    }

    #[test]
    fn identity_round_trip() {
        let stamp = ClockStamp::new(1_700_000_000_000, 3, 2);
        let id = stamp.to_identity();
        assert_eq!(id.as_str().len(), 28);
        assert_eq!(ClockStamp::from_identity(&id).unwrap(), stamp);
    }

    #[test]
    fn from_identity_rejects_foreign_strings() {
        let id = Identity::from_sequence(1);
        assert!(matches!(
            ClockStamp::from_identity(&id),
            Err(TypeError::InvalidClockStamp(_))
        ));
    }

    proptest! {
        #[test]
        fn identity_order_matches_stamp_order(
            a in (any::<u64>(), any::<u32>(), any::<u16>()),
            b in (any::<u64>(), any::<u32>(), any::<u16>()),
        ) {
            let sa = ClockStamp::new(a.0, a.1, a.2);
            let sb = ClockStamp::new(b.0, b.1, b.2);
            prop_assert_eq!(sa.to_identity().cmp(&sb.to_identity()), sa.cmp(&sb));
        }
    }
}
