// Ring addressing for the DHT
//
// Keys and nodes share one circular 128-bit identifier space. This module
// maps keys onto the ring, derives the evenly spaced replica positions for a
// key, and defines the topology view the DHT consumes from the overlay.

use crate::types::NodeInfo;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod membership;

pub use membership::{ConnectionState, MembershipTable, OverlayEvent};

/// Size in bytes of a ring position when used as a stored DHT key.
pub const POSITION_BYTES: usize = 16;

/// A point on the ring.
///
/// "Left" is the increasing direction: `a.is_left_of(b)` when `a` sits within
/// half a ring above `b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RingPosition(pub u128);

impl RingPosition {
    /// Half of the ring, the largest possible shortest-path distance.
    pub const HALF: u128 = 1 << 127;

    /// Hash an opaque key onto the ring.
    pub fn for_key(key: &[u8]) -> Self {
        let hash = blake3::hash(key);
        let mut raw = [0u8; POSITION_BYTES];
        raw.copy_from_slice(&hash.as_bytes()[..POSITION_BYTES]);
        Self(u128::from_be_bytes(raw))
    }

    /// Position of a node derived from its identifier.
    pub fn for_node_id(id: &str) -> Self {
        Self::for_key(id.as_bytes())
    }

    /// Read a stored DHT key back into a position.
    ///
    /// Replica writes always use the 16-byte encoding of a position; shorter
    /// keys are zero-padded on the right and longer keys truncated.
    pub fn from_stored_key(key: &[u8]) -> Self {
        let mut raw = [0u8; POSITION_BYTES];
        let len = key.len().min(POSITION_BYTES);
        raw[..len].copy_from_slice(&key[..len]);
        Self(u128::from_be_bytes(raw))
    }

    /// The key bytes a replica is stored under.
    pub fn to_key_bytes(self) -> [u8; POSITION_BYTES] {
        self.0.to_be_bytes()
    }

    /// Signed shortest distance from `self` to `other`.
    ///
    /// Positive when `other` is reached by walking up the ring. The exact
    /// antipode is reported as negative.
    pub fn distance_to(self, other: RingPosition) -> i128 {
        // forward distances of half a ring or more reinterpret as negative
        other.0.wrapping_sub(self.0) as i128
    }

    /// Absolute shortest distance between two positions.
    pub fn abs_distance(self, other: RingPosition) -> u128 {
        let forward = other.0.wrapping_sub(self.0);
        let backward = self.0.wrapping_sub(other.0);
        forward.min(backward)
    }

    /// Distance walked in the increasing direction from `self` to `other`.
    pub fn left_distance_to(self, other: RingPosition) -> u128 {
        other.0.wrapping_sub(self.0)
    }

    /// Distance walked in the decreasing direction from `self` to `other`.
    pub fn right_distance_to(self, other: RingPosition) -> u128 {
        self.0.wrapping_sub(other.0)
    }

    pub fn is_left_of(self, other: RingPosition) -> bool {
        other.distance_to(self) > 0
    }

    pub fn is_right_of(self, other: RingPosition) -> bool {
        other.distance_to(self) < 0
    }

    /// True when `self` lies strictly inside the arc walked upward from
    /// `start` to `end`.
    pub fn is_between_from_left(self, start: RingPosition, end: RingPosition) -> bool {
        if start == end {
            return false;
        }
        let span = start.left_distance_to(end);
        let offset = start.left_distance_to(self);
        offset > 0 && offset < span
    }

    /// True when `self` lies strictly inside the arc walked downward from
    /// `start` to `end`.
    pub fn is_between_from_right(self, start: RingPosition, end: RingPosition) -> bool {
        if start == end {
            return false;
        }
        let span = start.right_distance_to(end);
        let offset = start.right_distance_to(self);
        offset > 0 && offset < span
    }

    /// True when `self` lies on the shorter arc between the two bounds.
    ///
    /// The walk direction is chosen by which bound is ring-left of the other.
    pub fn is_on_short_arc(self, a: RingPosition, b: RingPosition) -> bool {
        if a.is_right_of(b) {
            self.is_between_from_left(a, b)
        } else {
            self.is_between_from_right(a, b)
        }
    }
}

impl fmt::Display for RingPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for RingPosition {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim_start_matches("0x");
        u128::from_str_radix(trimmed, 16).map(RingPosition)
    }
}

// Positions travel as hex strings; JSON and TOML both choke on u128 numbers.
impl From<RingPosition> for String {
    fn from(position: RingPosition) -> Self {
        position.to_string()
    }
}

impl TryFrom<String> for RingPosition {
    type Error = std::num::ParseIntError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

/// Number of replicas for a degree exponent `d` (`2^d`).
pub fn degree_for_exponent(exponent: u32) -> usize {
    1usize << exponent
}

/// Minimum confirming replicas required to trust a value or a write.
pub fn majority(degree: usize) -> usize {
    degree / 2 + 1
}

/// The `degree` ring positions a key is replicated at.
///
/// Position 0 is the key's hash; every further position adds an equal share
/// of the ring. Pure function of the key and the degree.
pub fn replica_positions(key: &[u8], degree: usize) -> Vec<RingPosition> {
    let first = RingPosition::for_key(key);
    let step = ring_step(degree);
    (0..degree)
        .map(|i| RingPosition(first.0.wrapping_add(step.wrapping_mul(i as u128))))
        .collect()
}

/// `2^128 / degree` for the power-of-two degrees the DHT uses.
fn ring_step(degree: usize) -> u128 {
    if degree <= 1 {
        0
    } else {
        (u128::MAX / degree as u128).wrapping_add(1)
    }
}

/// Topology view of the structured overlay as consumed by the DHT.
pub trait RingTopology: Send + Sync {
    /// The node this DHT instance runs on.
    fn local_node(&self) -> NodeInfo;

    /// The node currently responsible for a ring position.
    fn closest_node(&self, position: RingPosition) -> Option<NodeInfo>;

    /// Nearest structured neighbor in the increasing direction.
    fn left_neighbor(&self) -> Option<NodeInfo>;

    /// Nearest structured neighbor in the decreasing direction.
    fn right_neighbor(&self) -> Option<NodeInfo>;
}
