//! # sievekv-types: Core types for the sievekv cluster
//!
//! This crate contains shared types used across the system:
//! - Identity ([`ProcessId`], [`Epoch`])
//! - Payload scalars ([`Scalar`], [`Operation`])
//! - Protocol phases ([`Phase`])
//! - The committed [`Dictionary`]

use std::collections::HashMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

// ============================================================================
// Identity
// ============================================================================

/// Replica ids start at 1; ids at or above this floor belong to clients.
///
/// The well-known operator client is exactly `CLIENT_ID_FLOOR`; further
/// clients take the id matching their port (`port - 8000`), and transient
/// peers on high ports are assigned ids from [`TRANSIENT_CLIENT_BASE`].
pub const CLIENT_ID_FLOOR: u64 = 1000;

/// First id handed out to transient client peers (unknown source ports above
/// the datagram classification threshold). Port-derived ids top out at 2000,
/// so these can never collide.
pub const TRANSIENT_CLIENT_BASE: u64 = 10_001;

/// Unique identifier for a process in the cluster: a replica (`1..=N`) or a
/// client (`>= CLIENT_ID_FLOOR`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessId(u64);

impl ProcessId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true if this id belongs to a client peer.
    pub const fn is_client(self) -> bool {
        self.0 >= CLIENT_ID_FLOOR
    }

    /// Returns true if this id belongs to a replica peer.
    pub const fn is_replica(self) -> bool {
        self.0 < CLIENT_ID_FLOOR
    }
}

impl Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ProcessId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<ProcessId> for u64 {
    fn from(id: ProcessId) -> Self {
        id.0
    }
}

/// Epoch counter (the `config` of the protocol). Monotonically non-decreasing
/// on every replica; an epoch change installs `epoch + 1` together with the
/// new leader.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Epoch(u64);

impl Epoch {
    pub const ZERO: Epoch = Epoch(0);

    pub const fn new(e: u64) -> Self {
        Self(e)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The epoch proposed by a leader-change round.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Byzantine fault bound for a cluster of `n` replicas: `f = (n - 1) / 3`.
pub const fn fault_bound(n: usize) -> usize {
    (n - 1) / 3
}

// ============================================================================
// Scalars and operations
// ============================================================================

/// An opaque payload scalar. The protocol core never interprets these beyond
/// equality, hashing and dictionary insertion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl Scalar {
    pub const fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }
}

impl Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => write!(f, "null"),
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Int(i) => write!(f, "{i}"),
            Scalar::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

/// A client operation: insert `value` under `key` in the shared dictionary.
/// Serialised as a two-element array, matching the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Operation(pub Scalar, pub Scalar);

impl Operation {
    pub fn new(key: impl Into<Scalar>, value: impl Into<Scalar>) -> Self {
        Self(key.into(), value.into())
    }

    pub fn key(&self) -> &Scalar {
        &self.0
    }

    pub fn value(&self) -> &Scalar {
        &self.1
    }

    /// The canonical form digested by response signatures. Distinct
    /// operations must map to distinct strings, so both parts are
    /// length-prefixed.
    pub fn canonical(&self) -> String {
        let k = self.0.to_string();
        let v = self.1.to_string();
        format!("{}:{k}|{}:{v}", k.len(), v.len())
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.0, self.1)
    }
}

/// The committed state: key to last-committed value.
pub type Dictionary = HashMap<Scalar, Scalar>;

/// Broadcast fan-out scope: the replica half of the peer table or the client
/// half, split at [`CLIENT_ID_FLOOR`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Replicas,
    Clients,
}

impl Scope {
    /// Whether `pid` falls inside this scope.
    pub fn contains(self, pid: ProcessId) -> bool {
        match self {
            Scope::Replicas => pid.is_replica(),
            Scope::Clients => pid.is_client(),
        }
    }
}

// ============================================================================
// Protocol phases
// ============================================================================

/// The phase of a replica's protocol engine (`s`), also carried on the wire
/// as the speculative state `tc`. The numeric codes are part of the wire
/// format and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Phase {
    /// Idle; the leader admits the next buffered operation from here.
    S0 = 0,
    /// Speculatively executing the current operation.
    Elaboration = 2,
    /// Leader has executed and is gathering APPROVEs.
    WaitingApproval = 3,
    /// Driving (or waiting out) a leader change round.
    NewConfig = 6,
    /// Follower has executed and awaits the leader's ORDER.
    WaitingOrder = 7,
    /// Speculative outcome: the operation will commit.
    Commit = 8,
    /// Speculative outcome: the operation will abort.
    Abort = 9,
    /// Terminal; all tasks stop and the socket closes.
    Closing = 10,
    /// Leader is gathering VALIDATIONs for its ORDER.
    WaitingValidation = 11,
}

impl From<Phase> for u8 {
    fn from(p: Phase) -> Self {
        p as u8
    }
}

impl TryFrom<u8> for Phase {
    type Error = UnknownPhase;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Phase::S0),
            2 => Ok(Phase::Elaboration),
            3 => Ok(Phase::WaitingApproval),
            6 => Ok(Phase::NewConfig),
            7 => Ok(Phase::WaitingOrder),
            8 => Ok(Phase::Commit),
            9 => Ok(Phase::Abort),
            10 => Ok(Phase::Closing),
            11 => Ok(Phase::WaitingValidation),
            other => Err(UnknownPhase(other)),
        }
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::S0 => "S0",
            Phase::Elaboration => "ELABORATION",
            Phase::WaitingApproval => "WAITING_APPROVAL",
            Phase::NewConfig => "NEW_CONFIG",
            Phase::WaitingOrder => "WAITING_ORDER",
            Phase::Commit => "COMMIT",
            Phase::Abort => "ABORT",
            Phase::Closing => "CLOSING",
            Phase::WaitingValidation => "WAITING_VALIDATION",
        };
        write!(f, "{name}")
    }
}

/// Error for a phase code outside the wire enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown phase code {0}")]
pub struct UnknownPhase(pub u8);
