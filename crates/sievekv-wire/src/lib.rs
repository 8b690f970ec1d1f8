//! Sieve protocol wire records.
//!
//! Every datagram carries one [`Message`]: a `type` tag plus an open set of
//! optional fields, serialised as a compact JSON object with absent fields
//! omitted. The record is deliberately a single flat struct rather than an
//! enum-of-payloads: the original protocol treats fields as orthogonal slots
//! (`decision` rides on both ORDER and VALIDATION, `p` is a client id on
//! INVOKE but a complainer id on COMPLAIN), and the flat shape keeps the
//! serialised form stable.
//!
//! ## Message kinds
//!
//! - [`MessageKind::ClientInvoke`] / [`MessageKind::Invoke`] — submission path
//! - [`MessageKind::Execute`] / [`MessageKind::Approve`] — speculative round
//! - [`MessageKind::Order`] / [`MessageKind::Validation`] — validation round
//! - [`MessageKind::Commit`] / [`MessageKind::Abort`] / [`MessageKind::Rollback`] — outcomes
//! - [`MessageKind::Complain`] / [`MessageKind::NewSieveConfig`] — liveness
//! - [`MessageKind::RequestValue`] / [`MessageKind::OperationNotQueued`] — client reads and drops
//! - [`MessageKind::Start`] / [`MessageKind::Close`] / [`MessageKind::Debug`] — lifecycle and knobs

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use sievekv_types::{Epoch, Operation, Phase, ProcessId, Scalar};

// ============================================================================
// Message kinds
// ============================================================================

/// The `type` tag of a wire record. Numeric codes are stable wire format.
///
/// `Confirm` and `Abort` double as the values of the `decision` field on
/// ORDER and VALIDATION records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageKind {
    Invoke = 0,
    Execute = 1,
    Approve = 2,
    Order = 3,
    NewSieveConfig = 4,
    Confirm = 5,
    Abort = 6,
    Complain = 7,
    ClientInvoke = 8,
    Close = 9,
    Validation = 10,
    Commit = 11,
    Start = 12,
    Debug = 13,
    Rollback = 14,
    RequestValue = 15,
    OperationNotQueued = 16,
}

impl MessageKind {
    /// Human-readable name, for logs.
    pub fn name(self) -> &'static str {
        match self {
            MessageKind::Invoke => "INVOKE",
            MessageKind::Execute => "EXECUTE",
            MessageKind::Approve => "APPROVE",
            MessageKind::Order => "ORDER",
            MessageKind::NewSieveConfig => "NEW_SIEVE_CONFIG",
            MessageKind::Confirm => "CONFIRM",
            MessageKind::Abort => "ABORT",
            MessageKind::Complain => "COMPLAIN",
            MessageKind::ClientInvoke => "CLIENT_INVOKE",
            MessageKind::Close => "CLOSE",
            MessageKind::Validation => "VALIDATION",
            MessageKind::Commit => "COMMIT",
            MessageKind::Start => "START",
            MessageKind::Debug => "DEBUG",
            MessageKind::Rollback => "ROLLBACK",
            MessageKind::RequestValue => "REQUEST_VALUE",
            MessageKind::OperationNotQueued => "OPERATION_NOT_QUEUED",
        }
    }
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> Self {
        kind as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = WireError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => MessageKind::Invoke,
            1 => MessageKind::Execute,
            2 => MessageKind::Approve,
            3 => MessageKind::Order,
            4 => MessageKind::NewSieveConfig,
            5 => MessageKind::Confirm,
            6 => MessageKind::Abort,
            7 => MessageKind::Complain,
            8 => MessageKind::ClientInvoke,
            9 => MessageKind::Close,
            10 => MessageKind::Validation,
            11 => MessageKind::Commit,
            12 => MessageKind::Start,
            13 => MessageKind::Debug,
            14 => MessageKind::Rollback,
            15 => MessageKind::RequestValue,
            16 => MessageKind::OperationNotQueued,
            other => return Err(WireError::UnknownKind(other)),
        })
    }
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Auxiliary payloads
// ============================================================================

/// Debug knob for the artificial execution delay: a draw in `lo..=hi` that
/// lands at or below `threshold` selects the slow path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayProfile(pub u64, pub u64, pub u64);

impl DelayProfile {
    /// Delay draws never select the slow path.
    pub const NEVER_SLOW: DelayProfile = DelayProfile(10, 10, 0);

    /// Delay draws always select the slow path.
    pub const ALWAYS_SLOW: DelayProfile = DelayProfile(1, 1, 10);

    pub fn lo(self) -> u64 {
        self.0
    }

    pub fn hi(self) -> u64 {
        self.1
    }

    pub fn threshold(self) -> u64 {
        self.2
    }
}

/// The pending work an outgoing leader ships to its successor inside an
/// initiating NEW_SIEVE_CONFIG: the submitter → operation buffer, the FIFO
/// admission order, and the operation → client map (as pairs; operation keys
/// are not expressible as JSON object keys).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LeaderBuffer {
    #[serde(rename = "b")]
    pub buffer: BTreeMap<ProcessId, Operation>,
    #[serde(rename = "queue")]
    pub queue: Vec<ProcessId>,
    #[serde(rename = "clients")]
    pub clients: Vec<(Operation, ProcessId)>,
}

// ============================================================================
// The wire record
// ============================================================================

/// One wire record. Only `type` is always present; every other field is
/// omitted from the serialised form when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,

    /// Epoch (`config`) the sender believes current.
    #[serde(rename = "c", default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Epoch>,

    /// The operation this record is about.
    #[serde(rename = "o", default, skip_serializing_if = "Option::is_none")]
    pub op: Option<Operation>,

    /// A process id rider: the originating client on INVOKE, the complainer
    /// on COMPLAIN, the proposed leader on NEW_SIEVE_CONFIG.
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<ProcessId>,

    /// Response digest (APPROVE).
    #[serde(rename = "sign", default, skip_serializing_if = "Option::is_none")]
    pub sign: Option<String>,

    /// CONFIRM or ABORT (ORDER, VALIDATION).
    #[serde(rename = "decision", default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<MessageKind>,

    /// Leader's speculative state at ORDER time.
    #[serde(rename = "tc", default, skip_serializing_if = "Option::is_none")]
    pub spec_state: Option<Phase>,

    /// Leader's speculative response at ORDER time; adopted by replicas whose
    /// own response disagreed with the majority.
    #[serde(rename = "rc", default, skip_serializing_if = "Option::is_none")]
    pub spec_response: Option<Operation>,

    /// Proof bundle on ORDER: the correct group backing a CONFIRM, or the
    /// full reply tally backing an ABORT. Recursively messages, keyed by
    /// sender id.
    #[serde(rename = "msg-set", default, skip_serializing_if = "Option::is_none")]
    pub msg_set: Option<BTreeMap<ProcessId, Message>>,

    /// Pending-work transfer on an initiating NEW_SIEVE_CONFIG.
    #[serde(
        rename = "leader-buffer",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub leader_buffer: Option<LeaderBuffer>,

    /// Free-form rider: `true` flags an initiating NEW_SIEVE_CONFIG; client
    /// outputs carry their payload here.
    #[serde(
        rename = "generic-data",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub generic_data: Option<serde_json::Value>,

    /// DEBUG: new faulty flag.
    #[serde(
        rename = "debug-faulty",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub debug_faulty: Option<u64>,

    /// DEBUG: new execution delay profile.
    #[serde(
        rename = "debug-ex-time",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub debug_ex_time: Option<DelayProfile>,
}

impl Message {
    fn bare(kind: MessageKind) -> Self {
        Self {
            kind,
            config: None,
            op: None,
            pid: None,
            sign: None,
            decision: None,
            spec_state: None,
            spec_response: None,
            msg_set: None,
            leader_buffer: None,
            generic_data: None,
            debug_faulty: None,
            debug_ex_time: None,
        }
    }

    /// CLIENT_INVOKE: a client proposes `op` to any replica.
    pub fn client_invoke(op: Operation) -> Self {
        Self {
            op: Some(op),
            ..Self::bare(MessageKind::ClientInvoke)
        }
    }

    /// INVOKE: a replica forwards `op` (submitted by client `client`) to the
    /// leader.
    pub fn invoke(config: Epoch, op: Operation, client: ProcessId) -> Self {
        Self {
            config: Some(config),
            op: Some(op),
            pid: Some(client),
            ..Self::bare(MessageKind::Invoke)
        }
    }

    /// EXECUTE: the leader asks every replica to speculatively execute `op`.
    pub fn execute(config: Epoch, op: Operation) -> Self {
        Self {
            config: Some(config),
            op: Some(op),
            ..Self::bare(MessageKind::Execute)
        }
    }

    /// APPROVE: a replica reports the digest of its speculative response.
    pub fn approve(config: Epoch, op: Operation, sign: String) -> Self {
        Self {
            config: Some(config),
            op: Some(op),
            sign: Some(sign),
            ..Self::bare(MessageKind::Approve)
        }
    }

    /// ORDER: the leader proposes an outcome with its proof bundle.
    pub fn order(
        decision: MessageKind,
        config: Epoch,
        op: Operation,
        spec_state: Phase,
        spec_response: Operation,
        msg_set: BTreeMap<ProcessId, Message>,
    ) -> Self {
        Self {
            config: Some(config),
            op: Some(op),
            decision: Some(decision),
            spec_state: Some(spec_state),
            spec_response: Some(spec_response),
            msg_set: Some(msg_set),
            ..Self::bare(MessageKind::Order)
        }
    }

    /// VALIDATION: a replica's verdict on the leader's ORDER. `op` may be
    /// absent when the replica never started the operation.
    pub fn validation(decision: MessageKind, config: Epoch, op: Option<Operation>) -> Self {
        Self {
            config: Some(config),
            op,
            decision: Some(decision),
            ..Self::bare(MessageKind::Validation)
        }
    }

    /// COMMIT broadcast (replica scope).
    pub fn commit(config: Epoch, op: Operation) -> Self {
        Self {
            config: Some(config),
            op: Some(op),
            ..Self::bare(MessageKind::Commit)
        }
    }

    /// ABORT broadcast (replica scope).
    pub fn abort(config: Epoch, op: Operation) -> Self {
        Self {
            config: Some(config),
            op: Some(op),
            ..Self::bare(MessageKind::Abort)
        }
    }

    /// COMPLAIN: a replica reports an over-age current operation to the
    /// leader.
    pub fn complain(config: Epoch, op: Option<Operation>, complainer: ProcessId) -> Self {
        Self {
            config: Some(config),
            op,
            pid: Some(complainer),
            ..Self::bare(MessageKind::Complain)
        }
    }

    /// NEW_SIEVE_CONFIG announcement proposing `leader` for `epoch`. Use
    /// [`Message::with_leader_buffer`] and [`Message::initiating`] on the
    /// current leader's first announcement.
    pub fn new_sieve_config(epoch: Epoch, leader: ProcessId) -> Self {
        Self {
            config: Some(epoch),
            pid: Some(leader),
            ..Self::bare(MessageKind::NewSieveConfig)
        }
    }

    /// Attaches the pending-work transfer to a NEW_SIEVE_CONFIG.
    #[must_use]
    pub fn with_leader_buffer(mut self, buffer: LeaderBuffer) -> Self {
        self.leader_buffer = Some(buffer);
        self
    }

    /// Marks a NEW_SIEVE_CONFIG as the initiating announcement from the
    /// current leader.
    #[must_use]
    pub fn initiating(mut self) -> Self {
        self.generic_data = Some(serde_json::Value::Bool(true));
        self
    }

    /// REQUEST_VALUE: a client asks a replica for the value under `key`.
    pub fn request_value(key: Scalar) -> Self {
        Self {
            op: Some(Operation(key, Scalar::Null)),
            ..Self::bare(MessageKind::RequestValue)
        }
    }

    /// A terminal output delivered to a client: COMMIT, ABORT, ROLLBACK,
    /// COMPLAIN, NEW_SIEVE_CONFIG, REQUEST_VALUE or OPERATION_NOT_QUEUED,
    /// with the payload in `generic-data`.
    pub fn output(kind: MessageKind, config: Epoch, data: serde_json::Value) -> Self {
        Self {
            config: Some(config),
            generic_data: Some(data),
            ..Self::bare(kind)
        }
    }

    /// START: announces a peer's address to the cluster.
    pub fn start() -> Self {
        Self::bare(MessageKind::Start)
    }

    /// CLOSE: drives every receiver to CLOSING.
    pub fn close() -> Self {
        Self::bare(MessageKind::Close)
    }

    /// DEBUG: set the faulty simulation flag.
    pub fn debug_faulty(flag: u64) -> Self {
        Self {
            debug_faulty: Some(flag),
            ..Self::bare(MessageKind::Debug)
        }
    }

    /// DEBUG: replace the execution delay profile.
    pub fn debug_ex_time(profile: DelayProfile) -> Self {
        Self {
            debug_ex_time: Some(profile),
            ..Self::bare(MessageKind::Debug)
        }
    }

    /// True when this record carries exactly (`config`, `op`).
    pub fn is_about(&self, config: Epoch, op: &Operation) -> bool {
        self.config == Some(config) && self.op.as_ref() == Some(op)
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Wire codec failures.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("unknown message type code {0}")]
    UnknownKind(u8),

    #[error("malformed wire record: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialises a message to its compact JSON form.
pub fn encode(message: &Message) -> Result<Vec<u8>, WireError> {
    Ok(serde_json::to_vec(message)?)
}

/// Parses a wire record.
pub fn decode(bytes: &[u8]) -> Result<Message, WireError> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn absent_fields_are_omitted() {
        let msg = Message::execute(Epoch::new(2), Operation::new("a", 1));
        let json = String::from_utf8(encode(&msg).expect("encode")).expect("utf8");
        assert_eq!(json, r#"{"type":1,"c":2,"o":["a",1]}"#);
    }

    #[test]
    fn bare_kinds_encode_to_tag_only() {
        let json = String::from_utf8(encode(&Message::close()).expect("encode")).expect("utf8");
        assert_eq!(json, r#"{"type":9}"#);
    }

    #[test]
    fn order_round_trips_with_recursive_msg_set() {
        let op = Operation::new("a", 1);
        let mut set = BTreeMap::new();
        set.insert(
            ProcessId::new(2),
            Message::approve(Epoch::ZERO, op.clone(), "digest".into()),
        );
        set.insert(
            ProcessId::new(5),
            Message::approve(Epoch::ZERO, op.clone(), "digest".into()),
        );

        let order = Message::order(
            MessageKind::Confirm,
            Epoch::ZERO,
            op.clone(),
            Phase::Commit,
            op,
            set,
        );

        let bytes = encode(&order).expect("encode");
        let back = decode(&bytes).expect("decode");
        assert_eq!(back, order);
        assert_eq!(back.msg_set.as_ref().map(BTreeMap::len), Some(2));
    }

    #[test]
    fn leader_buffer_keys_survive_json() {
        // JSON object keys are strings; replica ids must reparse to integers.
        let mut buffer = LeaderBuffer::default();
        buffer
            .buffer
            .insert(ProcessId::new(3), Operation::new("k", 9));
        buffer.queue.push(ProcessId::new(3));
        buffer
            .clients
            .push((Operation::new("k", 9), ProcessId::new(1000)));

        let msg = Message::new_sieve_config(Epoch::new(1), ProcessId::new(4))
            .with_leader_buffer(buffer.clone())
            .initiating();

        let back = decode(&encode(&msg).expect("encode")).expect("decode");
        assert_eq!(back.leader_buffer, Some(buffer));
        assert_eq!(back.generic_data, Some(serde_json::Value::Bool(true)));
    }

    #[test]
    fn unknown_type_code_is_rejected() {
        let err = decode(br#"{"type":99}"#).unwrap_err();
        assert!(matches!(err, WireError::Json(_)));
    }

    #[test]
    fn decision_field_uses_kind_codes() {
        let v = Message::validation(MessageKind::Confirm, Epoch::ZERO, None);
        let json = String::from_utf8(encode(&v).expect("encode")).expect("utf8");
        assert_eq!(json, r#"{"type":10,"c":0,"decision":5}"#);
    }

    fn arb_scalar() -> impl Strategy<Value = Scalar> {
        prop_oneof![
            Just(Scalar::Null),
            any::<bool>().prop_map(Scalar::Bool),
            any::<i64>().prop_map(Scalar::Int),
            "[a-z0-9]{0,12}".prop_map(Scalar::Text),
        ]
    }

    proptest! {
        #[test]
        fn approve_round_trips(key in arb_scalar(), value in arb_scalar(), epoch in 0u64..1000) {
            let op = Operation(key, value);
            let msg = Message::approve(Epoch::new(epoch), op, "sig".into());
            let back = decode(&encode(&msg).expect("encode")).expect("decode");
            prop_assert_eq!(back, msg);
        }
    }
}
