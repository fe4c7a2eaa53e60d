//! Core types: transaction/partition/row ids, SSID ranges, values, and the
//! wire-level status and result codes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Transaction identifier (monotonically increasing, never reused).
pub type TxnId = u64;

/// Position in the serial order.
pub type SnapshotId = u64;

/// Partition (shard) identifier.
pub type PartitionId = u32;

/// Inner piece identifier, unique within one transaction request.
pub type InnId = u32;

/// Row key within a partition.
pub type RowKey = u64;

/// Dense column index into a row layout.
pub type ColumnId = usize;

/// Index of a version record inside a column's version queue.
pub type VersionIndex = usize;

/// Reserved transaction id that owns the initial version of every column.
pub const LOADER_TXN_ID: TxnId = 0;

/// Upper bound used for an unconstrained SSID high.
pub const SSID_INFINITY: SnapshotId = u64::MAX;

/// A snapshot-id range `(low, high)` bounding where an access may sit in
/// the serial order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SsidRange {
    pub low: SnapshotId,
    pub high: SnapshotId,
}

impl SsidRange {
    /// The zero range returned for out-of-range columns.
    pub const EMPTY: SsidRange = SsidRange { low: 0, high: 0 };

    pub fn new(low: SnapshotId, high: SnapshotId) -> Self {
        Self { low, high }
    }

    /// A range starting at `low` with no upper constraint.
    pub fn unbounded(low: SnapshotId) -> Self {
        Self {
            low,
            high: SSID_INFINITY,
        }
    }

    /// True for the zero sentinel.
    pub fn is_empty_sentinel(&self) -> bool {
        *self == Self::EMPTY
    }

    /// Extend the range so it includes `ssid`.
    pub fn extend_to(&mut self, ssid: SnapshotId) {
        self.high = self.high.max(ssid);
    }

    /// Collapse both bounds onto `ssid`.
    pub fn snap_to(&mut self, ssid: SnapshotId) {
        self.low = ssid;
        self.high = ssid;
    }

    /// Move both bounds up to at least `ssid`.
    pub fn raise_to(&mut self, ssid: SnapshotId) {
        self.low = self.low.max(ssid);
        self.high = self.high.max(ssid);
    }
}

impl fmt::Display for SsidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.high == SSID_INFINITY {
            write!(f, "[{}, inf)", self.low)
        } else {
            write!(f, "[{}, {}]", self.low, self.high)
        }
    }
}

/// A column value. Ownership moves into the version record on write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Int(i64),
    Double(f64),
    Str(String),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// Status of a version record.
///
/// Transitions only move forward: UNCHECKED may go to VALIDATING, FINALIZED
/// or ABORTED; VALIDATING may go to FINALIZED or ABORTED; the terminal
/// states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i8)]
pub enum VersionStatus {
    Unchecked = 0,
    Validating = 1,
    Finalized = 2,
    Aborted = 3,
}

impl VersionStatus {
    /// True once the version is FINALIZED or ABORTED.
    pub fn is_decided(self) -> bool {
        matches!(self, VersionStatus::Finalized | VersionStatus::Aborted)
    }

    /// Whether moving from `self` to `next` is a legal forward transition.
    pub fn can_transition_to(self, next: VersionStatus) -> bool {
        use VersionStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Unchecked, _) => true,
            (Validating, Finalized | Aborted) => true,
            _ => false,
        }
    }
}

impl TryFrom<i8> for VersionStatus {
    type Error = CodecError;

    fn try_from(code: i8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(VersionStatus::Unchecked),
            1 => Ok(VersionStatus::Validating),
            2 => Ok(VersionStatus::Finalized),
            3 => Ok(VersionStatus::Aborted),
            other => Err(CodecError::UnknownCode {
                kind: "version status",
                code: other,
            }),
        }
    }
}

/// A commit decision, also used as the StatusQuery answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i8)]
pub enum Decision {
    Finalized = 2,
    Aborted = 3,
}

impl From<Decision> for VersionStatus {
    fn from(d: Decision) -> Self {
        match d {
            Decision::Finalized => VersionStatus::Finalized,
            Decision::Aborted => VersionStatus::Aborted,
        }
    }
}

impl TryFrom<i8> for Decision {
    type Error = CodecError;

    fn try_from(code: i8) -> Result<Self, Self::Error> {
        match code {
            2 => Ok(Decision::Finalized),
            3 => Ok(Decision::Aborted),
            other => Err(CodecError::UnknownCode {
                kind: "decision",
                code: other,
            }),
        }
    }
}

/// StatusQuery answer: the combined decision over the undecided versions a
/// transaction read, and the highest position any of their writers
/// committed at (0 when nothing was read speculatively).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReply {
    pub decision: Decision,
    pub ssid_commit: SnapshotId,
}

impl StatusReply {
    pub fn finalized(ssid_commit: SnapshotId) -> Self {
        Self {
            decision: Decision::Finalized,
            ssid_commit,
        }
    }

    pub fn aborted() -> Self {
        Self {
            decision: Decision::Aborted,
            ssid_commit: 0,
        }
    }
}

/// A partition's answer to Dispatch. `decided` and `offset_safe` are
/// independent signals, so both negatives get their own code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i8)]
pub enum DispatchResult {
    Success = 0,
    NotDecided = 1,
    OffsetInvalid = 2,
    BothNegative = 3,
}

impl DispatchResult {
    pub fn classify(decided: bool, offset_safe: bool) -> Self {
        match (decided, offset_safe) {
            (true, true) => DispatchResult::Success,
            (false, true) => DispatchResult::NotDecided,
            (true, false) => DispatchResult::OffsetInvalid,
            (false, false) => DispatchResult::BothNegative,
        }
    }

    pub fn decided(self) -> bool {
        matches!(self, DispatchResult::Success | DispatchResult::OffsetInvalid)
    }

    pub fn offset_safe(self) -> bool {
        matches!(self, DispatchResult::Success | DispatchResult::NotDecided)
    }
}

impl TryFrom<i8> for DispatchResult {
    type Error = CodecError;

    fn try_from(code: i8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(DispatchResult::Success),
            1 => Ok(DispatchResult::NotDecided),
            2 => Ok(DispatchResult::OffsetInvalid),
            3 => Ok(DispatchResult::BothNegative),
            other => Err(CodecError::UnknownCode {
                kind: "dispatch result",
                code: other,
            }),
        }
    }
}

/// A partition's answer to Validate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i8)]
pub enum ValidateResult {
    Consistent = 0,
    Inconsistent = 1,
}

impl TryFrom<i8> for ValidateResult {
    type Error = CodecError;

    fn try_from(code: i8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(ValidateResult::Consistent),
            1 => Ok(ValidateResult::Inconsistent),
            other => Err(CodecError::UnknownCode {
                kind: "validate result",
                code: other,
            }),
        }
    }
}
