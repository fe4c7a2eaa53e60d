//! Wire protocol: JSON-over-newlines request/response frames.
//!
//! Each request is a single JSON line carrying a client-chosen `id`; every
//! response line echoes the `id` of the request it answers. Responses may
//! arrive out of order: a parked StatusQuery is answered only once the
//! versions it depends on are decided.

use serde::{Deserialize, Serialize};

use ssidkv_core::commo::{DispatchReply, PieceData};
use ssidkv_core::types::{
    ColumnId, RowKey, SnapshotId, StatusReply, TxnId, ValidateResult, Value,
};

/// A request line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub body: Request,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Dispatch {
        txn_id: TxnId,
        ssid_spec: SnapshotId,
        pieces: Vec<PieceData>,
    },
    Validate {
        txn_id: TxnId,
        ssid_new: SnapshotId,
    },
    /// `decision` is the numeric decision code; `ssid_commit` the position
    /// a commit moves the writes to.
    Finalize {
        txn_id: TxnId,
        decision: i8,
        #[serde(default)]
        ssid_commit: SnapshotId,
    },
    FinalizeAbort {
        txn_id: TxnId,
    },
    StatusQuery {
        txn_id: TxnId,
    },
    // -- Administrative operations --
    LoadRow {
        key: RowKey,
        values: Vec<Value>,
    },
    CommittedValue {
        key: RowKey,
        col: ColumnId,
    },
}

/// A response line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    pub body: Response,
}

/// Externally tagged: dispatch replies carry integer-keyed maps, which do
/// not survive serde's buffered (internally tagged) representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    DispatchAck(DispatchReply),
    ValidateAck { result: ValidateResult },
    FinalizeAck,
    StatusQueryAck(StatusReply),
    Ok,
    Value { value: Option<Value> },
    Error(ErrorResponse),
}

/// Error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl Response {
    pub fn error(error: impl Into<String>, message: impl Into<String>) -> Self {
        Response::Error(ErrorResponse {
            error: error.into(),
            message: message.into(),
        })
    }
}

impl RequestFrame {
    /// Encode as one newline-terminated JSON line.
    pub fn to_line(&self) -> serde_json::Result<Vec<u8>> {
        let mut data = serde_json::to_vec(self)?;
        data.push(b'\n');
        Ok(data)
    }
}

impl ResponseFrame {
    /// Encode as one newline-terminated JSON line.
    pub fn to_line(&self) -> serde_json::Result<Vec<u8>> {
        let mut data = serde_json::to_vec(self)?;
        data.push(b'\n');
        Ok(data)
    }
}
