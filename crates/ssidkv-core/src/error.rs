//! Error types for recoverable ssidkv faults.
//!
//! Protocol outcomes (inconsistency, undecided dependencies, aborts) are not
//! errors; they travel as result codes. Broken invariants panic.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::InnId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("offset tolerance must be below {max}, got {actual}")]
    OffsetToleranceTooLarge { max: u64, actual: u64 },
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown {kind} code: {code}")]
    UnknownCode { kind: &'static str, code: i8 },
}

/// A transaction request the coordinator refused to start.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("coordinator already has a transaction in flight")]
    Busy,

    #[error("transaction has no pieces")]
    Empty,

    #[error("duplicate piece id {0}")]
    DuplicatePiece(InnId),

    #[error("piece {piece} depends on unknown piece {dep}")]
    UnknownDependency { piece: InnId, dep: InnId },

    #[error("piece {piece} reads the output of piece {source_piece} without depending on it")]
    UnresolvedOutput { piece: InnId, source_piece: InnId },

    #[error("piece dependencies form a cycle")]
    DependencyCycle,
}
