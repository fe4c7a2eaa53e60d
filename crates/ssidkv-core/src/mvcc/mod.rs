//! Versioned storage: per-column version queues and the rows that own them.

pub mod row;
pub mod version_queue;

pub use row::{ColumnRead, ColumnWrite, Row};
pub use version_queue::{ReadOutcome, ValidateOutcome, VersionQueue, VersionRecord, WriteOutcome};
