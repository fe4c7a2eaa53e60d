//! # ssidkv
//!
//! Speculative optimistic concurrency control for sharded transactions.
//!
//! Every read and write is placed inside a snapshot-id range instead of at a
//! single timestamp. Transactions may read writes that are not decided yet;
//! a cheap overlap check on the aggregated ranges commits most of them
//! without a validation round, and a StatusQuery sub-protocol resolves the
//! ones that read undecided data.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ssidkv_core::commo::LocalCommo;
//! use ssidkv_core::config::ProtocolConfig;
//! use ssidkv_core::coordinator::{Coordinator, Piece, TxnIdGenerator, TxnRequest};
//! use ssidkv_core::scheduler::PartitionScheduler;
//! use ssidkv_core::types::Value;
//!
//! let config = ProtocolConfig::default();
//! let commo = LocalCommo::new();
//! let partition = PartitionScheduler::new(0, &config);
//! partition.load_row(1, vec![Value::Int(0); 8]);
//! commo.add_partition(Arc::new(partition));
//!
//! let coord = Coordinator::new(
//!     Arc::new(commo.clone()),
//!     config,
//!     Arc::new(TxnIdGenerator::new(0)),
//! );
//! let txn = TxnRequest::new(0).piece(Piece::new(1, 0).read(1, 0).write(1, 5, "a"));
//! coord
//!     .submit(txn, |outcome| println!("{:?}", outcome.decision))
//!     .unwrap();
//! commo.run_until_idle();
//! ```

pub mod commo;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod mvcc;
pub mod scheduler;
pub mod txn;
pub mod types;
