//! ssidkv partition server and client library.
//!
//! Hosts one partition scheduler behind a local Unix socket, and provides
//! the client and [`ssidkv_core::commo::Commo`] implementation a coordinator
//! uses to reach such partitions.

pub mod client;
pub mod commo;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::PartitionClient;
pub use commo::SocketCommo;
pub use server::PartitionServer;
