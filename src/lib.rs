//! # FlashKV Driver - A Cluster-Aware RESP Client
//!
//! A client-side driver for FlashKV and other servers speaking the RESP
//! protocol, for single nodes and slot-sharded clusters. Callers submit typed
//! commands; the driver pipelines them over persistent connections, decodes
//! the replies and recovers from connection loss and slot migrations.
//!
//! ## Features
//!
//! - **Pipelining**: many commands in flight per connection, replies matched
//!   in FIFO order
//! - **Reconnect**: a watchdog per connection re-establishes it with
//!   exponential backoff and replays the queued commands
//! - **Cluster routing**: CRC16 hash slots, MOVED/ASK redirection, requeue of
//!   commands evacuated from a failed node
//! - **Async I/O**: built on Tokio, `write` never blocks on the network
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               Client                                    │
//! │                      submit(Command<T>) -> CommandHandle<T>             │
//! └───────────────────────────────────┬─────────────────────────────────────┘
//!                                     │ ChannelWriter
//!               ┌─────────────────────┴─────────────────────┐
//!               ▼                                           ▼
//!      ┌─────────────────┐                     ┌─────────────────────────┐
//!      │    Endpoint     │                     │      ClusterWriter      │
//!      │  (standalone)   │                     │ Topology + redirection  │
//!      └────────┬────────┘                     └──┬──────────┬───────────┘
//!               │                                 ▼          ▼
//!               │                          Endpoint(n1)  Endpoint(n2) ...
//!               ▼
//!  ┌──────────────────────────────┐      ┌─────────────────────────┐
//!  │ CommandQueue (FIFO)          │      │   ConnectionWatchdog    │
//!  │ outbound buffer              │<─────│  (Background Tokio Task)│
//!  │ ConnectionHandle ──> I/O task│      └─────────────────────────┘
//!  └──────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use flashkv_driver::command::{Command, StatusOutput, ValueOutput};
//! use flashkv_driver::{Client, ClientOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = Client::connect("127.0.0.1:6379", ClientOptions::default()).await?;
//!
//!     client
//!         .submit(Command::new("SET", StatusOutput::new()).key_arg("name").arg("Ariz"))
//!         .await?;
//!     let name = client
//!         .submit(Command::new("GET", ValueOutput::new()).key_arg("name"))
//!         .await?;
//!     println!("{:?}", name);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP values and the incremental reply parser
//! - [`command`]: commands, completion handles and reply outputs
//! - [`endpoint`]: per-server command queue, dispatch and close/requeue
//! - [`connection`]: the socket I/O task and the reconnect watchdog
//! - [`cluster`]: hash slots, topology and the cluster-aware writer
//! - [`client`]: the caller-facing entry point
//!
//! ## Design Highlights
//!
//! ### One Lock per Endpoint
//!
//! Writes, reply dispatch, reconnect activation and close all go through one
//! mutex per endpoint. Different endpoints never share a lock, so nodes are
//! served fully in parallel.
//!
//! ### Requeue on Close
//!
//! Closing an endpoint that has no live connection hands its pending
//! commands back to the cluster writer, which routes them again. A node
//! failover and a MOVED redirection share that path.

pub mod client;
pub mod cluster;
pub mod command;
pub mod connection;
pub mod endpoint;
pub mod options;
pub mod protocol;

// Re-export commonly used types for convenience
pub use client::{Client, TcpNodeConnector};
pub use cluster::{ClusterWriter, NodeId, SlotTable, Topology};
pub use command::{Command, CommandError, CommandHandle};
pub use connection::{ConnectionError, ConnectionStats, ConnectionWatchdog};
pub use endpoint::{ChannelWriter, Endpoint};
pub use options::ClientOptions;
pub use protocol::{ParseError, RespParser, RespValue};

/// The default server port (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// The default server host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of the driver
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
