//! Cluster Support
//!
//! Slot hashing, slot ownership and the writer that routes commands across
//! node endpoints.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ClusterWriter                          │
//! │                                                             │
//! │   key ──> hash_slot ──> Topology ──> NodeId ──> Endpoint    │
//! │                            ▲                       │        │
//! │                   MOVED    │          reply / close│        │
//! │                            └───────────────────────┘        │
//! └───────────┬──────────────────┬──────────────────┬───────────┘
//!             ▼                  ▼                  ▼
//!       Endpoint(n1)       Endpoint(n2)       Endpoint(n3)
//! ```

pub mod redirect;
pub mod slot;
pub mod topology;
pub mod writer;

pub use redirect::{Redirect, RedirectKind};
pub use slot::{crc16, hash_slot, SLOT_COUNT};
pub use topology::{NodeId, SlotMap, SlotTable, Topology};
pub use writer::{ClusterWriter, NodeConnector};
