//! Ringdht: a ring-structured distributed hash table with dynamic membership.
//!
//! Storage nodes are arranged in a logical ring ordered by storage ID, each
//! owning the keys between its predecessor's ID (exclusive) and its own
//! (inclusive). A permanent head relays client commands around the ring and
//! results back; a permanent tail closes the key space at `max_id`.

#[macro_use]
mod utils;

mod client;
mod cluster;
mod node;
mod transport;

// Helper utilities, functions, and macros
pub use crate::utils::{logger_init, DhtError, KeyRange, RingView, ME};

#[doc(hidden)]
pub use crate::utils::me_prefix;

// Ring node types and endpoint layout
pub use crate::node::{
    client_endpoint, tail_endpoint, DhtMsg, EndpointId, Key, LogicalId,
    MsgTag, NodeRole, NodeSnapshot, StorageNode, Value, HEAD, HEAD_ID,
};

// Transport fabric
pub use crate::transport::{Mailbox, TaggedMsg, TransportHub};

// Client side and launcher
pub use crate::client::{ClientCommand, ClientDriver, CommandOutcome};
pub use crate::cluster::{check_final_state, NodeExit, RingCluster, RingConfig};
