//! Ring storage node: per-endpoint state machine implementing key routing,
//! ring membership changes, and key storage.
//!
//! Every endpoint except the client runs one `StorageNode` on its own task.
//! The node's loop handles one message to completion, including any nested
//! request/reply exchanges it issues, before looking at the next one. That
//! sequential handling is what keeps the state free of locks: all fields are
//! touched only by the owning task.

mod head;
mod membership;
mod messages;
mod routing;

use std::collections::BTreeMap;
use std::fmt;

use crate::transport::{Mailbox, TaggedMsg};
use crate::utils::{DhtError, KeyRange};

use serde::{Deserialize, Serialize};

pub use messages::{DhtMsg, MsgTag};

/// Endpoint address type.
pub type EndpointId = u16;

/// Position on the ring's logical ID space `[0, max_id]`.
pub type LogicalId = u64;

/// Keys share the logical ID space; valid keys are `[1, max_id]`.
pub type Key = LogicalId;

/// Stored value type.
pub type Value = i64;

/// Endpoint ID of the head node.
pub const HEAD: EndpointId = 0;

/// Storage ID of the head node.
pub const HEAD_ID: LogicalId = 0;

/// Endpoint ID of the permanent tail in a group of given population.
#[inline]
pub fn tail_endpoint(population: EndpointId) -> EndpointId {
    population - 2
}

/// Endpoint ID of the client in a group of given population.
#[inline]
pub fn client_endpoint(population: EndpointId) -> EndpointId {
    population - 1
}

/// Fixed role of a storage endpoint, assigned at startup.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum NodeRole {
    /// Permanent node at ID 0, relaying replies to the client.
    Head,

    /// Permanent node at ID `max_id`.
    Tail,

    /// Node that is inactive until an ADD activates it.
    Joinable,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Copy of a node's state, returned when its loop terminates.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub endpoint: EndpointId,
    pub role: NodeRole,
    pub active: bool,
    pub storage_id: Option<LogicalId>,
    pub parent_id: Option<LogicalId>,
    pub child: Option<EndpointId>,
    pub store: BTreeMap<Key, Value>,
}

impl NodeSnapshot {
    /// Key range owned by this node, `None` if it owns nothing.
    pub fn owned_range(&self) -> Option<KeyRange> {
        if !self.active {
            return None;
        }
        match (self.parent_id, self.storage_id) {
            (Some(parent_id), Some(storage_id)) => {
                Some(KeyRange::new(parent_id, storage_id))
            }
            _ => None,
        }
    }
}

/// What the loop does after a message has been handled.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum Flow {
    Continue,
    Terminate,
}

/// Ring storage node.
pub struct StorageNode {
    /// My endpoint ID.
    me: EndpointId,

    /// Total number of endpoints, client included.
    population: EndpointId,

    /// Storage ID of the permanent tail.
    max_id: LogicalId,

    /// Fixed role.
    role: NodeRole,

    /// My mailbox.
    mailbox: Mailbox<DhtMsg>,

    /// Whether I am currently a ring member.
    active: bool,

    /// My position on the ring, set on activation.
    storage_id: Option<LogicalId>,

    /// Predecessor's storage ID. Always `None` for the head.
    parent_id: Option<LogicalId>,

    /// Successor's endpoint ID.
    child: Option<EndpointId>,

    /// Locally stored pairs, all falling in my owned range.
    store: BTreeMap<Key, Value>,
}

// StorageNode common helpers
impl StorageNode {
    /// Creates the node owning given mailbox, with role and initial state
    /// decided by its endpoint ID.
    pub fn new(
        mailbox: Mailbox<DhtMsg>,
        max_id: LogicalId,
    ) -> Result<Self, DhtError> {
        let me = mailbox.me();
        let population = mailbox.population();
        if population < 3 {
            return logged_err!(
                "population {} too small for head, tail and client",
                population
            );
        }
        if max_id < 1 {
            return logged_err!("invalid max_id {}", max_id);
        }
        if me == client_endpoint(population) {
            return logged_err!("endpoint {} is reserved for the client", me);
        }

        let tail = tail_endpoint(population);
        let (role, active, storage_id, parent_id, child) = if me == HEAD {
            (NodeRole::Head, true, Some(HEAD_ID), None, Some(tail))
        } else if me == tail {
            (NodeRole::Tail, true, Some(max_id), Some(HEAD_ID), Some(HEAD))
        } else {
            (NodeRole::Joinable, false, None, None, None)
        };

        Ok(StorageNode {
            me,
            population,
            max_id,
            role,
            mailbox,
            active,
            storage_id,
            parent_id,
            child,
            store: BTreeMap::new(),
        })
    }

    #[inline]
    pub fn role(&self) -> NodeRole {
        self.role
    }

    #[inline]
    fn is_head(&self) -> bool {
        self.role == NodeRole::Head
    }

    #[inline]
    fn client(&self) -> EndpointId {
        client_endpoint(self.population)
    }

    #[inline]
    fn tail(&self) -> EndpointId {
        tail_endpoint(self.population)
    }

    /// Key range I currently own, `None` if inactive or the head.
    #[inline]
    fn owned_range(&self) -> Option<KeyRange> {
        match (self.active, self.parent_id, self.storage_id) {
            (true, Some(parent_id), Some(storage_id)) => {
                Some(KeyRange::new(parent_id, storage_id))
            }
            _ => None,
        }
    }

    /// Do I own given key?
    #[inline]
    fn owns(&self, key: Key) -> bool {
        self.owned_range().is_some_and(|range| range.contains(key))
    }

    /// My storage ID, which must be set while active.
    fn my_id(&self) -> Result<LogicalId, DhtError> {
        match self.storage_id {
            Some(id) => Ok(id),
            None => logged_err!("active node has no storage id"),
        }
    }

    /// My successor, which must be set while active.
    fn my_child(&self) -> Result<EndpointId, DhtError> {
        match self.child {
            Some(child) => Ok(child),
            None => logged_err!("active node has no child"),
        }
    }

    /// Removes and returns all stored pairs whose key satisfies `pred`.
    fn extract_keys(
        &mut self,
        pred: impl Fn(Key) -> bool,
    ) -> BTreeMap<Key, Value> {
        let (moved, kept): (BTreeMap<_, _>, BTreeMap<_, _>) =
            std::mem::take(&mut self.store)
                .into_iter()
                .partition(|(k, _)| pred(*k));
        self.store = kept;
        moved
    }

    /// Forwards a message unchanged to my successor.
    async fn forward(&mut self, msg: DhtMsg) -> Result<(), DhtError> {
        let child = self.my_child()?;
        pf_trace!("forwarding {:?} -> {}", msg.tag(), child);
        self.mailbox.send(child, msg).await
    }

    /// Sends a completion or result signal toward the head.
    async fn signal_head(&mut self, msg: DhtMsg) -> Result<(), DhtError> {
        self.mailbox.send(HEAD, msg).await
    }

    /// Refuses the current client command with given reason.
    async fn reject(&mut self, reason: String) -> Result<(), DhtError> {
        pf_warn!("rejecting command: {}", reason);
        self.signal_head(DhtMsg::Reject { reason }).await
    }

    /// Fails with a protocol violation error for a message unexpected in my
    /// current role or state.
    fn protocol_violation<T>(
        &self,
        source: EndpointId,
        tag: MsgTag,
    ) -> Result<T, DhtError> {
        logged_err!(
            "protocol violation: unexpected {:?} <- {} as {} (active {})",
            tag,
            source,
            self.role,
            self.active
        )
    }

    /// Fails with a protocol violation error unless I am active.
    #[inline]
    fn ensure_active(
        &self,
        source: EndpointId,
        tag: MsgTag,
    ) -> Result<(), DhtError> {
        if self.active {
            Ok(())
        } else {
            self.protocol_violation(source, tag)
        }
    }

    /// Copies out my current state.
    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            endpoint: self.me,
            role: self.role,
            active: self.active,
            storage_id: self.storage_id,
            parent_id: self.parent_id,
            child: self.child,
            store: self.store.clone(),
        }
    }
}

// StorageNode dispatch loop
impl StorageNode {
    /// Synthesized handler of a message received from `source`.
    async fn handle_msg(
        &mut self,
        source: EndpointId,
        msg: DhtMsg,
    ) -> Result<Flow, DhtError> {
        pf_trace!("recv <- {} {:?}", source, msg);

        if self.is_head() && msg.is_client_cmd() {
            if let Some(reason) = self.admission_check(source, &msg) {
                self.reject(reason).await?;
                return Ok(Flow::Continue);
            }
        }

        match msg {
            DhtMsg::Put { key, value } => {
                self.handle_put(source, key, value).await?
            }
            DhtMsg::Get { key } => self.handle_get(source, key).await?,
            DhtMsg::Add {
                candidate,
                candidate_id,
            } => self.handle_add(source, candidate, candidate_id).await?,
            DhtMsg::Remove { target_id } => {
                self.handle_remove(source, target_id).await?
            }
            DhtMsg::Ack | DhtMsg::RetVal { .. } | DhtMsg::Reject { .. } => {
                self.handle_relay(source, msg).await?
            }
            DhtMsg::GetStorageId => {
                self.handle_storage_id_query(source).await?
            }
            DhtMsg::InitNode {
                parent,
                child,
                parent_id,
                new_id,
            } => self.handle_init_node(
                source, parent, child, parent_id, new_id,
            )?,
            DhtMsg::UpdateParent { new_parent_id } => {
                self.handle_update_parent(source, new_parent_id)?
            }
            DhtMsg::ReleaseKeys => self.handle_release_keys(source).await?,
            DhtMsg::Redist { pairs } => self.handle_redist(source, pairs)?,
            DhtMsg::RemoveNode { parent } => {
                self.handle_remove_node(source, parent).await?
            }
            DhtMsg::End => return self.handle_end(source).await,
            DhtMsg::StorageId { .. } | DhtMsg::NewChildRank { .. } => {
                // only ever consumed inside the exchange that solicited it
                return self.protocol_violation(source, msg.tag());
            }
        }

        Ok(Flow::Continue)
    }

    /// Runs the node's message loop until shutdown. Returns my final state on
    /// a clean shutdown, or the error that stopped the loop.
    pub async fn run(mut self) -> Result<NodeSnapshot, DhtError> {
        pf_info!(
            "node running as {} (id {:?}, child {:?})",
            self.role,
            self.storage_id,
            self.child
        );

        loop {
            // peek at the sender and tag of the next message, then consume
            // exactly that message
            let (source, tag) = self.mailbox.probe().await?;
            let (_, msg) =
                self.mailbox.recv_from(Some(source), Some(tag)).await?;

            if self.handle_msg(source, msg).await? == Flow::Terminate {
                break;
            }
        }

        pf_info!("node terminated (active {})", self.active);
        Ok(self.snapshot())
    }
}
