//! Ring protocol message types.

use std::collections::BTreeMap;

use super::{EndpointId, Key, LogicalId, Value};
use crate::transport::TaggedMsg;

use serde::{Deserialize, Serialize};

/// Message tag, used for probing and selective receiving.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize)]
pub enum MsgTag {
    Put,
    Get,
    RetVal,
    Ack,
    Reject,
    Add,
    Remove,
    InitNode,
    UpdateParent,
    GetStorageId,
    StorageId,
    ReleaseKeys,
    Redist,
    RemoveNode,
    NewChildRank,
    End,
}

/// Message exchanged between endpoints (client, head, and storage nodes).
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum DhtMsg {
    /// Store a key-value pair at its owner.
    Put { key: Key, value: Value },

    /// Look up a key at its owner.
    Get { key: Key },

    /// Lookup result from the owner; `value` is `None` if key not found.
    RetVal {
        value: Option<Value>,
        owner: LogicalId,
    },

    /// Completion signal of a PUT, ADD, or REMOVE.
    Ack,

    /// Explicit refusal of a client command that would break the ring.
    Reject { reason: String },

    /// Insert the candidate endpoint into the ring under given ID.
    Add {
        candidate: EndpointId,
        candidate_id: LogicalId,
    },

    /// Remove the node holding given storage ID from the ring.
    Remove { target_id: LogicalId },

    /// Activation data from the new predecessor to the candidate.
    InitNode {
        parent: EndpointId,
        child: EndpointId,
        parent_id: LogicalId,
        new_id: LogicalId,
    },

    /// Predecessor's storage ID has changed.
    UpdateParent { new_parent_id: LogicalId },

    /// Storage ID query request.
    GetStorageId,

    /// Storage ID query reply; `None` if the queried node is inactive.
    StorageId { storage_id: Option<LogicalId> },

    /// Ask the receiver to hand back every key it no longer owns.
    ReleaseKeys,

    /// Bulk transfer of migrated key-value pairs.
    Redist { pairs: BTreeMap<Key, Value> },

    /// Directive to leave the ring, sent by the parent of the node removed.
    RemoveNode { parent: EndpointId },

    /// Successor handed over by a node leaving the ring.
    NewChildRank { child: EndpointId },

    /// Shutdown.
    End,
}

impl DhtMsg {
    /// Is this one of the commands a client submits to the head?
    #[inline]
    pub fn is_client_cmd(&self) -> bool {
        matches!(
            self,
            DhtMsg::Put { .. }
                | DhtMsg::Get { .. }
                | DhtMsg::Add { .. }
                | DhtMsg::Remove { .. }
        )
    }

    /// Is this a completion or result signal relayed by the head?
    #[inline]
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            DhtMsg::Ack | DhtMsg::RetVal { .. } | DhtMsg::Reject { .. }
        )
    }
}

impl TaggedMsg for DhtMsg {
    type Tag = MsgTag;

    fn tag(&self) -> MsgTag {
        match self {
            DhtMsg::Put { .. } => MsgTag::Put,
            DhtMsg::Get { .. } => MsgTag::Get,
            DhtMsg::RetVal { .. } => MsgTag::RetVal,
            DhtMsg::Ack => MsgTag::Ack,
            DhtMsg::Reject { .. } => MsgTag::Reject,
            DhtMsg::Add { .. } => MsgTag::Add,
            DhtMsg::Remove { .. } => MsgTag::Remove,
            DhtMsg::InitNode { .. } => MsgTag::InitNode,
            DhtMsg::UpdateParent { .. } => MsgTag::UpdateParent,
            DhtMsg::GetStorageId => MsgTag::GetStorageId,
            DhtMsg::StorageId { .. } => MsgTag::StorageId,
            DhtMsg::ReleaseKeys => MsgTag::ReleaseKeys,
            DhtMsg::Redist { .. } => MsgTag::Redist,
            DhtMsg::RemoveNode { .. } => MsgTag::RemoveNode,
            DhtMsg::NewChildRank { .. } => MsgTag::NewChildRank,
            DhtMsg::End => MsgTag::End,
        }
    }
}
