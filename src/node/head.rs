//! StorageNode -- head-only duties: client command admission, reply relay,
//! and shutdown broadcast.

use super::*;

// StorageNode head role handling
impl StorageNode {
    /// Checks a client command arriving at the head. Returns the reason for
    /// rejecting it, or `None` if it may enter the ring.
    ///
    /// Commands come straight from the client; one showing up from a ring
    /// member has travelled the whole ring without finding its target.
    pub(super) fn admission_check(
        &self,
        source: EndpointId,
        msg: &DhtMsg,
    ) -> Option<String> {
        debug_assert!(self.is_head());

        if source != self.client() {
            return Some(match msg {
                DhtMsg::Add { candidate_id, .. } => {
                    format!("no insertion point for id {}", candidate_id)
                }
                DhtMsg::Remove { target_id } => {
                    format!("no node with id {}", target_id)
                }
                DhtMsg::Put { key, .. } | DhtMsg::Get { key } => {
                    format!("no owner for key {}", key)
                }
                _ => format!("unexpected {:?}", msg.tag()),
            });
        }

        match *msg {
            DhtMsg::Put { key, .. } | DhtMsg::Get { key }
                if key < 1 || key > self.max_id =>
            {
                Some(format!("key {} out of range [1, {}]", key, self.max_id))
            }
            DhtMsg::Add {
                candidate,
                candidate_id,
            } => {
                if candidate == HEAD || candidate >= self.tail() {
                    Some(format!("endpoint {} is not joinable", candidate))
                } else if candidate_id <= HEAD_ID
                    || candidate_id >= self.max_id
                {
                    Some(format!(
                        "id {} out of range ({}, {})",
                        candidate_id, HEAD_ID, self.max_id
                    ))
                } else {
                    None
                }
            }
            DhtMsg::Remove { target_id }
                if target_id == HEAD_ID || target_id == self.max_id =>
            {
                Some(format!("id {} is a permanent node", target_id))
            }
            DhtMsg::Remove { target_id } if target_id > self.max_id => {
                Some(format!("no node with id {}", target_id))
            }
            _ => None,
        }
    }

    /// Handler of ACK / RETVAL / REJECT: forward verbatim to the client.
    pub(super) async fn handle_relay(
        &mut self,
        source: EndpointId,
        msg: DhtMsg,
    ) -> Result<(), DhtError> {
        if !self.is_head() {
            return self.protocol_violation(source, msg.tag());
        }

        pf_debug!("relaying {:?} <- {} to client", msg, source);
        let client = self.client();
        self.mailbox.send(client, msg).await
    }

    /// Handler of END. The head accepts it from the client and broadcasts it
    /// to every storage endpoint; the others accept it from the head. Either
    /// way the loop then terminates.
    pub(super) async fn handle_end(
        &mut self,
        source: EndpointId,
    ) -> Result<Flow, DhtError> {
        if self.is_head() {
            if source != self.client() {
                return self.protocol_violation(source, MsgTag::End);
            }
            // an endpoint that already died must not stop the rest from
            // getting END
            let mut num_sent = 0;
            for endpoint in (HEAD + 1)..=self.tail() {
                match self.mailbox.send(endpoint, DhtMsg::End).await {
                    Ok(()) => num_sent += 1,
                    Err(e) => {
                        pf_warn!("failed to send END -> {}: {}", endpoint, e)
                    }
                }
            }
            pf_info!(
                "broadcast shutdown to {} of {} endpoints",
                num_sent,
                self.tail()
            );
        } else if source != HEAD {
            return self.protocol_violation(source, MsgTag::End);
        }

        Ok(Flow::Terminate)
    }
}
