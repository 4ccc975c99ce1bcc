//! StorageNode -- ring membership changes (ADD / REMOVE) and key migration.

use super::*;

// StorageNode storage ID query sub-protocol
impl StorageNode {
    /// Asks given endpoint for its storage ID and blocks until it replies.
    /// Returns `None` if that endpoint is inactive.
    async fn query_storage_id(
        &mut self,
        target: EndpointId,
    ) -> Result<Option<LogicalId>, DhtError> {
        if target == self.me {
            return Ok(if self.active { self.storage_id } else { None });
        }

        self.mailbox.send(target, DhtMsg::GetStorageId).await?;
        let (_, reply) = self
            .mailbox
            .recv_from(Some(target), Some(MsgTag::StorageId))
            .await?;
        match reply {
            DhtMsg::StorageId { storage_id } => {
                pf_trace!("storage id of {} is {:?}", target, storage_id);
                Ok(storage_id)
            }
            _ => logged_err!("unexpected reply {:?} <- {}", reply, target),
        }
    }

    /// Handler of storage ID query request.
    pub(super) async fn handle_storage_id_query(
        &mut self,
        source: EndpointId,
    ) -> Result<(), DhtError> {
        let storage_id = if self.active { self.storage_id } else { None };
        self.mailbox
            .send(source, DhtMsg::StorageId { storage_id })
            .await
    }
}

// StorageNode ADD handling
impl StorageNode {
    /// Handler of ADD. If the candidate ID falls strictly between mine and my
    /// successor's, I become the candidate's predecessor and splice it in:
    ///   1. send activation data to the candidate;
    ///   2. re-parent my old successor and link to the candidate;
    ///   3. move the keys of `(my_id, candidate_id]` to the candidate;
    ///   4. signal completion toward the head.
    /// Otherwise the request goes on to my successor.
    pub(super) async fn handle_add(
        &mut self,
        source: EndpointId,
        candidate: EndpointId,
        candidate_id: LogicalId,
    ) -> Result<(), DhtError> {
        self.ensure_active(source, MsgTag::Add)?;
        let my_id = self.my_id()?;
        let child = self.my_child()?;

        let child_id = match self.query_storage_id(child).await? {
            Some(id) => id,
            None => return logged_err!("successor {} is inactive", child),
        };
        if candidate_id == my_id || candidate_id == child_id {
            return self
                .reject(format!("id {} is already taken", candidate_id))
                .await;
        }
        if !(my_id < candidate_id && candidate_id < child_id) {
            return self
                .forward(DhtMsg::Add {
                    candidate,
                    candidate_id,
                })
                .await;
        }

        if candidate == self.me {
            return self
                .reject(format!("endpoint {} is already active", candidate))
                .await;
        }
        if let Some(id) = self.query_storage_id(candidate).await? {
            return self
                .reject(format!(
                    "endpoint {} is already active as id {}",
                    candidate, id
                ))
                .await;
        }

        // 1. activate the candidate between me and my old successor
        self.mailbox
            .send(
                candidate,
                DhtMsg::InitNode {
                    parent: self.me,
                    child,
                    parent_id: my_id,
                    new_id: candidate_id,
                },
            )
            .await?;

        // 2. relink
        self.mailbox
            .send(
                child,
                DhtMsg::UpdateParent {
                    new_parent_id: candidate_id,
                },
            )
            .await?;
        self.child = Some(candidate);

        // 3. migrate the candidate's range; its keys were held by my old
        // successor, which now hands back everything it no longer owns
        let range = KeyRange::new(my_id, candidate_id);
        let mut pairs = self.extract_keys(|k| range.contains(k));
        self.mailbox.send(child, DhtMsg::ReleaseKeys).await?;
        let (_, reply) = self
            .mailbox
            .recv_from(Some(child), Some(MsgTag::Redist))
            .await?;
        match reply {
            DhtMsg::Redist { pairs: released } => pairs.extend(released),
            _ => {
                return logged_err!("unexpected reply {:?} <- {}", reply, child)
            }
        }
        let num_moved = pairs.len();
        self.mailbox
            .send(candidate, DhtMsg::Redist { pairs })
            .await?;

        pf_info!(
            "added endpoint {} as id {} between {} and {}, moved {} keys",
            candidate,
            candidate_id,
            my_id,
            child_id,
            num_moved
        );

        // 4.
        self.signal_head(DhtMsg::Ack).await
    }

    /// Handler of activation data from my new predecessor.
    pub(super) fn handle_init_node(
        &mut self,
        source: EndpointId,
        parent: EndpointId,
        child: EndpointId,
        parent_id: LogicalId,
        new_id: LogicalId,
    ) -> Result<(), DhtError> {
        if self.active || self.role != NodeRole::Joinable {
            return self.protocol_violation(source, MsgTag::InitNode);
        }

        self.active = true;
        self.storage_id = Some(new_id);
        self.parent_id = Some(parent_id);
        self.child = Some(child);
        pf_info!(
            "activated as id {} (parent {} at {}, child {})",
            new_id,
            parent_id,
            parent,
            child
        );
        Ok(())
    }

    /// Handler of predecessor storage ID change.
    pub(super) fn handle_update_parent(
        &mut self,
        source: EndpointId,
        new_parent_id: LogicalId,
    ) -> Result<(), DhtError> {
        if !self.active || self.is_head() {
            return self.protocol_violation(source, MsgTag::UpdateParent);
        }

        pf_debug!(
            "parent id changed {:?} -> {}",
            self.parent_id,
            new_parent_id
        );
        self.parent_id = Some(new_parent_id);
        Ok(())
    }

    /// Handler of a request to hand back every key outside my owned range,
    /// left over after my range has shrunk.
    pub(super) async fn handle_release_keys(
        &mut self,
        source: EndpointId,
    ) -> Result<(), DhtError> {
        let range = match self.owned_range() {
            Some(range) if !self.is_head() => range,
            _ => return self.protocol_violation(source, MsgTag::ReleaseKeys),
        };

        let pairs = self.extract_keys(|k| !range.contains(k));
        pf_debug!(
            "releasing {} keys outside {} -> {}",
            pairs.len(),
            range,
            source
        );
        self.mailbox.send(source, DhtMsg::Redist { pairs }).await
    }

    /// Handler of unsolicited bulk key transfer.
    pub(super) fn handle_redist(
        &mut self,
        source: EndpointId,
        pairs: BTreeMap<Key, Value>,
    ) -> Result<(), DhtError> {
        self.ensure_active(source, MsgTag::Redist)?;

        pf_debug!("received {} migrated keys <- {}", pairs.len(), source);
        self.store.extend(pairs);
        Ok(())
    }
}

// StorageNode REMOVE handling
impl StorageNode {
    /// Handler of REMOVE. If my successor holds the target ID, it leaves the
    /// ring: it hands me its keys and its own successor, which I adopt and
    /// re-parent. The keys go on to the new successor, which has absorbed the
    /// removed range. Otherwise the request goes on to my successor.
    pub(super) async fn handle_remove(
        &mut self,
        source: EndpointId,
        target_id: LogicalId,
    ) -> Result<(), DhtError> {
        self.ensure_active(source, MsgTag::Remove)?;
        let my_id = self.my_id()?;
        let child = self.my_child()?;

        if self.query_storage_id(child).await? != Some(target_id) {
            return self.forward(DhtMsg::Remove { target_id }).await;
        }
        if child == HEAD || child == self.tail() {
            return self
                .reject(format!("id {} is a permanent node", target_id))
                .await;
        }

        self.mailbox
            .send(child, DhtMsg::RemoveNode { parent: self.me })
            .await?;

        let (_, reply) = self
            .mailbox
            .recv_from(Some(child), Some(MsgTag::Redist))
            .await?;
        let pairs = match reply {
            DhtMsg::Redist { pairs } => pairs,
            _ => {
                return logged_err!("unexpected reply {:?} <- {}", reply, child)
            }
        };
        let (_, reply) = self
            .mailbox
            .recv_from(Some(child), Some(MsgTag::NewChildRank))
            .await?;
        let new_child = match reply {
            DhtMsg::NewChildRank { child } => child,
            _ => {
                return logged_err!("unexpected reply {:?} <- {}", reply, child)
            }
        };

        // relink past the removed node
        self.child = Some(new_child);
        self.mailbox
            .send(
                new_child,
                DhtMsg::UpdateParent {
                    new_parent_id: my_id,
                },
            )
            .await?;

        // keep what I own, relay the rest to whoever absorbed the range
        let num_moved = pairs.len();
        let (kept, relayed): (BTreeMap<_, _>, BTreeMap<_, _>) =
            pairs.into_iter().partition(|(k, _)| self.owns(*k));
        self.store.extend(kept);
        if !relayed.is_empty() {
            self.mailbox
                .send(new_child, DhtMsg::Redist { pairs: relayed })
                .await?;
        }

        pf_info!(
            "removed id {} at endpoint {}, new child {}, moved {} keys",
            target_id,
            child,
            new_child,
            num_moved
        );
        self.signal_head(DhtMsg::Ack).await
    }

    /// Handler of the directive to leave the ring: hand all keys and my
    /// successor to my parent, then deactivate.
    pub(super) async fn handle_remove_node(
        &mut self,
        source: EndpointId,
        parent: EndpointId,
    ) -> Result<(), DhtError> {
        if !self.active || self.role != NodeRole::Joinable {
            return self.protocol_violation(source, MsgTag::RemoveNode);
        }
        let child = self.my_child()?;

        let pairs = std::mem::take(&mut self.store);
        self.mailbox.send(parent, DhtMsg::Redist { pairs }).await?;
        self.mailbox
            .send(parent, DhtMsg::NewChildRank { child })
            .await?;

        pf_info!("leaving ring as id {:?}", self.storage_id);
        self.active = false;
        self.storage_id = None;
        self.parent_id = None;
        self.child = None;
        Ok(())
    }
}

#[cfg(test)]
mod membership_tests {
    use super::*;
    use crate::transport::TransportHub;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn init_then_serve() -> Result<(), DhtError> {
        let mut hub = TransportHub::new_and_setup(4, 100)?;
        let node = StorageNode::new(hub.take_mailbox(1)?, 1000)?;
        let mut head = hub.take_mailbox(0)?;
        let mut tail = hub.take_mailbox(2)?;
        let handle = tokio::spawn(node.run());

        head.send(
            1,
            DhtMsg::InitNode {
                parent: 0,
                child: 2,
                parent_id: 0,
                new_id: 500,
            },
        )
        .await?;
        head.send(
            1,
            DhtMsg::Redist {
                pairs: BTreeMap::from([(9, 100)]),
            },
        )
        .await?;
        head.send(1, DhtMsg::Get { key: 9 }).await?;
        assert_eq!(
            head.recv_any().await?,
            (
                1,
                DhtMsg::RetVal {
                    value: Some(100),
                    owner: 500
                }
            )
        );
        // not mine, goes on to my child
        head.send(1, DhtMsg::Get { key: 501 }).await?;
        assert_eq!(tail.recv_any().await?, (1, DhtMsg::Get { key: 501 }));

        head.send(1, DhtMsg::End).await?;
        let snap = handle.await??;
        assert!(snap.active);
        assert_eq!(snap.owned_range(), Some(KeyRange::new(0, 500)));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn release_after_shrink() -> Result<(), DhtError> {
        let mut hub = TransportHub::new_and_setup(4, 100)?;
        let tail = StorageNode::new(hub.take_mailbox(2)?, 1000)?;
        let mut head = hub.take_mailbox(0)?;
        let handle = tokio::spawn(tail.run());

        for key in [9, 300, 501, 999] {
            head.send(2, DhtMsg::Put { key, value: 1 }).await?;
            assert_eq!(head.recv_any().await?, (2, DhtMsg::Ack));
        }
        head.send(2, DhtMsg::UpdateParent { new_parent_id: 500 })
            .await?;
        head.send(2, DhtMsg::ReleaseKeys).await?;
        assert_eq!(
            head.recv_any().await?,
            (
                2,
                DhtMsg::Redist {
                    pairs: BTreeMap::from([(9, 1), (300, 1)])
                }
            )
        );

        head.send(2, DhtMsg::End).await?;
        let snap = handle.await??;
        assert_eq!(snap.parent_id, Some(500));
        assert_eq!(snap.store, BTreeMap::from([(501, 1), (999, 1)]));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn leave_on_remove_node() -> Result<(), DhtError> {
        let mut hub = TransportHub::new_and_setup(4, 100)?;
        let node = StorageNode::new(hub.take_mailbox(1)?, 1000)?;
        let mut head = hub.take_mailbox(0)?;
        let handle = tokio::spawn(node.run());

        head.send(
            1,
            DhtMsg::InitNode {
                parent: 0,
                child: 2,
                parent_id: 0,
                new_id: 500,
            },
        )
        .await?;
        head.send(1, DhtMsg::Put { key: 42, value: -3 }).await?;
        assert_eq!(head.recv_any().await?, (1, DhtMsg::Ack));
        head.send(1, DhtMsg::RemoveNode { parent: 0 }).await?;
        assert_eq!(
            head.recv_any().await?,
            (
                1,
                DhtMsg::Redist {
                    pairs: BTreeMap::from([(42, -3)])
                }
            )
        );
        assert_eq!(
            head.recv_any().await?,
            (1, DhtMsg::NewChildRank { child: 2 })
        );
        head.send(1, DhtMsg::GetStorageId).await?;
        assert_eq!(
            head.recv_any().await?,
            (1, DhtMsg::StorageId { storage_id: None })
        );

        head.send(1, DhtMsg::End).await?;
        let snap = handle.await??;
        assert!(!snap.active);
        assert_eq!(snap.storage_id, None);
        assert_eq!(snap.child, None);
        assert!(snap.store.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tail_refuses_removal() -> Result<(), DhtError> {
        let mut hub = TransportHub::new_and_setup(4, 100)?;
        let tail = StorageNode::new(hub.take_mailbox(2)?, 1000)?;
        let head = hub.take_mailbox(0)?;
        let handle = tokio::spawn(tail.run());
        head.send(2, DhtMsg::RemoveNode { parent: 0 }).await?;
        assert!(handle.await?.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn double_init_is_fatal() -> Result<(), DhtError> {
        let mut hub = TransportHub::new_and_setup(4, 100)?;
        let node = StorageNode::new(hub.take_mailbox(1)?, 1000)?;
        let head = hub.take_mailbox(0)?;
        let handle = tokio::spawn(node.run());
        let init = DhtMsg::InitNode {
            parent: 0,
            child: 2,
            parent_id: 0,
            new_id: 500,
        };
        head.send(1, init.clone()).await?;
        head.send(1, init).await?;
        assert!(handle.await?.is_err());
        Ok(())
    }
}
