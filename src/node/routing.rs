//! StorageNode -- key operations routing.

use super::*;

// StorageNode PUT/GET handling
impl StorageNode {
    /// Handler of PUT: store the pair if I own the key, otherwise pass it on
    /// to my successor.
    pub(super) async fn handle_put(
        &mut self,
        source: EndpointId,
        key: Key,
        value: Value,
    ) -> Result<(), DhtError> {
        self.ensure_active(source, MsgTag::Put)?;

        if !self.owns(key) {
            return self.forward(DhtMsg::Put { key, value }).await;
        }

        let old_value = self.store.insert(key, value);
        pf_debug!("put key {} value {} (old {:?})", key, value, old_value);
        self.signal_head(DhtMsg::Ack).await
    }

    /// Handler of GET: reply with the value and my storage ID if I own the
    /// key, otherwise pass it on to my successor.
    pub(super) async fn handle_get(
        &mut self,
        source: EndpointId,
        key: Key,
    ) -> Result<(), DhtError> {
        self.ensure_active(source, MsgTag::Get)?;

        if !self.owns(key) {
            return self.forward(DhtMsg::Get { key }).await;
        }

        let value = self.store.get(&key).copied();
        let owner = self.my_id()?;
        pf_debug!("get key {} -> {:?}", key, value);
        self.signal_head(DhtMsg::RetVal { value, owner }).await
    }
}
