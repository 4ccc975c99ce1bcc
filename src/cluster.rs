//! In-process ring launcher: sets up the transport, spawns one task per
//! storage endpoint, and collects their exit status at shutdown.

use crate::client::ClientDriver;
use crate::node::{
    client_endpoint, EndpointId, LogicalId, NodeSnapshot, StorageNode,
};
use crate::transport::TransportHub;
use crate::utils::{DhtError, RingView, ME};

use serde::Deserialize;

use tokio::task::JoinHandle;

/// Join handle of a node task.
type NodeHandle = JoinHandle<Result<NodeSnapshot, DhtError>>;

/// Configuration parameters struct of a ring.
#[derive(Debug, Clone, Deserialize)]
pub struct RingConfig {
    /// Storage ID of the permanent tail, which is also the largest key.
    pub max_id: LogicalId,

    /// Capacity of each endpoint's recv channel.
    pub chan_recv_cap: usize,
}

#[allow(clippy::derivable_impls)]
impl Default for RingConfig {
    fn default() -> Self {
        RingConfig {
            max_id: 1000,
            chan_recv_cap: 10000,
        }
    }
}

/// Exit status of one storage endpoint's task.
#[derive(Debug)]
pub struct NodeExit {
    pub endpoint: EndpointId,
    pub result: Result<NodeSnapshot, DhtError>,
}

impl NodeExit {
    #[inline]
    pub fn success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Handle to a running ring of storage endpoints.
pub struct RingCluster {
    /// Total number of endpoints, client included.
    population: EndpointId,

    /// Config parameters in use.
    config: RingConfig,

    /// Join handles of the node tasks, in endpoint order.
    node_handles: Vec<(EndpointId, NodeHandle)>,
}

impl RingCluster {
    /// Creates a ring of `population` endpoints and spawns every storage
    /// node onto the current tokio runtime. Returns the cluster handle and
    /// the driver bound to the client endpoint.
    pub fn new_and_setup(
        population: EndpointId,
        config_str: Option<&str>,
    ) -> Result<(Self, ClientDriver), DhtError> {
        let config = parsed_config!(config_str => RingConfig;
                                    max_id, chan_recv_cap)?;
        if population < 3 {
            return logged_err!(
                "population {} too small, need at least 3",
                population
            );
        }
        if config.max_id < 2 {
            return logged_err!("invalid config.max_id {}", config.max_id);
        }

        let mut hub =
            TransportHub::new_and_setup(population, config.chan_recv_cap)?;
        let client = client_endpoint(population);

        // create all nodes before spawning any, so that a failure leaves
        // nothing running
        let mut nodes = Vec::with_capacity(client as usize);
        for endpoint in 0..client {
            let mailbox = hub.take_mailbox(endpoint)?;
            nodes.push(StorageNode::new(mailbox, config.max_id)?);
        }
        let driver =
            ClientDriver::new(hub.take_mailbox(client)?, config.max_id)?;

        let node_handles = nodes
            .into_iter()
            .enumerate()
            .map(|(endpoint, node)| {
                let endpoint = endpoint as EndpointId;
                let handle = tokio::spawn(
                    ME.scope(format!("ep {}", endpoint), node.run()),
                );
                (endpoint, handle)
            })
            .collect();

        pf_info!(
            "ring of {} endpoints launched, max_id {}",
            population,
            config.max_id
        );
        Ok((
            RingCluster {
                population,
                config,
                node_handles,
            },
            driver,
        ))
    }

    #[inline]
    pub fn population(&self) -> EndpointId {
        self.population
    }

    #[inline]
    pub fn config(&self) -> &RingConfig {
        &self.config
    }

    /// Waits for every node task to terminate and collects their exits.
    /// Only returns after END has been issued or every node has failed.
    pub async fn join(self) -> Vec<NodeExit> {
        let mut exits = Vec::with_capacity(self.node_handles.len());
        for (endpoint, handle) in self.node_handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(DhtError::from(e)),
            };
            if let Err(ref e) = result {
                pf_warn!("endpoint {} exited with error: {}", endpoint, e);
            }
            exits.push(NodeExit { endpoint, result });
        }
        exits
    }
}

/// Checks the final states of a terminated ring: every node exited cleanly,
/// active nodes' owned ranges partition `[1, max_id]`, and every stored key
/// sits at its owner. Returns the resulting view of the ring.
pub fn check_final_state(
    max_id: LogicalId,
    exits: &[NodeExit],
) -> Result<RingView, DhtError> {
    let mut snapshots = Vec::with_capacity(exits.len());
    for exit in exits {
        match exit.result {
            Ok(ref snapshot) => snapshots.push(snapshot),
            Err(ref e) => {
                return Err(DhtError::msg(format!(
                    "endpoint {} failed: {}",
                    exit.endpoint, e
                )))
            }
        }
    }

    let view = RingView::build(
        max_id,
        snapshots.iter().filter_map(|snapshot| {
            match (snapshot.storage_id, snapshot.owned_range()) {
                (Some(id), Some(range)) => Some((id, range)),
                _ => None,
            }
        }),
    )?;
    view.check_partition()?;

    for snapshot in snapshots {
        let range = snapshot.owned_range();
        if let Some(key) = snapshot
            .store
            .keys()
            .find(|&&k| !range.is_some_and(|r| r.contains(k)))
        {
            return Err(DhtError::msg(format!(
                "endpoint {} holds key {} outside its range {:?}",
                snapshot.endpoint, key, range
            )));
        }
    }

    Ok(view)
}

#[cfg(test)]
mod cluster_tests {
    use super::*;
    use crate::node::{Key, NodeRole, Value};
    use rand::seq::IteratorRandom;
    use rand::Rng;
    use std::collections::{BTreeMap, HashMap};

    async fn end_and_check(
        cluster: RingCluster,
        mut driver: ClientDriver,
    ) -> Result<Vec<NodeExit>, DhtError> {
        let max_id = cluster.config().max_id;
        driver.end().await?;
        let exits = cluster.join().await;
        check_final_state(max_id, &exits)?;
        Ok(exits)
    }

    fn snapshot_of(exits: &[NodeExit], endpoint: EndpointId) -> &NodeSnapshot {
        match exits[endpoint as usize].result {
            Ok(ref snapshot) => snapshot,
            Err(ref e) => panic!("endpoint {} failed: {}", endpoint, e),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn invalid_setup() -> Result<(), DhtError> {
        assert!(RingCluster::new_and_setup(2, None).is_err());
        assert!(RingCluster::new_and_setup(5, Some("foo = 1")).is_err());
        assert!(RingCluster::new_and_setup(5, Some("max_id = 1")).is_err());
        assert!(
            RingCluster::new_and_setup(5, Some("chan_recv_cap = 0")).is_err()
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn put_get_on_initial_ring() -> Result<(), DhtError> {
        let (cluster, mut driver) = RingCluster::new_and_setup(5, None)?;
        driver.put(9, 100).await?;
        assert_eq!(driver.get(9).await?, (Some(100), 1000));
        assert_eq!(driver.get(10).await?, (None, 1000));
        driver.put(9, -7).await?;
        assert_eq!(driver.get(9).await?, (Some(-7), 1000));
        end_and_check(cluster, driver).await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn add_then_put_get() -> Result<(), DhtError> {
        let (cluster, mut driver) = RingCluster::new_and_setup(5, None)?;
        driver.add(2, 500).await?;
        driver.put(9, 100).await?;
        assert_eq!(driver.get(9).await?, (Some(100), 500));
        driver.put(501, 1).await?;
        assert_eq!(driver.get(501).await?, (Some(1), 1000));

        let exits = end_and_check(cluster, driver).await?;
        assert_eq!(snapshot_of(&exits, 2).store, BTreeMap::from([(9, 100)]));
        assert_eq!(snapshot_of(&exits, 3).store, BTreeMap::from([(501, 1)]));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn add_then_remove() -> Result<(), DhtError> {
        let (cluster, mut driver) = RingCluster::new_and_setup(5, None)?;
        driver.add(2, 500).await?;
        driver.put(9, 100).await?;
        driver.remove(500).await?;
        assert_eq!(driver.get(9).await?, (Some(100), 1000));

        let exits = end_and_check(cluster, driver).await?;
        let removed = snapshot_of(&exits, 2);
        assert!(!removed.active);
        assert!(removed.store.is_empty());
        assert_eq!(snapshot_of(&exits, 0).child, Some(3));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn end_terminates_all() -> Result<(), DhtError> {
        let (cluster, mut driver) = RingCluster::new_and_setup(5, None)?;
        driver.add(1, 300).await?;
        let exits = end_and_check(cluster, driver).await?;

        assert_eq!(exits.len(), 4);
        assert!(exits.iter().all(|exit| exit.success()));
        assert_eq!(snapshot_of(&exits, 0).role, NodeRole::Head);
        assert!(snapshot_of(&exits, 1).active);
        assert!(!snapshot_of(&exits, 2).active);
        assert_eq!(snapshot_of(&exits, 3).parent_id, Some(300));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn add_migrates_stored_keys() -> Result<(), DhtError> {
        let (cluster, mut driver) = RingCluster::new_and_setup(5, None)?;
        for key in [9, 250, 251, 700, 1000] {
            driver.put(key, key as Value + 1).await?;
        }

        driver.add(1, 250).await?;
        assert_eq!(driver.get(9).await?, (Some(10), 250));
        assert_eq!(driver.get(250).await?, (Some(251), 250));
        assert_eq!(driver.get(251).await?, (Some(252), 1000));

        driver.add(2, 600).await?;
        assert_eq!(driver.get(9).await?, (Some(10), 250));
        assert_eq!(driver.get(251).await?, (Some(252), 600));
        assert_eq!(driver.get(700).await?, (Some(701), 1000));
        assert_eq!(driver.get(1000).await?, (Some(1001), 1000));

        let exits = end_and_check(cluster, driver).await?;
        assert_eq!(
            snapshot_of(&exits, 1).store,
            BTreeMap::from([(9, 10), (250, 251)])
        );
        assert_eq!(snapshot_of(&exits, 2).store, BTreeMap::from([(251, 252)]));
        assert_eq!(
            snapshot_of(&exits, 3).store,
            BTreeMap::from([(700, 701), (1000, 1001)])
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn remove_absorbs_and_frees_endpoint() -> Result<(), DhtError> {
        let (cluster, mut driver) = RingCluster::new_and_setup(6, None)?;
        driver.add(1, 300).await?;
        driver.add(2, 600).await?;
        for key in [100, 400, 800] {
            driver.put(key, -(key as Value)).await?;
        }
        assert_eq!(driver.get(400).await?, (Some(-400), 600));

        driver.remove(300).await?;
        assert_eq!(driver.get(100).await?, (Some(-100), 600));
        driver.remove(600).await?;
        assert_eq!(driver.get(100).await?, (Some(-100), 1000));
        assert_eq!(driver.get(400).await?, (Some(-400), 1000));

        // removed endpoint can be added back under a different id
        driver.add(1, 700).await?;
        assert_eq!(driver.get(400).await?, (Some(-400), 700));
        assert_eq!(driver.get(800).await?, (Some(-800), 1000));

        // insertion right after the head takes its keys from the old child
        driver.put(30, -30).await?;
        assert_eq!(driver.get(30).await?, (Some(-30), 700));
        driver.add(3, 50).await?;
        assert_eq!(driver.get(30).await?, (Some(-30), 50));
        assert_eq!(driver.get(100).await?, (Some(-100), 700));
        assert_eq!(driver.get(400).await?, (Some(-400), 700));

        let exits = end_and_check(cluster, driver).await?;
        assert!(!snapshot_of(&exits, 2).active);
        assert_eq!(snapshot_of(&exits, 1).storage_id, Some(700));
        assert_eq!(snapshot_of(&exits, 3).storage_id, Some(50));
        assert_eq!(snapshot_of(&exits, 3).store, BTreeMap::from([(30, -30)]));
        assert_eq!(
            snapshot_of(&exits, 1).store,
            BTreeMap::from([(100, -100), (400, -400)])
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn bad_commands_rejected() -> Result<(), DhtError> {
        let (cluster, mut driver) = RingCluster::new_and_setup(5, None)?;
        driver.add(1, 500).await?;
        driver.put(9, 100).await?;

        // duplicate id
        assert!(driver.add(2, 500).await.is_err());
        // candidate already active
        assert!(driver.add(1, 700).await.is_err());
        // not joinable endpoints
        assert!(driver.add(0, 700).await.is_err());
        assert!(driver.add(3, 700).await.is_err());
        assert!(driver.add(4, 700).await.is_err());
        // ids out of range
        assert!(driver.add(2, 0).await.is_err());
        assert!(driver.add(2, 1000).await.is_err());
        // permanent or unknown nodes
        assert!(driver.remove(0).await.is_err());
        assert!(driver.remove(1000).await.is_err());
        assert!(driver.remove(777).await.is_err());
        assert!(driver.remove(1001).await.is_err());
        // keys out of range
        assert!(driver.put(0, 1).await.is_err());
        assert!(driver.get(1001).await.is_err());

        // ring left intact
        assert_eq!(driver.get(9).await?, (Some(100), 500));
        driver.add(2, 700).await?;
        assert_eq!(driver.get(600).await?, (None, 700));

        end_and_check(cluster, driver).await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn repeated_gets_agree() -> Result<(), DhtError> {
        let (cluster, mut driver) = RingCluster::new_and_setup(5, None)?;
        driver.add(2, 400).await?;
        driver.put(33, 3).await?;
        let first = driver.get(33).await?;
        for _ in 0..5 {
            assert_eq!(driver.get(33).await?, first);
        }
        let missing = driver.get(34).await?;
        assert_eq!(missing, (None, 400));
        assert_eq!(driver.get(34).await?, missing);
        end_and_check(cluster, driver).await?;
        Ok(())
    }

    /// Storage ID of the owner of `key` given the joinable members' IDs.
    fn model_owner(
        members: &BTreeMap<LogicalId, EndpointId>,
        key: Key,
        max_id: LogicalId,
    ) -> LogicalId {
        members
            .range(key..)
            .next()
            .map_or(max_id, |(&id, _)| id)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn random_ops_match_model() -> Result<(), DhtError> {
        let max_id: LogicalId = 100;
        let population: EndpointId = 8;
        let joinables: Vec<EndpointId> = (1..population - 2).collect();
        let (cluster, mut driver) =
            RingCluster::new_and_setup(population, Some("max_id = 100"))?;

        let mut rng = rand::thread_rng();
        let mut members: BTreeMap<LogicalId, EndpointId> = BTreeMap::new();
        let mut store: HashMap<Key, Value> = HashMap::new();

        for _ in 0..300 {
            match rng.gen_range(0..10) {
                0..=3 => {
                    let key = rng.gen_range(1..=max_id);
                    let value = rng.gen_range(-1000..1000);
                    driver.put(key, value).await?;
                    store.insert(key, value);
                }
                4..=6 => {
                    let key = rng.gen_range(1..=max_id);
                    assert_eq!(
                        driver.get(key).await?,
                        (
                            store.get(&key).copied(),
                            model_owner(&members, key, max_id)
                        )
                    );
                }
                7 | 8 => {
                    let free = joinables
                        .iter()
                        .filter(|ep| !members.values().any(|m| m == *ep))
                        .choose(&mut rng)
                        .copied();
                    let id = rng.gen_range(1..max_id);
                    match free {
                        Some(ep) if !members.contains_key(&id) => {
                            driver.add(ep, id).await?;
                            members.insert(id, ep);
                        }
                        _ => {
                            let ep = rng.gen_range(1..population - 2);
                            assert!(
                                members.contains_key(&id)
                                    || members.values().any(|m| *m == ep)
                            );
                            assert!(driver.add(ep, id).await.is_err());
                        }
                    }
                }
                _ => {
                    let target = members.keys().choose(&mut rng).copied();
                    if let Some(id) = target {
                        driver.remove(id).await?;
                        members.remove(&id);
                    } else {
                        assert!(driver.remove(50).await.is_err());
                    }
                }
            }
        }

        for key in 1..=max_id {
            assert_eq!(
                driver.get(key).await?.1,
                model_owner(&members, key, max_id)
            );
        }

        driver.end().await?;
        let exits = cluster.join().await;
        let view = check_final_state(max_id, &exits)?;
        for key in 1..=max_id {
            assert_eq!(
                view.owner_of(key),
                Some(model_owner(&members, key, max_id))
            );
        }

        let mut collected: HashMap<Key, Value> = HashMap::new();
        for exit in &exits {
            if let Ok(ref snapshot) = exit.result {
                collected.extend(snapshot.store.iter().map(|(&k, &v)| (k, v)));
            }
        }
        assert_eq!(collected, store);
        Ok(())
    }
}
