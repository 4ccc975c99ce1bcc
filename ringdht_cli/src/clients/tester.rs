//! Correctness testing client. Every test case launches a fresh ring, drives
//! it through the client driver, then shuts it down and checks the final
//! state of all endpoints.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use log::{self, LevelFilter};

use lazy_static::lazy_static;

use rand::seq::IteratorRandom;
use rand::Rng;

use serde::Deserialize;

use ringdht::{
    check_final_state, logged_err, parsed_config, pf_error, ClientDriver,
    DhtError, EndpointId, Key, LogicalId, RingCluster, Value,
};

lazy_static! {
    /// List of all tests. If the flag is true, the test is marked as basic.
    static ref ALL_TESTS: Vec<(&'static str, bool)> = vec![
        ("put_get", true),
        ("add_node", true),
        ("remove_node", true),
        ("shutdown", true),
        ("migration", true),
        ("rejections", true),
        ("random_ops", false),
    ];
}

/// Mode parameters struct.
#[derive(Debug, Deserialize)]
pub struct ModeParamsTester {
    /// Name of individual test to run, or 'basic' to run the basic set of
    /// tests, or 'all' to run all tests.
    pub test_name: String,

    /// Whether to continue next test upon failed test.
    pub keep_going: bool,

    /// Do not suppress logger output.
    pub logger_on: bool,

    /// Number of random commands issued by the random_ops test.
    pub num_random_ops: usize,
}

#[allow(clippy::derivable_impls)]
impl Default for ModeParamsTester {
    fn default() -> Self {
        ModeParamsTester {
            test_name: "basic".into(),
            keep_going: false,
            logger_on: false,
            num_random_ops: 500,
        }
    }
}

/// Compares a got value against the expected one.
fn expect_eq<T: PartialEq + fmt::Debug>(
    what: &str,
    got: T,
    expect: T,
) -> Result<(), DhtError> {
    if got == expect {
        Ok(())
    } else {
        Err(DhtError::msg(format!(
            "{} mismatch: expect {:?}, got {:?}",
            what, expect, got
        )))
    }
}

/// Expects a command to have been rejected.
fn expect_err<T: fmt::Debug>(
    what: &str,
    result: Result<T, DhtError>,
) -> Result<(), DhtError> {
    match result {
        Err(_) => Ok(()),
        Ok(got) => Err(DhtError::msg(format!(
            "{} expected to fail, got {:?}",
            what, got
        ))),
    }
}

/// Correctness testing client struct.
pub struct ClientTester {
    /// Population of the rings launched.
    population: EndpointId,

    /// Ring configuration TOML string.
    config_str: Option<String>,

    /// Mode parameters struct.
    params: ModeParamsTester,
}

impl ClientTester {
    /// Creates a new testing client.
    pub fn new(
        population: EndpointId,
        config_str: Option<String>,
        params_str: Option<&str>,
    ) -> Result<Self, DhtError> {
        let params = parsed_config!(params_str => ModeParamsTester;
                                    test_name, keep_going, logger_on,
                                    num_random_ops)?;
        if population < 5 {
            return logged_err!(
                "tester needs population >= 5 for two joinable endpoints"
            );
        }

        // suppress all logger levels if not logger_on
        if !params.logger_on {
            log::set_max_level(LevelFilter::Error);
        }

        Ok(ClientTester {
            population,
            config_str,
            params,
        })
    }

    /// Runs the individual correctness test on a fresh ring.
    async fn do_test_by_name(&mut self, name: &str) -> Result<(), DhtError> {
        let (cluster, mut driver) = RingCluster::new_and_setup(
            self.population,
            self.config_str.as_deref(),
        )?;
        let max_id = cluster.config().max_id;

        let mut result = match name {
            "put_get" => self.test_put_get(&mut driver).await,
            "add_node" => self.test_add_node(&mut driver).await,
            "remove_node" => self.test_remove_node(&mut driver).await,
            "shutdown" => self.test_shutdown(&mut driver).await,
            "migration" => self.test_migration(&mut driver).await,
            "rejections" => self.test_rejections(&mut driver).await,
            "random_ops" => self.test_random_ops(&mut driver).await,
            _ => Err(DhtError::msg(format!(
                "unrecognized test name '{}'",
                name
            ))),
        };

        if !driver.ended() {
            if let Err(e) = driver.end().await {
                pf_error!("failed to shut ring down: {}", e);
                println!("{:>16} | {:^6} | {}", name, "FAIL", e);
                return Err(e);
            }
        }
        let exits = cluster.join().await;
        if result.is_ok() {
            result = check_final_state(max_id, &exits).map(|_| ());
        }

        if let Err(ref e) = result {
            println!("{:>16} | {:^6} | {}", name, "FAIL", e);
        } else {
            println!("{:>16} | {:^6} | --", name, "PASS");
        }
        result
    }

    /// Runs the specified correctness test.
    pub async fn run(&mut self) -> Result<(), DhtError> {
        let test_name = self.params.test_name.clone();
        let mut all_pass = true;

        println!("{:^16} | {:^6} | Notes", "Test Case", "Result");
        match &test_name[..] {
            "basic" => {
                for (name, basic) in ALL_TESTS.iter() {
                    if *basic {
                        let result = self.do_test_by_name(name).await;
                        if result.is_err() {
                            all_pass = false;
                            if !self.params.keep_going {
                                return result;
                            }
                        }
                    }
                }
            }
            "all" => {
                for (name, _) in ALL_TESTS.iter() {
                    let result = self.do_test_by_name(name).await;
                    if result.is_err() {
                        all_pass = false;
                        if !self.params.keep_going {
                            return result;
                        }
                    }
                }
            }
            _ => return self.do_test_by_name(&test_name).await,
        }

        if all_pass {
            Ok(())
        } else {
            Err(DhtError::msg("some test(s) failed"))
        }
    }
}

// List of tests:
impl ClientTester {
    /// Put then get on the initial two-node ring.
    async fn test_put_get(
        &self,
        driver: &mut ClientDriver,
    ) -> Result<(), DhtError> {
        let max_id = driver.max_id();
        expect_eq("get", driver.get(9).await?, (None, max_id))?;
        driver.put(9, 100).await?;
        expect_eq("get", driver.get(9).await?, (Some(100), max_id))?;
        driver.put(9, 200).await?;
        expect_eq("get", driver.get(9).await?, (Some(200), max_id))?;
        Ok(())
    }

    /// Added node takes over the lower half of the key space.
    async fn test_add_node(
        &self,
        driver: &mut ClientDriver,
    ) -> Result<(), DhtError> {
        let max_id = driver.max_id();
        let mid = max_id / 2;
        driver.add(2, mid).await?;
        driver.put(9, 100).await?;
        expect_eq("get", driver.get(9).await?, (Some(100), mid))?;
        expect_eq("get", driver.get(mid + 1).await?, (None, max_id))?;
        Ok(())
    }

    /// Removed node's keys fall back to its successor.
    async fn test_remove_node(
        &self,
        driver: &mut ClientDriver,
    ) -> Result<(), DhtError> {
        let max_id = driver.max_id();
        let mid = max_id / 2;
        driver.add(2, mid).await?;
        driver.put(9, 100).await?;
        driver.remove(mid).await?;
        expect_eq("get", driver.get(9).await?, (Some(100), max_id))?;

        // freed endpoint is joinable again
        driver.add(2, mid + 1).await?;
        expect_eq("get", driver.get(9).await?, (Some(100), mid + 1))?;
        Ok(())
    }

    /// END with three active nodes; the final check is done by the caller.
    async fn test_shutdown(
        &self,
        driver: &mut ClientDriver,
    ) -> Result<(), DhtError> {
        driver.add(1, driver.max_id() / 3).await?;
        driver.end().await?;
        expect_err("get after end", driver.get(9).await)
    }

    /// Keys stored before an ADD move to the new node.
    async fn test_migration(
        &self,
        driver: &mut ClientDriver,
    ) -> Result<(), DhtError> {
        let max_id = driver.max_id();
        let (low, high) = (max_id / 4, max_id / 4 * 3);
        let keys = [1, low, low + 1, high, high + 1, max_id];
        for key in keys {
            driver.put(key, key as Value).await?;
        }

        driver.add(1, low).await?;
        driver.add(2, high).await?;
        for key in keys {
            let owner = if key <= low {
                low
            } else if key <= high {
                high
            } else {
                max_id
            };
            expect_eq(
                "get",
                driver.get(key).await?,
                (Some(key as Value), owner),
            )?;
        }
        Ok(())
    }

    /// Commands that would break the ring are refused and change nothing.
    async fn test_rejections(
        &self,
        driver: &mut ClientDriver,
    ) -> Result<(), DhtError> {
        let max_id = driver.max_id();
        let mid = max_id / 2;
        let tail = self.population - 2;
        driver.add(1, mid).await?;
        driver.put(9, 100).await?;

        expect_err("duplicate id", driver.add(2, mid).await)?;
        expect_err("active endpoint", driver.add(1, mid + 1).await)?;
        expect_err("head endpoint", driver.add(0, mid + 1).await)?;
        expect_err("tail endpoint", driver.add(tail, mid + 1).await)?;
        expect_err("id zero", driver.add(2, 0).await)?;
        expect_err("id max", driver.add(2, max_id).await)?;
        expect_err("remove head", driver.remove(0).await)?;
        expect_err("remove tail", driver.remove(max_id).await)?;
        expect_err("remove unknown", driver.remove(mid + 1).await)?;
        expect_err("key zero", driver.put(0, 1).await)?;
        expect_err("key beyond max", driver.get(max_id + 1).await)?;

        expect_eq("get", driver.get(9).await?, (Some(100), mid))?;
        Ok(())
    }

    /// Random mix of commands checked against a local model of the ring.
    async fn test_random_ops(
        &self,
        driver: &mut ClientDriver,
    ) -> Result<(), DhtError> {
        let max_id = driver.max_id();
        let joinables: Vec<EndpointId> = (1..self.population - 2).collect();
        let mut members: BTreeMap<LogicalId, EndpointId> = BTreeMap::new();
        let mut store: HashMap<Key, Value> = HashMap::new();
        let owner_of = |members: &BTreeMap<LogicalId, EndpointId>, key: Key| {
            members
                .range(key..)
                .next()
                .map_or(max_id, |(&id, _)| id)
        };

        for _ in 0..self.params.num_random_ops {
            // ThreadRng is not Send, so never hold it across an await
            let (op, key, value, id) = {
                let mut rng = rand::thread_rng();
                (
                    rng.gen_range(0..10),
                    rng.gen_range(1..=max_id),
                    rng.gen_range(-1000..1000),
                    rng.gen_range(1..max_id),
                )
            };

            match op {
                0..=3 => {
                    driver.put(key, value).await?;
                    store.insert(key, value);
                }
                4..=6 => {
                    expect_eq(
                        "get",
                        driver.get(key).await?,
                        (store.get(&key).copied(), owner_of(&members, key)),
                    )?;
                }
                7 | 8 => {
                    let free = joinables
                        .iter()
                        .filter(|ep| !members.values().any(|m| m == *ep))
                        .choose(&mut rand::thread_rng())
                        .copied();
                    match free {
                        Some(ep) if !members.contains_key(&id) => {
                            driver.add(ep, id).await?;
                            members.insert(id, ep);
                        }
                        _ => expect_err("add", driver.add(1, id).await)?,
                    }
                }
                _ => {
                    let target = members
                        .keys()
                        .choose(&mut rand::thread_rng())
                        .copied();
                    if let Some(id) = target {
                        driver.remove(id).await?;
                        members.remove(&id);
                    }
                }
            }
        }

        for key in 1..=max_id {
            expect_eq(
                "owner",
                driver.get(key).await?.1,
                owner_of(&members, key),
            )?;
        }
        Ok(())
    }
}
