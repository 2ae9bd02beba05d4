//! Load balancer client contract and an in-memory implementation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use flock_kernel::FlockError;
use flock_runtime::Node;

#[async_trait]
pub trait Balancer: Send + Sync {
    async fn get_nodes(&self, balancer: &str, pool: &str) -> Result<BTreeSet<Node>, FlockError>;

    async fn add_nodes(&self, balancer: &str, pool: &str, nodes: &[Node])
        -> Result<(), FlockError>;

    async fn delete_nodes(
        &self,
        balancer: &str,
        pool: &str,
        nodes: &[Node],
    ) -> Result<(), FlockError>;

    /// Returns whether the pool was deleted.
    async fn delete_pool_if_empty(&self, balancer: &str, pool: &str) -> Result<bool, FlockError>;
}

/// One recorded balancer call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BalancerCall {
    GetNodes { pool: String },
    AddNodes { pool: String, nodes: Vec<Node> },
    DeleteNodes { pool: String, nodes: Vec<Node> },
    DeletePoolIfEmpty { pool: String },
}

#[derive(Default)]
struct State {
    pools: BTreeMap<(String, String), BTreeSet<Node>>,
    calls: Vec<BalancerCall>,
}

#[derive(Clone, Default)]
pub struct InMemoryBalancer {
    state: Arc<Mutex<State>>,
}

impl InMemoryBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, FlockError> {
        self.state
            .lock()
            .map_err(|_| FlockError::Balancer("in-memory balancer lock poisoned".to_string()))
    }

    pub fn seed_pool(&self, balancer: &str, pool: &str, nodes: &[Node]) -> Result<(), FlockError> {
        self.state()?
            .pools
            .insert(key(balancer, pool), nodes.iter().cloned().collect());
        Ok(())
    }

    /// Members of a pool, `None` if the pool does not exist.
    pub fn pool(&self, balancer: &str, pool: &str) -> Result<Option<BTreeSet<Node>>, FlockError> {
        Ok(self.state()?.pools.get(&key(balancer, pool)).cloned())
    }

    pub fn calls(&self) -> Result<Vec<BalancerCall>, FlockError> {
        Ok(self.state()?.calls.clone())
    }
}

fn key(balancer: &str, pool: &str) -> (String, String) {
    (balancer.to_string(), pool.to_string())
}

#[async_trait]
impl Balancer for InMemoryBalancer {
    async fn get_nodes(&self, balancer: &str, pool: &str) -> Result<BTreeSet<Node>, FlockError> {
        let mut state = self.state()?;
        state.calls.push(BalancerCall::GetNodes {
            pool: pool.to_string(),
        });
        Ok(state
            .pools
            .get(&key(balancer, pool))
            .cloned()
            .unwrap_or_default())
    }

    async fn add_nodes(
        &self,
        balancer: &str,
        pool: &str,
        nodes: &[Node],
    ) -> Result<(), FlockError> {
        let mut state = self.state()?;
        state.calls.push(BalancerCall::AddNodes {
            pool: pool.to_string(),
            nodes: nodes.to_vec(),
        });
        state
            .pools
            .entry(key(balancer, pool))
            .or_default()
            .extend(nodes.iter().cloned());
        Ok(())
    }

    async fn delete_nodes(
        &self,
        balancer: &str,
        pool: &str,
        nodes: &[Node],
    ) -> Result<(), FlockError> {
        let mut state = self.state()?;
        state.calls.push(BalancerCall::DeleteNodes {
            pool: pool.to_string(),
            nodes: nodes.to_vec(),
        });
        if let Some(members) = state.pools.get_mut(&key(balancer, pool)) {
            for node in nodes {
                members.remove(node);
            }
        }
        Ok(())
    }

    async fn delete_pool_if_empty(&self, balancer: &str, pool: &str) -> Result<bool, FlockError> {
        let mut state = self.state()?;
        state.calls.push(BalancerCall::DeletePoolIfEmpty {
            pool: pool.to_string(),
        });
        let pool_key = key(balancer, pool);
        let empty = state
            .pools
            .get(&pool_key)
            .is_some_and(|members| members.is_empty());
        if empty {
            state.pools.remove(&pool_key);
        }
        Ok(empty)
    }
}
