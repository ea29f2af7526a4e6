//! Fleet executor: run one operation on every node of a network concurrently.
//!
//! Each call is a join barrier. Every invocation runs to completion, and the call
//! fails with the first error observed if any node failed. Per-node outputs are
//! gathered by the joining task into pre-sized slots indexed by position, then
//! returned as an ordered, frozen `Vec`.

use super::types::{Node, Server};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Executes commands inside the nodes hosted by one server.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Run a command in the node and return its stdout.
    async fn exec(&self, node: &Node, cmd: &str) -> Result<String, String>;

    /// Start a long-running command in the node without waiting for it.
    async fn exec_detached(&self, node: &Node, cmd: &str) -> Result<(), String>;

    /// Write bytes to a file inside the node.
    async fn put_file(&self, node: &Node, data: &[u8], path: &str) -> Result<(), String>;
}

/// Hands out a client per server. Retrying flaky connections is its concern.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn connect(&self, server: &Server) -> Result<Arc<dyn NodeClient>, String>;
}

/// Which nodes of a fleet a fan-out covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    All,
    /// Only the nodes added by a scale-out
    New,
}

/// The servers and nodes of one network.
#[derive(Debug, Clone)]
pub struct Fleet {
    pub network: String,
    pub servers: Vec<Server>,
    nodes: Vec<Node>,
    new_from: usize,
}

impl Fleet {
    /// A fresh fleet of `count` nodes, spread round-robin across the servers.
    pub fn new(network: &str, servers: Vec<Server>, count: usize) -> Result<Self, String> {
        Self::expanded(network, servers, 0, count)
    }

    /// A fleet of `existing` nodes plus `added` new ones. Only the added nodes
    /// are covered by `Scope::New`.
    pub fn expanded(
        network: &str,
        servers: Vec<Server>,
        existing: usize,
        added: usize,
    ) -> Result<Self, String> {
        let total = existing
            .checked_add(added)
            .ok_or_else(|| format!("network {} node count overflows", network))?;
        if servers.is_empty() && total > 0 {
            return Err(format!("network {} has nodes but no servers", network));
        }
        let per = servers.len().max(1);
        let nodes = (0..total)
            .map(|i| Node {
                server: i % per,
                local_index: i / per,
                global_index: i,
            })
            .collect();
        Ok(Self {
            network: network.to_string(),
            servers,
            nodes,
            new_from: existing,
        })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn new_nodes(&self) -> &[Node] {
        &self.nodes[self.new_from..]
    }

    pub fn select(&self, scope: Scope) -> &[Node] {
        match scope {
            Scope::All => self.nodes(),
            Scope::New => self.new_nodes(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

pub struct FleetExecutor {
    provider: Arc<dyn ConnectionProvider>,
}

impl FleetExecutor {
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self { provider }
    }

    /// Run `f` on every node of the scope.
    pub async fn exec_scoped<F, Fut>(&self, fleet: &Fleet, scope: Scope, f: F) -> Result<(), String>
    where
        F: Fn(Arc<dyn NodeClient>, Node) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.fan_out(fleet, scope, f).await.map(|_| ())
    }

    /// Run `f` on every node of the scope, outputs in node order.
    pub async fn collect_scoped<T, F, Fut>(
        &self,
        fleet: &Fleet,
        scope: Scope,
        f: F,
    ) -> Result<Vec<T>, String>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn NodeClient>, Node) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, String>> + Send + 'static,
    {
        self.fan_out(fleet, scope, f).await
    }

    /// Run one command in a single node and return its stdout.
    pub async fn exec_one(&self, fleet: &Fleet, node: &Node, cmd: &str) -> Result<String, String> {
        let clients = self.clients(fleet, std::slice::from_ref(node)).await?;
        let client = clients
            .get(&node.server)
            .ok_or_else(|| format!("no client for {}", node))?;
        client
            .exec(node, cmd)
            .await
            .map_err(|e| format!("{}: {}", node, e))
    }

    /// Create a directory in every node of the scope.
    pub async fn mkdir(&self, fleet: &Fleet, scope: Scope, dir: &str) -> Result<(), String> {
        let cmd = Arc::new(format!("mkdir -p {}", dir));
        self.fan_out(fleet, scope, move |client, node| {
            let cmd = Arc::clone(&cmd);
            async move { client.exec(&node, &cmd).await.map(|_| ()) }
        })
        .await
        .map(|_| ())
    }

    /// Write the same bytes to `path` in every node of the scope.
    pub async fn copy_bytes(
        &self,
        fleet: &Fleet,
        scope: Scope,
        data: Vec<u8>,
        path: &str,
    ) -> Result<(), String> {
        let data = Arc::new(data);
        let path = Arc::new(path.to_string());
        self.fan_out(fleet, scope, move |client, node| {
            let data = Arc::clone(&data);
            let path = Arc::clone(&path);
            async move { client.put_file(&node, &data, &path).await }
        })
        .await
        .map(|_| ())
    }

    async fn clients(
        &self,
        fleet: &Fleet,
        nodes: &[Node],
    ) -> Result<HashMap<usize, Arc<dyn NodeClient>>, String> {
        let mut clients: HashMap<usize, Arc<dyn NodeClient>> = HashMap::new();
        for node in nodes {
            if clients.contains_key(&node.server) {
                continue;
            }
            let server = fleet
                .servers
                .get(node.server)
                .ok_or_else(|| format!("{} refers to a missing server", node))?;
            let client = self
                .provider
                .connect(server)
                .await
                .map_err(|e| format!("cannot connect to server {}: {}", server.id, e))?;
            clients.insert(node.server, client);
        }
        Ok(clients)
    }

    async fn fan_out<T, F, Fut>(&self, fleet: &Fleet, scope: Scope, f: F) -> Result<Vec<T>, String>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn NodeClient>, Node) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, String>> + Send + 'static,
    {
        let nodes = fleet.select(scope);
        let clients = self.clients(fleet, nodes).await?;
        let f = Arc::new(f);

        let mut set = JoinSet::new();
        for (slot, node) in nodes.iter().enumerate() {
            let client = Arc::clone(&clients[&node.server]);
            let f = Arc::clone(&f);
            let node = node.clone();
            set.spawn(async move {
                let label = node.to_string();
                let out = f(client, node).await;
                (slot, label, out)
            });
        }

        let mut slots: Vec<Option<T>> = (0..nodes.len()).map(|_| None).collect();
        let mut first_err: Option<String> = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((slot, _, Ok(value))) => slots[slot] = Some(value),
                Ok((_, label, Err(e))) => {
                    debug!(network = %fleet.network, node = %label, error = %e, "node failed");
                    first_err.get_or_insert_with(|| format!("{}: {}", label, e));
                }
                Err(e) => {
                    first_err.get_or_insert_with(|| format!("fan-out task failed: {}", e));
                }
            }
        }

        if let Some(e) = first_err {
            warn!(network = %fleet.network, error = %e, "fan-out failed");
            return Err(e);
        }
        slots
            .into_iter()
            .enumerate()
            .map(|(i, v)| v.ok_or_else(|| format!("no result for node slot {}", i)))
            .collect()
    }
}
