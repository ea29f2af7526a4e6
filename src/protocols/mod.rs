//! Order handlers and protocol plugins, and the tables that register them.

pub mod containers;
pub mod cosmos;
pub mod ethclassic;
pub mod multigeth;

use crate::core::config::Config;
use crate::core::executor::{Fleet, FleetExecutor};
use crate::core::registry::{BuildEnv, OrderHandler, PluginError, Protocol, Protocols, Registry};
use crate::core::state::{BuildStateStore, Phase};
use crate::core::types::{Command, OrderType, Server};
use async_trait::async_trait;
use containers::ContainerOrders;
use cosmos::Cosmos;
use ethclassic::EthClassic;
use multigeth::Multigeth;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Payload of `build` and `addNodes`. For `addNodes`, `nodes` is the size of
/// the running network and `newNodes` the number to add.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildPayload {
    pub blockchain: String,
    pub nodes: usize,
    #[serde(default)]
    pub new_nodes: usize,
    /// Hosts of the network. Defaults to the command's target host.
    #[serde(default)]
    pub servers: Vec<Server>,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Every protocol plugin, by name.
pub fn protocols() -> Result<Protocols, String> {
    let geth: Arc<dyn Protocol> = Arc::new(Multigeth);
    let classic: Arc<dyn Protocol> = Arc::new(EthClassic);
    let cosmos: Arc<dyn Protocol> = Arc::new(Cosmos);
    Protocols::from_table(vec![
        (multigeth::NAME, geth),
        (ethclassic::NAME, Arc::clone(&classic)),
        (ethclassic::ALIAS, classic),
        (cosmos::NAME, cosmos),
    ])
}

/// The order-type table served by the engine.
pub fn registry(
    protocols: Arc<Protocols>,
    store: Arc<BuildStateStore>,
    executor: Arc<FleetExecutor>,
    config: &Config,
) -> Result<Registry, String> {
    let docker: Arc<dyn OrderHandler> = Arc::new(ContainerOrders);
    let build: Arc<dyn OrderHandler> = Arc::new(BuildOrders {
        protocols: Arc::clone(&protocols),
        store: Arc::clone(&store),
        executor: Arc::clone(&executor),
        phase: Phase::Build,
        output_file: config.docker_output_file.clone(),
        max_nodes: config.max_nodes,
    });
    let add: Arc<dyn OrderHandler> = Arc::new(BuildOrders {
        protocols,
        store,
        executor,
        phase: Phase::Add,
        output_file: config.docker_output_file.clone(),
        max_nodes: config.max_nodes,
    });
    Registry::from_table(vec![
        (OrderType::CreateContainer, Arc::clone(&docker)),
        (OrderType::StartContainer, Arc::clone(&docker)),
        (OrderType::RemoveContainer, Arc::clone(&docker)),
        (OrderType::CreateNetwork, Arc::clone(&docker)),
        (OrderType::RemoveNetwork, docker),
        (OrderType::Build, build),
        (OrderType::AddNodes, add),
    ])
}

/// Overlay the order's params on the plugin defaults, key by key.
pub fn merge_params(defaults: serde_json::Value, params: &serde_json::Value) -> serde_json::Value {
    match (defaults, params) {
        (serde_json::Value::Object(mut base), serde_json::Value::Object(over)) => {
            for (k, v) in over {
                base.insert(k.clone(), v.clone());
            }
            serde_json::Value::Object(base)
        }
        (base, serde_json::Value::Null) => base,
        (_, over) => over.clone(),
    }
}

/// `fixed + per_node * nodes` build steps, or Fatal when that does not fit.
pub fn step_count(fixed: u64, per_node: u64, nodes: usize) -> Result<u64, PluginError> {
    u64::try_from(nodes)
        .ok()
        .and_then(|n| n.checked_mul(per_node))
        .and_then(|n| n.checked_add(fixed))
        .ok_or_else(|| PluginError::fatal(format!("{} nodes is too many steps to track", nodes)))
}

pub(crate) fn to_json(value: &impl Serialize) -> Result<Vec<u8>, PluginError> {
    serde_json::to_vec(value).map_err(|e| PluginError::fatal(e.to_string()))
}

/// Scratch a scale-out needs from the network's build. Missing data is fatal.
pub(crate) fn required<T: serde::de::DeserializeOwned>(
    env: &BuildEnv,
    key: &str,
) -> Result<T, PluginError> {
    env.state
        .get_as(key)
        .map_err(PluginError::fatal)?
        .ok_or_else(|| {
            PluginError::fatal(format!(
                "network {} has no {} from a previous build",
                env.state.network(),
                key
            ))
        })
}

/// Runs a protocol's build or scale-out against a fleet, with a build state
/// from the store.
pub struct BuildOrders {
    protocols: Arc<Protocols>,
    store: Arc<BuildStateStore>,
    executor: Arc<FleetExecutor>,
    phase: Phase,
    output_file: String,
    max_nodes: usize,
}

impl BuildOrders {
    fn fleet(&self, command: &Command, payload: &BuildPayload) -> Result<Fleet, PluginError> {
        let network = &command.target.testnet;
        for server in &payload.servers {
            server.validate().map_err(PluginError::fatal)?;
        }
        let mut servers = payload.servers.clone();
        if servers.is_empty() {
            servers.push(containers::target_server(command));
        }

        let added = match self.phase {
            Phase::Build => 0,
            Phase::Add if payload.new_nodes == 0 => {
                return Err(PluginError::fatal("addNodes needs newNodes > 0"));
            }
            Phase::Add => payload.new_nodes,
        };
        let total = payload
            .nodes
            .checked_add(added)
            .filter(|total| *total <= self.max_nodes)
            .ok_or_else(|| {
                PluginError::fatal(format!(
                    "network {} would exceed the limit of {} nodes",
                    network, self.max_nodes
                ))
            })?;
        debug!(network = %network, total, "fleet sized");

        let fleet = match self.phase {
            Phase::Build => Fleet::new(network, servers, payload.nodes),
            Phase::Add => Fleet::expanded(network, servers, payload.nodes, added),
        };
        fleet.map_err(PluginError::fatal)
    }
}

#[async_trait]
impl OrderHandler for BuildOrders {
    async fn handle(&self, command: &Command) -> Result<Option<serde_json::Value>, PluginError> {
        let payload: BuildPayload = serde_json::from_value(command.order.payload.clone())
            .map_err(|e| {
                PluginError::fatal(format!(
                    "invalid {} payload: {}",
                    command.order.order_type, e
                ))
            })?;
        let plugin = self.protocols.get(&payload.blockchain).ok_or_else(|| {
            PluginError::fatal(format!("unknown blockchain {}", payload.blockchain))
        })?;
        let fleet = self.fleet(command, &payload)?;
        let params = merge_params(plugin.defaults(), &payload.params);

        let state = self.store.begin(&command.target.testnet, self.phase)?;
        info!(
            id = %command.id,
            network = %command.target.testnet,
            blockchain = plugin.name(),
            phase = %self.phase,
            nodes = fleet.len(),
            "operation started"
        );
        let env = BuildEnv {
            state: Arc::clone(&state),
            fleet,
            executor: Arc::clone(&self.executor),
            params,
            output_file: self.output_file.clone(),
        };
        let outcome = match self.phase {
            Phase::Build => plugin.build(&env).await,
            Phase::Add => plugin.add(&env).await,
        };
        match outcome {
            Ok(()) => {
                let report = self.store.finish(&state)?;
                let output = serde_json::to_value(report)
                    .map_err(|e| PluginError::fatal(format!("cannot encode report: {}", e)))?;
                Ok(Some(output))
            }
            Err(e) => {
                self.store.abort(&state);
                Err(e)
            }
        }
    }
}
