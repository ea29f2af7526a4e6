//! Cosmos: gaia nodes around a single validator.
//!
//! The first node creates the validator key and the genesis file; every node
//! then reports its tendermint id, receives that genesis and starts with all
//! other nodes as persistent peers.

use super::required;
use crate::core::executor::{NodeClient, Scope};
use crate::core::registry::{BuildEnv, PluginError, Protocol};
use crate::core::types::Node;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::info;

pub const NAME: &str = "cosmos";

const GENESIS_PATH: &str = "/root/.gaiad/config/genesis.json";
const GENESIS_FILE: &str = "genesis.json";
const KEY_NAME: &str = "validator";
const PASSWORD: &str = "password";
const P2P_PORT: u16 = 26656;
const RPC_PORT: u16 = 26657;

const KEY_CONF: &str = "cosmosConf";
const KEY_GENESIS: &str = "genesis";
const KEY_PEERS: &str = "peers";

/// Chain parameters. Anything omitted from the order takes its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct CosmosConf {
    pub chain_id: String,
    pub moniker: String,
    /// Coins granted to the validator account, as `<amount><denom>` pairs
    pub genesis_coins: Vec<String>,
}

impl Default for CosmosConf {
    fn default() -> Self {
        Self {
            chain_id: "whiteblock".to_string(),
            moniker: "whiteblock".to_string(),
            genesis_coins: vec![
                "100000000stake".to_string(),
                "100000000validatortoken".to_string(),
            ],
        }
    }
}

fn is_word(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl CosmosConf {
    pub fn from_params(params: &serde_json::Value) -> Result<Self, PluginError> {
        if params.is_null() {
            return Ok(Self::default());
        }
        let conf: Self = serde_json::from_value(params.clone())
            .map_err(|e| PluginError::fatal(format!("invalid cosmos params: {}", e)))?;
        for (field, value) in [("chainId", &conf.chain_id), ("moniker", &conf.moniker)] {
            if !is_word(value) {
                return Err(PluginError::fatal(format!(
                    "invalid cosmos params: {} {:?} must be letters, digits, '_' or '-'",
                    field, value
                )));
            }
        }
        let coins_ok = !conf.genesis_coins.is_empty()
            && conf.genesis_coins.iter().all(|coin| {
                coin.starts_with(|c: char| c.is_ascii_digit())
                    && coin
                        .chars()
                        .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase())
            });
        if !coins_ok {
            return Err(PluginError::fatal(format!(
                "invalid cosmos params: genesisCoins {:?} must be amounts with lowercase denoms",
                conf.genesis_coins
            )));
        }
        Ok(conf)
    }

    fn init_cmd(&self) -> String {
        format!("gaiad init --chain-id={} {}", self.chain_id, self.moniker)
    }
}

/// The validator address printed by `gaiacli keys show -a`.
pub fn parse_validator_address(out: &str) -> Result<String, String> {
    let address = out.trim();
    let valid = !address.is_empty()
        && address
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase());
    if valid {
        Ok(address.to_string())
    } else {
        Err(format!("no validator address in output: {}", address))
    }
}

/// Build a `<node id>@<ip>:26656` peer from `show-node-id` and `hostname -i` output.
pub fn parse_peer(out: &str) -> Result<String, String> {
    let mut lines = out.lines().map(str::trim).filter(|l| !l.is_empty());
    let id = lines
        .next()
        .filter(|id| id.len() == 40 && id.chars().all(|c| c.is_ascii_hexdigit()))
        .ok_or_else(|| format!("no node id in output: {}", out.trim()))?;
    let ip: IpAddr = lines
        .next()
        .and_then(|l| l.split_whitespace().next())
        .and_then(|l| l.parse().ok())
        .ok_or_else(|| format!("no address in output: {}", out.trim()))?;
    Ok(format!("{}@{}:{}", id.to_lowercase(), ip, P2P_PORT))
}

/// Every peer but the node's own, comma separated.
fn persistent_peers(peers: &[String], own: usize) -> String {
    peers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != own)
        .map(|(_, p)| p.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// Create the validator on the first node and return its address and the
/// finished genesis file.
async fn setup_first_node(env: &BuildEnv, conf: &CosmosConf) -> Result<(String, String), PluginError> {
    env.state.set_build_stage("Setting up the first node");
    let first = env
        .fleet
        .nodes()
        .first()
        .ok_or_else(|| PluginError::fatal("cosmos needs at least one node"))?;
    let run = |cmd: String| async move { env.executor.exec_one(&env.fleet, first, &cmd).await };

    run(conf.init_cmd()).await?;
    env.state.increment_build_progress();

    run(format!(
        "printf '{pw}\\n{pw}\\n' | gaiacli keys add {} -ojson",
        KEY_NAME,
        pw = PASSWORD
    ))
    .await?;
    let address = parse_validator_address(&run(format!("gaiacli keys show {} -a", KEY_NAME)).await?)?;
    env.state.increment_build_progress();

    run(format!(
        "gaiad add-genesis-account {} {}",
        address,
        conf.genesis_coins.join(",")
    ))
    .await?;
    run(format!(
        "printf '{}\\n' | gaiad gentx --name {}",
        PASSWORD, KEY_NAME
    ))
    .await?;
    env.state.increment_build_progress();

    run("gaiad collect-gentxs".to_string()).await?;
    let genesis = run(format!("cat {}", GENESIS_PATH)).await?;
    env.state.increment_build_progress();
    Ok((address, genesis))
}

/// Initialise every node of the scope but the first and collect the peers in node order.
async fn discover_peers(env: &BuildEnv, scope: Scope, conf: &CosmosConf) -> Result<Vec<String>, PluginError> {
    env.state.set_build_stage("Initializing the rest of the nodes");
    let state = Arc::clone(&env.state);
    let init = conf.init_cmd();
    let f = move |client: Arc<dyn NodeClient>, node: Node| {
        let state = Arc::clone(&state);
        let init = init.clone();
        async move {
            if node.global_index != 0 {
                client.exec(&node, &init).await?;
            }
            let peer = parse_peer(
                &client
                    .exec(&node, "gaiad tendermint show-node-id && hostname -i")
                    .await?,
            )?;
            state.increment_build_progress();
            Ok(peer)
        }
    };
    Ok(env.executor.collect_scoped(&env.fleet, scope, f).await?)
}

async fn copy_genesis(env: &BuildEnv, scope: Scope, genesis: &str) -> Result<(), PluginError> {
    env.state.set_build_stage("Copying the genesis file to each node");
    env.executor
        .copy_bytes(&env.fleet, scope, genesis.as_bytes().to_vec(), GENESIS_PATH)
        .await?;
    env.state.increment_build_progress();
    Ok(())
}

async fn start_nodes(env: &BuildEnv, scope: Scope, peers: &[String]) -> Result<(), PluginError> {
    env.state.set_build_stage("Starting cosmos");
    let state = Arc::clone(&env.state);
    let peers = peers.to_vec();
    let output_file = env.output_file.clone();
    let f = move |client: Arc<dyn NodeClient>, node: Node| {
        let state = Arc::clone(&state);
        let cmd = format!(
            "gaiad start --p2p.persistent_peers={} 2>&1 | tee {}",
            persistent_peers(&peers, node.global_index),
            output_file
        );
        async move {
            client.exec_detached(&node, &cmd).await?;
            state.increment_build_progress();
            Ok::<(), String>(())
        }
    };
    env.executor.exec_scoped(&env.fleet, scope, f).await?;
    Ok(())
}

fn export(env: &BuildEnv, conf: &CosmosConf, peers: &[String]) -> Result<(), PluginError> {
    env.state.set_ext("chainID", &conf.chain_id)?;
    env.state.set_ext("peers", peers)?;
    env.state.set_ext("port", &RPC_PORT)?;
    Ok(())
}

#[derive(Debug, Default)]
pub struct Cosmos;

#[async_trait]
impl Protocol for Cosmos {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn build(&self, env: &BuildEnv) -> Result<(), PluginError> {
        let conf = CosmosConf::from_params(&env.params)?;
        let nodes = env.fleet.len();
        if nodes == 0 {
            return Err(PluginError::fatal("cosmos needs at least one node"));
        }
        env.state.init(super::step_count(5, 2, nodes)?)?;
        info!(network = %env.state.network(), nodes, "building cosmos network");

        let (address, genesis) = setup_first_node(env, &conf).await?;
        env.state.write(GENESIS_FILE, genesis.clone());
        let peers = discover_peers(env, Scope::All, &conf).await?;
        copy_genesis(env, Scope::All, &genesis).await?;
        start_nodes(env, Scope::All, &peers).await?;

        env.state.set(KEY_CONF, &conf)?;
        env.state.set(KEY_GENESIS, &genesis)?;
        env.state.set(KEY_PEERS, &peers)?;
        env.state.set_ext("validator", &address)?;
        export(env, &conf, &peers)?;
        Ok(())
    }

    async fn add(&self, env: &BuildEnv) -> Result<(), PluginError> {
        let conf: CosmosConf = required(env, KEY_CONF)?;
        let genesis: String = required(env, KEY_GENESIS)?;
        let mut peers: Vec<String> = required(env, KEY_PEERS)?;
        let added = env.fleet.new_nodes().len();
        if added == 0 {
            return Err(PluginError::fatal("no nodes to add"));
        }
        if peers.len() != env.fleet.len() - added {
            return Err(PluginError::fatal(format!(
                "network {} has {} nodes on record, order says {}",
                env.state.network(),
                peers.len(),
                env.fleet.len() - added
            )));
        }
        env.state.init(super::step_count(1, 2, added)?)?;
        info!(network = %env.state.network(), added, "adding cosmos nodes");

        peers.extend(discover_peers(env, Scope::New, &conf).await?);
        copy_genesis(env, Scope::New, &genesis).await?;
        start_nodes(env, Scope::New, &peers).await?;

        env.state.set(KEY_PEERS, &peers)?;
        export(env, &conf, &peers)?;
        Ok(())
    }

    fn defaults(&self) -> serde_json::Value {
        serde_json::to_value(CosmosConf::default()).unwrap_or_default()
    }

    fn params(&self) -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(CosmosConf)).unwrap_or_default()
    }
}
