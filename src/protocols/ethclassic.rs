//! Ethereum Classic: geth nodes on an external chain file, reachable as
//! `ethclassic` or `etc`.
//!
//! The chain file carries the genesis block, so nodes are not initialised
//! separately; the first console session creates the chain directory under
//! the identity, and the imported keys are moved into it before mining starts.

use super::multigeth::{parse_address, passwords, Consensus};
use super::{required, to_json};
use crate::core::executor::{NodeClient, Scope};
use crate::core::registry::{BuildEnv, PluginError, Protocol};
use crate::core::types::Node;
use async_trait::async_trait;
use indexmap::IndexMap;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info};

pub const NAME: &str = "ethclassic";
pub const ALIAS: &str = "etc";

const DATA_DIR: &str = "/geth";
const PASSWORD: &str = "password";
const RPC_PORT: u16 = 8545;
const CHAIN_FILE: &str = "chain.json";
const STATIC_NODES_FILE: &str = "static-nodes.json";

const KEY_CONF: &str = "ethclassicConf";
const KEY_WALLETS: &str = "wallets";
const KEY_CHAIN: &str = "chain";
const KEY_STATIC_NODES: &str = "staticNodes";

static ENODE_RE: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(r"enode://([0-9a-fA-F]+)@(?:\[::\]|[0-9]{1,3}(?:\.[0-9]{1,3}){3}):([0-9]+)")
});

/// Chain parameters. Anything omitted from the order takes its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct EthClassicConf {
    pub network_id: u64,
    /// Funded addresses beyond the node wallets, to grow the initial state
    pub extra_accounts: u64,
    /// Starting balance of every funded address, in wei
    pub init_balance: String,
    pub consensus: Consensus,
    /// Seconds between clique blocks
    pub block_period_seconds: u64,
    pub epoch: u64,
    pub difficulty: u64,
    pub gas_limit: u64,
    /// Directory name of the chain under the data dir
    pub identity: String,
    pub name: String,
    pub homestead_block: u64,
    pub max_peers: u32,
}

impl Default for EthClassicConf {
    fn default() -> Self {
        Self {
            network_id: 15468,
            extra_accounts: 0,
            init_balance: "100000000000000000000000000000".to_string(),
            consensus: Consensus::Ethash,
            block_period_seconds: 5,
            epoch: 30_000,
            difficulty: 100_000,
            gas_limit: 4_000_000,
            identity: "whiteblock".to_string(),
            name: "whiteblock".to_string(),
            homestead_block: 0,
            max_peers: 1000,
        }
    }
}

impl EthClassicConf {
    pub fn from_params(params: &serde_json::Value) -> Result<Self, PluginError> {
        if params.is_null() {
            return Ok(Self::default());
        }
        let conf: Self = serde_json::from_value(params.clone())
            .map_err(|e| PluginError::fatal(format!("invalid ethclassic params: {}", e)))?;
        let identity_ok = !conf.identity.is_empty()
            && conf
                .identity
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !identity_ok {
            return Err(PluginError::fatal(format!(
                "invalid ethclassic params: identity {:?} must be letters, digits, '_' or '-'",
                conf.identity
            )));
        }
        Ok(conf)
    }

    fn chain_dir(&self) -> String {
        format!("{}/{}", DATA_DIR, self.identity)
    }
}

/// Addresses with no key behind them, funded only to enlarge the genesis state.
pub fn make_fake_accounts(count: u64) -> Vec<String> {
    (1..=count).map(|i| format!("{:040x}", i)).collect()
}

/// Render the chain file. Node wallets and fake accounts are funded; the
/// first wallet signs clique blocks.
pub fn chain_json(conf: &EthClassicConf, wallets: &[String]) -> Result<String, PluginError> {
    let mut alloc: IndexMap<String, serde_json::Value> = IndexMap::new();
    let funded = wallets
        .iter()
        .map(|w| w.trim_start_matches("0x").to_string())
        .chain(make_fake_accounts(conf.extra_accounts));
    for address in funded {
        alloc.insert(address, serde_json::json!({ "balance": conf.init_balance }));
    }

    let (consensus_params, extra_data) = match conf.consensus {
        Consensus::Ethash => (serde_json::json!({ "difficulty": conf.difficulty }), "0x".to_string()),
        Consensus::Clique => {
            let signer = wallets
                .first()
                .ok_or_else(|| PluginError::fatal("clique needs at least one signer"))?;
            (
                serde_json::json!({ "period": conf.block_period_seconds, "epoch": conf.epoch }),
                format!(
                    "0x{}{}{}",
                    "0".repeat(64),
                    signer.trim_start_matches("0x"),
                    "0".repeat(130)
                ),
            )
        }
    };

    let doc = serde_json::json!({
        "identity": conf.identity,
        "name": conf.name,
        "network": conf.network_id,
        "chainId": conf.network_id,
        "consensus": conf.consensus,
        "consensusParams": consensus_params,
        "forks": { "homestead": conf.homestead_block },
        "genesis": {
            "nonce": "0x0000000000000042",
            "difficulty": format!("0x0{:X}", conf.difficulty),
            "gasLimit": format!("0x{:X}", conf.gas_limit),
            "extraData": extra_data,
            "alloc": alloc,
        },
    });
    serde_json::to_string_pretty(&doc)
        .map_err(|e| PluginError::fatal(format!("cannot render chain file: {}", e)))
}

/// Pull the enode out of console output and point it at the node's address,
/// which is the last line of the output.
pub fn parse_console_enode(out: &str) -> Result<String, String> {
    let re = ENODE_RE.as_ref().map_err(|e| e.to_string())?;
    let caps = re
        .captures(out)
        .ok_or_else(|| format!("no enode in console output: {}", out.trim()))?;
    let (pubkey, port) = match (caps.get(1), caps.get(2)) {
        (Some(k), Some(p)) => (k.as_str().to_lowercase(), p.as_str()),
        _ => return Err(format!("no enode in console output: {}", out.trim())),
    };
    let ip: IpAddr = out
        .lines()
        .map(str::trim)
        .rfind(|l| !l.is_empty())
        .and_then(|l| l.split_whitespace().next())
        .and_then(|l| l.parse().ok())
        .ok_or_else(|| format!("no address in output: {}", out.trim()))?;
    Ok(format!("enode://{}@{}:{}", pubkey, ip, port))
}

async fn distribute_secrets(env: &BuildEnv, scope: Scope, count: usize) -> Result<(), PluginError> {
    env.state.set_build_stage("Distributing secrets");
    env.executor.mkdir(&env.fleet, scope, DATA_DIR).await?;
    env.executor
        .copy_bytes(&env.fleet, scope, passwords(count), &format!("{}/passwd", DATA_DIR))
        .await?;
    env.state.increment_build_progress();
    Ok(())
}

async fn create_wallets(env: &BuildEnv, scope: Scope) -> Result<Vec<String>, PluginError> {
    env.state.set_build_stage("Creating the wallets");
    let state = Arc::clone(&env.state);
    let cmd = format!(
        "geth --datadir {dir}/ --password {dir}/passwd account new",
        dir = DATA_DIR
    );
    let f = move |client: Arc<dyn NodeClient>, node: Node| {
        let state = Arc::clone(&state);
        let cmd = cmd.clone();
        async move {
            let out = client.exec(&node, &cmd).await?;
            state.increment_build_progress();
            parse_address(&out)
        }
    };
    Ok(env.executor.collect_scoped(&env.fleet, scope, f).await?)
}

/// Copy the chain file to the scope, open a console on each node to create
/// its chain directory and read back its enode.
async fn init_geth(
    env: &BuildEnv,
    scope: Scope,
    conf: &EthClassicConf,
    chain: &str,
) -> Result<Vec<String>, PluginError> {
    env.state.set_build_stage("Creating the genesis block");
    env.executor
        .copy_bytes(
            &env.fleet,
            scope,
            chain.as_bytes().to_vec(),
            &format!("{}/{}", DATA_DIR, CHAIN_FILE),
        )
        .await?;
    env.state.increment_build_progress();

    env.state.set_build_stage("Initializing geth");
    let state = Arc::clone(&env.state);
    let cmd = format!(
        "printf 'admin.nodeInfo.enode\\nexit\\n' | geth --datadir={dir}/ --network-id={} \
         --chain={dir}/{} console 2>&1 && hostname -i",
        conf.network_id,
        CHAIN_FILE,
        dir = DATA_DIR
    );
    let f = move |client: Arc<dyn NodeClient>, node: Node| {
        let state = Arc::clone(&state);
        let cmd = cmd.clone();
        async move {
            let enode = parse_console_enode(&client.exec(&node, &cmd).await?)?;
            debug!(node = %node, enode = %enode, "parsed the enode");
            state.increment_build_progress();
            Ok(enode)
        }
    };
    Ok(env.executor.collect_scoped(&env.fleet, scope, f).await?)
}

/// Write the static node list to every node, old ones included.
async fn peer(env: &BuildEnv, enodes: &[String]) -> Result<(), PluginError> {
    env.state.set_build_stage("Peering");
    let static_nodes = to_json(&enodes)?;
    env.state.write(STATIC_NODES_FILE, static_nodes.clone());
    env.executor
        .copy_bytes(
            &env.fleet,
            Scope::All,
            static_nodes,
            &format!("{}/{}", DATA_DIR, STATIC_NODES_FILE),
        )
        .await?;
    env.state.increment_build_progress();
    Ok(())
}

/// Move the wallet keys into the chain directory and start mining.
async fn start_geth(
    env: &BuildEnv,
    scope: Scope,
    conf: &EthClassicConf,
    wallets: &[String],
) -> Result<(), PluginError> {
    env.state.set_build_stage("Starting geth");
    let state = Arc::clone(&env.state);
    let keystore = format!(
        "mkdir -p {chain}/keystore && cp {dir}/keystore/* {chain}/keystore/",
        chain = conf.chain_dir(),
        dir = DATA_DIR
    );
    let conf = conf.clone();
    let wallets = wallets.to_vec();
    let output_file = env.output_file.clone();
    let f = move |client: Arc<dyn NodeClient>, node: Node| {
        let state = Arc::clone(&state);
        let keystore = keystore.clone();
        let cmd = wallets.get(node.global_index).map(|own| {
            format!(
                "geth --datadir={dir}/ --maxpeers={} --network-id={} --chain={dir}/{} --rpc \
                 --nodiscover --rpcaddr=0.0.0.0 --rpcport={} \
                 --rpcapi=web3,db,eth,net,personal,miner,txpool --rpccorsdomain=0.0.0.0 --mine \
                 --unlock={} --password={dir}/passwd --etherbase={} 2>&1 | tee {}",
                conf.max_peers,
                conf.network_id,
                CHAIN_FILE,
                RPC_PORT,
                wallets.join(","),
                own,
                output_file,
                dir = DATA_DIR
            )
        });
        async move {
            let cmd = cmd.ok_or_else(|| format!("no wallet for {}", node))?;
            client.exec(&node, &keystore).await?;
            state.increment_build_progress();
            client.exec_detached(&node, &cmd).await?;
            state.increment_build_progress();
            Ok::<(), String>(())
        }
    };
    env.executor.exec_scoped(&env.fleet, scope, f).await?;
    Ok(())
}

fn export(env: &BuildEnv, conf: &EthClassicConf, wallets: &[String]) -> Result<(), PluginError> {
    env.state.set_ext("networkID", &conf.network_id)?;
    env.state.set_ext("accounts", wallets)?;
    env.state.set_ext("password", PASSWORD)?;
    env.state.set_ext("port", &RPC_PORT)?;
    Ok(())
}

#[derive(Debug, Default)]
pub struct EthClassic;

#[async_trait]
impl Protocol for EthClassic {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn build(&self, env: &BuildEnv) -> Result<(), PluginError> {
        let conf = EthClassicConf::from_params(&env.params)?;
        let nodes = env.fleet.len();
        if nodes == 0 {
            return Err(PluginError::fatal("ethclassic needs at least one node"));
        }
        env.state.init(super::step_count(4, 4, nodes)?)?;
        info!(network = %env.state.network(), nodes, "building ethclassic network");

        distribute_secrets(env, Scope::All, nodes).await?;
        let wallets = create_wallets(env, Scope::All).await?;

        let chain = chain_json(&conf, &wallets)?;
        env.state.write(CHAIN_FILE, chain.clone());
        let enodes = init_geth(env, Scope::All, &conf, &chain).await?;
        peer(env, &enodes).await?;
        start_geth(env, Scope::All, &conf, &wallets).await?;

        env.state.set(KEY_CONF, &conf)?;
        env.state.set(KEY_WALLETS, &wallets)?;
        env.state.set(KEY_CHAIN, &chain)?;
        env.state.set(KEY_STATIC_NODES, &enodes)?;
        export(env, &conf, &wallets)?;
        env.state.increment_build_progress();
        Ok(())
    }

    async fn add(&self, env: &BuildEnv) -> Result<(), PluginError> {
        let conf: EthClassicConf = required(env, KEY_CONF)?;
        let mut wallets: Vec<String> = required(env, KEY_WALLETS)?;
        let chain: String = required(env, KEY_CHAIN)?;
        let mut enodes: Vec<String> = required(env, KEY_STATIC_NODES)?;
        let added = env.fleet.new_nodes().len();
        if added == 0 {
            return Err(PluginError::fatal("no nodes to add"));
        }
        if wallets.len() != env.fleet.len() - added {
            return Err(PluginError::fatal(format!(
                "network {} has {} nodes on record, order says {}",
                env.state.network(),
                wallets.len(),
                env.fleet.len() - added
            )));
        }
        env.state.init(super::step_count(4, 4, added)?)?;
        info!(network = %env.state.network(), added, "adding ethclassic nodes");

        // New nodes unlock every wallet, so they need a password line for each.
        distribute_secrets(env, Scope::New, env.fleet.len()).await?;
        wallets.extend(create_wallets(env, Scope::New).await?);
        enodes.extend(init_geth(env, Scope::New, &conf, &chain).await?);
        peer(env, &enodes).await?;
        start_geth(env, Scope::New, &conf, &wallets).await?;

        env.state.set(KEY_WALLETS, &wallets)?;
        env.state.set(KEY_STATIC_NODES, &enodes)?;
        export(env, &conf, &wallets)?;
        env.state.increment_build_progress();
        Ok(())
    }

    fn defaults(&self) -> serde_json::Value {
        serde_json::to_value(EthClassicConf::default()).unwrap_or_default()
    }

    fn params(&self) -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(EthClassicConf)).unwrap_or_default()
    }
}
