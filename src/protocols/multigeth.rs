//! Multigeth: a proof-of-work or clique network of geth nodes, one wallet per
//! node, statically peered.
//!
//! Build stages: secrets, wallets, genesis, peer discovery, static nodes, daemons.
//! The config, wallets, genesis and static node list are kept in scratch so a
//! later scale-out joins new nodes to the same chain.

use super::{required, to_json};
use crate::core::executor::{NodeClient, Scope};
use crate::core::registry::{BuildEnv, PluginError, Protocol};
use crate::core::types::Node;
use async_trait::async_trait;
use indexmap::IndexMap;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use tracing::info;

pub const NAME: &str = "multigeth";

const DATA_DIR: &str = "/multi-geth";
const PASSWORD: &str = "password";
const P2P_PORT: u16 = 30303;
const RPC_PORT: u16 = 8545;
const GENESIS_FILE: &str = "CustomGenesis.json";
const STATIC_NODES_FILE: &str = "static-nodes.json";

const KEY_CONF: &str = "multigethConf";
const KEY_WALLETS: &str = "wallets";
const KEY_GENESIS: &str = "genesis";
const KEY_STATIC_NODES: &str = "staticNodes";

static ADDRESS_RE: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(r"(?:Address: \{|Public address of the key:\s+0x)([0-9a-fA-F]{40})")
});

static PUBKEY_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"(?m)^([0-9a-fA-F]{128})\s*$"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Consensus {
    Ethash,
    Clique,
}

/// Chain parameters. Anything omitted from the order takes its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct MultigethConf {
    pub network_id: u64,
    pub consensus: Consensus,
    pub difficulty: u64,
    pub gas_limit: u64,
    /// Starting balance of every wallet, in wei
    pub init_balance: String,
    pub max_peers: u32,
    /// Seconds between clique blocks
    pub block_period_seconds: u64,
    pub epoch: u64,
    /// geth log verbosity, 0 to 5
    pub verbosity: u8,
    /// Unlock each node's wallet with the shared password
    pub unlock: bool,
    /// Selects a built-in chain such as `classic`; empty for a private chain
    pub network: String,
}

impl Default for MultigethConf {
    fn default() -> Self {
        Self {
            network_id: 15468,
            consensus: Consensus::Ethash,
            difficulty: 100_000,
            gas_limit: 4_000_000,
            init_balance: "100000000000000000000000000000".to_string(),
            max_peers: 1000,
            block_period_seconds: 5,
            epoch: 30_000,
            verbosity: 3,
            unlock: true,
            network: String::new(),
        }
    }
}

impl MultigethConf {
    pub fn from_params(params: &serde_json::Value) -> Result<Self, PluginError> {
        if params.is_null() {
            return Ok(Self::default());
        }
        let conf: Self = serde_json::from_value(params.clone())
            .map_err(|e| PluginError::fatal(format!("invalid multigeth params: {}", e)))?;
        // Becomes a bare `--<network>` flag on the geth command line.
        if !conf.network.chars().all(|c| c.is_ascii_lowercase()) {
            return Err(PluginError::fatal(format!(
                "invalid multigeth params: network {:?} must be lowercase letters",
                conf.network
            )));
        }
        Ok(conf)
    }

    fn network_flag(&self) -> String {
        if self.network.is_empty() {
            String::new()
        } else {
            format!("--{} ", self.network)
        }
    }

    /// Flags a node's daemon is started with.
    pub fn daemon_flags(&self, wallet: &str) -> String {
        let mut flags = format!(
            "--maxpeers {} --nodekey {}/nodekey --verbosity {} --networkid {}",
            self.max_peers, DATA_DIR, self.verbosity, self.network_id
        );
        match self.consensus {
            Consensus::Ethash => flags.push_str(&format!(" --mine --miner.etherbase {}", wallet)),
            Consensus::Clique => flags.push_str(" --mine"),
        }
        if self.unlock {
            flags.push_str(&format!(
                " --unlock {} --password {}/passwd --allow-insecure-unlock",
                wallet, DATA_DIR
            ));
        }
        flags
    }
}

/// Render the genesis block. Every wallet is funded; the first signs clique blocks.
pub fn genesis(conf: &MultigethConf, wallets: &[String]) -> Result<String, PluginError> {
    let alloc: IndexMap<&str, serde_json::Value> = wallets
        .iter()
        .map(|w| (w.as_str(), serde_json::json!({ "balance": conf.init_balance })))
        .collect();

    let mut chain = serde_json::json!({
        "chainId": conf.network_id,
        "homesteadBlock": 0,
        "eip150Block": 0,
        "eip155Block": 0,
        "eip158Block": 0,
        "byzantiumBlock": 0,
        "constantinopleBlock": 0,
    });
    let extra_data = match conf.consensus {
        Consensus::Ethash => {
            chain["ethash"] = serde_json::json!({});
            "0x".to_string()
        }
        Consensus::Clique => {
            chain["clique"] =
                serde_json::json!({ "period": conf.block_period_seconds, "epoch": conf.epoch });
            let signer = wallets
                .first()
                .ok_or_else(|| PluginError::fatal("clique needs at least one signer"))?;
            format!(
                "0x{}{}{}",
                "0".repeat(64),
                signer.trim_start_matches("0x"),
                "0".repeat(130)
            )
        }
    };

    let doc = serde_json::json!({
        "config": chain,
        "difficulty": format!("0x{:x}", conf.difficulty),
        "gasLimit": format!("0x{:x}", conf.gas_limit),
        "extraData": extra_data,
        "alloc": alloc,
    });
    serde_json::to_string_pretty(&doc)
        .map_err(|e| PluginError::fatal(format!("cannot render genesis: {}", e)))
}

/// Pull the wallet address out of `geth account new` output.
pub fn parse_address(out: &str) -> Result<String, String> {
    let re = ADDRESS_RE.as_ref().map_err(|e| e.to_string())?;
    re.captures(out)
        .and_then(|c| c.get(1))
        .map(|m| format!("0x{}", m.as_str().to_lowercase()))
        .ok_or_else(|| format!("no address in account output: {}", out.trim()))
}

/// Pull the enode of a node out of `bootnode -writeaddress` and `hostname -i` output.
pub fn parse_enode(out: &str) -> Result<String, String> {
    let re = PUBKEY_RE.as_ref().map_err(|e| e.to_string())?;
    let pubkey = re
        .captures(out)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase())
        .ok_or_else(|| format!("no node key in output: {}", out.trim()))?;
    let ip = out
        .lines()
        .map(str::trim)
        .rfind(|l| !l.is_empty() && *l != pubkey)
        .and_then(|l| l.split_whitespace().next())
        .ok_or_else(|| format!("no address in output: {}", out.trim()))?;
    Ok(format!("enode://{}@{}:{}", pubkey, ip, P2P_PORT))
}

/// One password line per node, for `--password` files.
pub(crate) fn passwords(count: usize) -> Vec<u8> {
    format!("{}\n", PASSWORD).repeat(count).into_bytes()
}

/// Create one wallet on each node in scope.
async fn create_wallets(
    env: &BuildEnv,
    scope: Scope,
    conf: &MultigethConf,
) -> Result<Vec<String>, PluginError> {
    env.state.set_build_stage("Creating the wallets");
    let state = Arc::clone(&env.state);
    let cmd = format!(
        "geth {}--datadir {}/ --password {}/passwd account new",
        conf.network_flag(),
        DATA_DIR,
        DATA_DIR
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

/// Write the genesis file to each node in scope and initialise its chain.
async fn init_chain(
    env: &BuildEnv,
    scope: Scope,
    conf: &MultigethConf,
    genesis: &str,
) -> Result<(), PluginError> {
    env.state.set_build_stage("Creating the genesis block");
    let path = format!("{}/{}", DATA_DIR, GENESIS_FILE);
    env.executor
        .copy_bytes(&env.fleet, scope, genesis.as_bytes().to_vec(), &path)
        .await?;
    env.state.increment_build_progress();

    let state = Arc::clone(&env.state);
    let cmd = format!(
        "geth {}--datadir {}/ --networkid {} init {}",
        conf.network_flag(),
        DATA_DIR,
        conf.network_id,
        path
    );
    let f = move |client: Arc<dyn NodeClient>, node: Node| {
        let state = Arc::clone(&state);
        let cmd = cmd.clone();
        async move {
            client.exec(&node, &cmd).await?;
            state.increment_build_progress();
            Ok::<(), String>(())
        }
    };
    env.executor.exec_scoped(&env.fleet, scope, f).await?;
    Ok(())
}

/// Generate a node key on each node in scope and return the enodes in node order.
async fn discover_enodes(env: &BuildEnv, scope: Scope) -> Result<Vec<String>, PluginError> {
    env.state.set_build_stage("Discovering peers");
    let cmd = format!(
        "bootnode -genkey {dir}/nodekey && bootnode -nodekey {dir}/nodekey -writeaddress && hostname -i",
        dir = DATA_DIR
    );
    let f = move |client: Arc<dyn NodeClient>, node: Node| {
        let cmd = cmd.clone();
        async move { parse_enode(&client.exec(&node, &cmd).await?) }
    };
    let enodes = env.executor.collect_scoped(&env.fleet, scope, f).await?;
    env.state.increment_build_progress();
    Ok(enodes)
}

/// Start the daemon on each node in scope, mining to the node's own wallet.
async fn start_daemons(
    env: &BuildEnv,
    scope: Scope,
    conf: &MultigethConf,
    wallets: &[String],
) -> Result<(), PluginError> {
    env.state.set_build_stage("Starting multi-geth");
    let state = Arc::clone(&env.state);
    let conf = conf.clone();
    let wallets = wallets.to_vec();
    let output_file = env.output_file.clone();
    let f = move |client: Arc<dyn NodeClient>, node: Node| {
        let state = Arc::clone(&state);
        let wallet = wallets.get(node.global_index).cloned();
        let cmd = wallet.map(|w| {
            format!(
                "geth {}--datadir {}/ {} --nodiscover --port {} --http --http.addr 0.0.0.0 \
                 --http.port {} --http.corsdomain '*' \
                 --http.api admin,web3,eth,net,personal,miner,txpool 2>&1 | tee {}",
                conf.network_flag(),
                DATA_DIR,
                conf.daemon_flags(&w),
                P2P_PORT,
                RPC_PORT,
                output_file
            )
        });
        async move {
            let cmd = cmd.ok_or_else(|| format!("no wallet for {}", node))?;
            client.exec_detached(&node, &cmd).await?;
            state.increment_build_progress();
            Ok::<(), String>(())
        }
    };
    env.executor.exec_scoped(&env.fleet, scope, f).await?;
    Ok(())
}

fn export(env: &BuildEnv, conf: &MultigethConf, wallets: &[String]) -> Result<(), PluginError> {
    env.state.set_ext("networkID", &conf.network_id)?;
    env.state.set_ext("accounts", wallets)?;
    env.state.set_ext("password", PASSWORD)?;
    env.state.set_ext("port", &RPC_PORT)?;
    env.state.set_ext("namespace", "eth")?;
    Ok(())
}

#[derive(Debug, Default)]
pub struct Multigeth;

#[async_trait]
impl Protocol for Multigeth {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn build(&self, env: &BuildEnv) -> Result<(), PluginError> {
        let conf = MultigethConf::from_params(&env.params)?;
        let nodes = env.fleet.len();
        if nodes == 0 {
            return Err(PluginError::fatal("multigeth needs at least one node"));
        }
        env.state.init(super::step_count(5, 3, nodes)?)?;
        info!(network = %env.state.network(), nodes, "building multigeth network");

        env.state.set_build_stage("Distributing secrets");
        env.executor.mkdir(&env.fleet, Scope::All, DATA_DIR).await?;
        env.executor
            .copy_bytes(&env.fleet, Scope::All, passwords(nodes), &format!("{}/passwd", DATA_DIR))
            .await?;
        env.state.increment_build_progress();

        let wallets = create_wallets(env, Scope::All, &conf).await?;

        let genesis = genesis(&conf, &wallets)?;
        env.state.write(GENESIS_FILE, genesis.clone());
        init_chain(env, Scope::All, &conf, &genesis).await?;

        let enodes = discover_enodes(env, Scope::All).await?;

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

        start_daemons(env, Scope::All, &conf, &wallets).await?;

        env.state.set(KEY_CONF, &conf)?;
        env.state.set(KEY_WALLETS, &wallets)?;
        env.state.set(KEY_GENESIS, &genesis)?;
        env.state.set(KEY_STATIC_NODES, &enodes)?;
        export(env, &conf, &wallets)?;
        env.state.increment_build_progress();
        Ok(())
    }

    async fn add(&self, env: &BuildEnv) -> Result<(), PluginError> {
        let conf: MultigethConf = required(env, KEY_CONF)?;
        let mut wallets: Vec<String> = required(env, KEY_WALLETS)?;
        let genesis: String = required(env, KEY_GENESIS)?;
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
        env.state.init(super::step_count(5, 3, added)?)?;
        info!(network = %env.state.network(), added, "adding multigeth nodes");

        env.state.set_build_stage("Distributing secrets");
        env.executor.mkdir(&env.fleet, Scope::New, DATA_DIR).await?;
        env.executor
            .copy_bytes(&env.fleet, Scope::New, passwords(added), &format!("{}/passwd", DATA_DIR))
            .await?;
        env.state.increment_build_progress();

        wallets.extend(create_wallets(env, Scope::New, &conf).await?);
        init_chain(env, Scope::New, &conf, &genesis).await?;
        enodes.extend(discover_enodes(env, Scope::New).await?);

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

        start_daemons(env, Scope::New, &conf, &wallets).await?;

        env.state.set(KEY_WALLETS, &wallets)?;
        env.state.set(KEY_STATIC_NODES, &enodes)?;
        export(env, &conf, &wallets)?;
        env.state.increment_build_progress();
        Ok(())
    }

    fn defaults(&self) -> serde_json::Value {
        serde_json::to_value(MultigethConf::default()).unwrap_or_default()
    }

    fn params(&self) -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(MultigethConf)).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::executor::{ConnectionProvider, Fleet, FleetExecutor};
    use crate::core::state::{BuildState, BuildStateStore, Phase};
    use crate::core::types::Server;
    use std::sync::Mutex;

    /// Answers geth, bootnode and hostname commands like a real node would.
    #[derive(Default)]
    struct GethNodes {
        calls: Mutex<Vec<(usize, String)>>,
        detached: Mutex<Vec<(usize, String)>>,
        fail_wallet_on: Option<usize>,
    }

    #[async_trait]
    impl NodeClient for GethNodes {
        async fn exec(&self, node: &Node, cmd: &str) -> Result<String, String> {
            let i = node.global_index;
            self.calls.lock().unwrap().push((i, cmd.to_string()));
            if cmd.contains("account new") {
                if self.fail_wallet_on == Some(i) {
                    return Err("keystore locked".to_string());
                }
                return Ok(format!(
                    "Your new key was generated\n\nPublic address of the key:   0x{:040X}\n",
                    i + 1
                ));
            }
            if cmd.contains("bootnode") {
                return Ok(format!("{:0128x}\n10.0.0.{}\n", i + 1, i + 2));
            }
            Ok(String::new())
        }

        async fn exec_detached(&self, node: &Node, cmd: &str) -> Result<(), String> {
            self.detached
                .lock()
                .unwrap()
                .push((node.global_index, cmd.to_string()));
            Ok(())
        }

        async fn put_file(&self, node: &Node, data: &[u8], path: &str) -> Result<(), String> {
            let cmd = format!("put {} {}", path, data.len());
            self.calls.lock().unwrap().push((node.global_index, cmd));
            Ok(())
        }
    }

    struct Provider(Arc<GethNodes>);

    #[async_trait]
    impl ConnectionProvider for Provider {
        async fn connect(&self, _: &Server) -> Result<Arc<dyn NodeClient>, String> {
            let client: Arc<dyn NodeClient> = self.0.clone();
            Ok(client)
        }
    }

    fn env(nodes: &Arc<GethNodes>, fleet: Fleet, state: Arc<BuildState>, params: serde_json::Value) -> BuildEnv {
        BuildEnv {
            state,
            fleet,
            executor: Arc::new(FleetExecutor::new(Arc::new(Provider(Arc::clone(nodes))))),
            params,
            output_file: "/output.log".to_string(),
        }
    }

    fn servers(n: usize) -> Vec<Server> {
        (0..n).map(|i| Server::local(&format!("s{}", i))).collect()
    }

    #[test]
    fn test_multigeth_parse_address() {
        let new_style = "Public address of the key:   0xAbCd000000000000000000000000000000000001\n";
        assert_eq!(
            parse_address(new_style).unwrap(),
            "0xabcd000000000000000000000000000000000001"
        );
        let old_style = "Address: {00000000000000000000000000000000000000ff}";
        assert_eq!(
            parse_address(old_style).unwrap(),
            "0x00000000000000000000000000000000000000ff"
        );
        assert!(parse_address("Fatal: could not decrypt key").is_err());
    }

    #[test]
    fn test_multigeth_parse_enode() {
        let out = format!("{}\n172.17.0.4\n", "a".repeat(128));
        assert_eq!(
            parse_enode(&out).unwrap(),
            format!("enode://{}@172.17.0.4:30303", "a".repeat(128))
        );
        assert!(parse_enode("172.17.0.4\n").is_err());
    }

    #[test]
    fn test_multigeth_genesis_clique_signer() {
        let conf = MultigethConf {
            consensus: Consensus::Clique,
            ..MultigethConf::default()
        };
        let wallets = vec!["0x00000000000000000000000000000000000000aa".to_string()];
        let doc: serde_json::Value = serde_json::from_str(&genesis(&conf, &wallets).unwrap()).unwrap();
        let extra = doc["extraData"].as_str().unwrap();
        assert_eq!(extra.len(), 2 + 64 + 40 + 130);
        assert!(extra.contains("00000000000000000000000000000000000000aa"));
        assert_eq!(doc["config"]["clique"]["period"], 5);
        assert_eq!(doc["config"]["chainId"], 15468);
        assert!(doc["alloc"]["0x00000000000000000000000000000000000000aa"]["balance"].is_string());
        assert!(genesis(&conf, &[]).is_err());
    }

    #[test]
    fn test_multigeth_params_partial_and_invalid() {
        let conf = MultigethConf::from_params(&serde_json::json!({"networkId": 7})).unwrap();
        assert_eq!(conf.network_id, 7);
        assert_eq!(conf.gas_limit, 4_000_000);
        let err = MultigethConf::from_params(&serde_json::json!({"consensus": "raft"})).unwrap_err();
        assert!(matches!(err, PluginError::Fatal(_)));
        let classic = MultigethConf::from_params(&serde_json::json!({"network": "classic"})).unwrap();
        assert_eq!(classic.network_flag(), "--classic ");
        let err = MultigethConf::from_params(&serde_json::json!({"network": "classic; rm -rf /"}))
            .unwrap_err();
        assert!(matches!(err, PluginError::Fatal(ref m) if m.contains("lowercase letters")));
    }

    #[test]
    fn test_multigeth_defaults_and_schema() {
        let defaults = Multigeth.defaults();
        assert_eq!(defaults["networkId"], 15468);
        let schema = Multigeth.params();
        assert!(schema["properties"]["gasLimit"].is_object());
    }

    #[tokio::test]
    async fn test_multigeth_build() {
        let nodes = Arc::new(GethNodes::default());
        let store = BuildStateStore::new(None);
        let state = store.begin("tn", Phase::Build).unwrap();
        let fleet = Fleet::new("tn", servers(2), 3).unwrap();
        let env = env(&nodes, fleet, Arc::clone(&state), serde_json::Value::Null);

        Multigeth.build(&env).await.unwrap();
        assert!(state.is_complete());
        assert_eq!(state.stage(), "Starting multi-geth");

        let wallets: Vec<String> = state.get_as(KEY_WALLETS).unwrap().unwrap();
        assert_eq!(
            wallets,
            vec![
                format!("0x{:040x}", 1),
                format!("0x{:040x}", 2),
                format!("0x{:040x}", 3)
            ]
        );
        let enodes: Vec<String> = state.get_as(KEY_STATIC_NODES).unwrap().unwrap();
        assert_eq!(enodes.len(), 3);
        assert!(enodes[2].ends_with("@10.0.0.4:30303"));

        let detached = nodes.detached.lock().unwrap().clone();
        assert_eq!(detached.len(), 3);
        for (i, cmd) in &detached {
            assert!(cmd.contains(&format!("--miner.etherbase {}", wallets[*i])));
            assert!(cmd.ends_with("| tee /output.log"));
        }

        let report = store.finish(&state).unwrap();
        assert_eq!(report.exported["port"], 8545);
        assert_eq!(report.exported["accounts"].as_array().unwrap().len(), 3);
        assert!(report.artifacts.contains_key(GENESIS_FILE));
        assert!(report.artifacts.contains_key(STATIC_NODES_FILE));
    }

    #[tokio::test]
    async fn test_multigeth_build_failure_stops_before_genesis() {
        let nodes = Arc::new(GethNodes {
            fail_wallet_on: Some(1),
            ..GethNodes::default()
        });
        let state = Arc::new(BuildState::new("tn", Phase::Build));
        let fleet = Fleet::new("tn", servers(1), 3).unwrap();
        let env = env(&nodes, fleet, Arc::clone(&state), serde_json::Value::Null);

        let err = Multigeth.build(&env).await.unwrap_err();
        assert!(matches!(err, PluginError::Retryable(ref m) if m.contains("keystore locked")));
        assert_eq!(state.stage(), "Creating the wallets");
        assert!(state.read(GENESIS_FILE).is_none());
        let calls = nodes.calls.lock().unwrap();
        assert!(!calls.iter().any(|(_, c)| c.contains(" init ")));
        assert!(nodes.detached.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_multigeth_add_joins_existing_chain() {
        let nodes = Arc::new(GethNodes::default());
        let store = BuildStateStore::new(None);

        let state = store.begin("tn", Phase::Build).unwrap();
        let fleet = Fleet::new("tn", servers(1), 2).unwrap();
        Multigeth
            .build(&env(&nodes, fleet, Arc::clone(&state), serde_json::Value::Null))
            .await
            .unwrap();
        store.finish(&state).unwrap();
        nodes.detached.lock().unwrap().clear();

        let state = store.begin("tn", Phase::Add).unwrap();
        let fleet = Fleet::expanded("tn", servers(1), 2, 1).unwrap();
        Multigeth
            .add(&env(&nodes, fleet, Arc::clone(&state), serde_json::Value::Null))
            .await
            .unwrap();
        assert!(state.is_complete());

        let detached = nodes.detached.lock().unwrap().clone();
        assert_eq!(detached.len(), 1);
        assert_eq!(detached[0].0, 2);
        let wallets: Vec<String> = state.get_as(KEY_WALLETS).unwrap().unwrap();
        assert_eq!(wallets.len(), 3);
        let enodes: Vec<String> = state.get_as(KEY_STATIC_NODES).unwrap().unwrap();
        assert_eq!(enodes.len(), 3);

        // The refreshed static node list reaches the old nodes too.
        let calls = nodes.calls.lock().unwrap();
        let static_puts = calls
            .iter()
            .filter(|(_, c)| c.starts_with("put /multi-geth/static-nodes.json"))
            .count();
        assert_eq!(static_puts, 2 + 3);
    }

    #[tokio::test]
    async fn test_multigeth_add_without_build_is_fatal() {
        let nodes = Arc::new(GethNodes::default());
        let state = Arc::new(BuildState::new("fresh", Phase::Add));
        let fleet = Fleet::expanded("fresh", servers(1), 0, 2).unwrap();
        let err = Multigeth
            .add(&env(&nodes, fleet, state, serde_json::Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Fatal(ref m) if m.contains("multigethConf")));
    }
}
