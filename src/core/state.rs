//! Build state: progress, stage, scratch, exported values and artifacts for one
//! network's build or add operation, plus the store that hands scratch from one
//! operation to the next and archives finished states.

use super::eventlog::now_iso8601;
use super::types::{check_network_name, ArtifactBlob, CompletionReport};
use base64::Engine;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tracing::{debug, warn};

/// Which operation a build state belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Build,
    Add,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Build => write!(f, "build"),
            Self::Add => write!(f, "add"),
        }
    }
}

/// Point-in-time progress of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildProgress {
    pub stage: String,
    pub current_step: u64,
    pub total_steps: u64,
}

impl BuildProgress {
    pub fn percent(&self) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        self.current_step as f64 * 100.0 / self.total_steps as f64
    }
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Progress and data of one operation. Shared by every fan-out callback of
/// that operation, so all mutation goes through atomics or mutexes.
pub struct BuildState {
    network: String,
    phase: Phase,
    total_steps: OnceLock<u64>,
    current_step: AtomicU64,
    stage: Mutex<String>,
    scratch: Mutex<HashMap<String, serde_json::Value>>,
    exported: Mutex<IndexMap<String, serde_json::Value>>,
    artifacts: Mutex<IndexMap<String, Vec<u8>>>,
}

impl BuildState {
    pub fn new(network: &str, phase: Phase) -> Self {
        Self::seeded(network, phase, HashMap::new())
    }

    /// A fresh state whose scratch starts out with values from earlier operations.
    pub fn seeded(network: &str, phase: Phase, scratch: HashMap<String, serde_json::Value>) -> Self {
        Self {
            network: network.to_string(),
            phase,
            total_steps: OnceLock::new(),
            current_step: AtomicU64::new(0),
            stage: Mutex::new(String::new()),
            scratch: Mutex::new(scratch),
            exported: Mutex::new(IndexMap::new()),
            artifacts: Mutex::new(IndexMap::new()),
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Fix the number of steps. Can only be done once.
    pub fn init(&self, total_steps: u64) -> Result<(), String> {
        self.total_steps.set(total_steps).map_err(|_| {
            format!(
                "build steps for {} {} already set to {}",
                self.network,
                self.phase,
                self.total_steps()
            )
        })
    }

    pub fn total_steps(&self) -> u64 {
        self.total_steps.get().copied().unwrap_or(0)
    }

    pub fn set_build_stage(&self, stage: &str) {
        debug!(network = %self.network, phase = %self.phase, stage, "build stage");
        *guard(&self.stage) = stage.to_string();
    }

    pub fn stage(&self) -> String {
        guard(&self.stage).clone()
    }

    /// Advance progress by one step. The counter saturates at `total_steps`:
    /// a call at the boundary leaves it unchanged and returns `false`.
    pub fn increment_build_progress(&self) -> bool {
        let total = self.total_steps();
        let advanced = self
            .current_step
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (cur < total).then_some(cur + 1)
            });
        match advanced {
            Ok(_) => true,
            Err(cur) => {
                warn!(
                    network = %self.network,
                    phase = %self.phase,
                    current = cur,
                    total,
                    "build progress already at total, increment ignored"
                );
                false
            }
        }
    }

    pub fn progress(&self) -> BuildProgress {
        BuildProgress {
            stage: self.stage(),
            current_step: self.current_step.load(Ordering::Acquire),
            total_steps: self.total_steps(),
        }
    }

    pub fn is_complete(&self) -> bool {
        let total = self.total_steps();
        total > 0 && self.current_step.load(Ordering::Acquire) >= total
    }

    /// Store a scratch value for later phases on this network.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), String> {
        let v = serde_json::to_value(value)
            .map_err(|e| format!("cannot store scratch '{}': {}", key, e))?;
        guard(&self.scratch).insert(key.to_string(), v);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        guard(&self.scratch).get(key).cloned()
    }

    /// Typed scratch read. `Ok(None)` when the key was never set.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, String> {
        match self.get(key) {
            Some(v) => serde_json::from_value(v)
                .map(Some)
                .map_err(|e| format!("scratch '{}' has unexpected shape: {}", key, e)),
            None => Ok(None),
        }
    }

    /// Export a value to the command issuer. Separate from scratch.
    pub fn set_ext<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), String> {
        let v = serde_json::to_value(value)
            .map_err(|e| format!("cannot export '{}': {}", key, e))?;
        guard(&self.exported).insert(key.to_string(), v);
        Ok(())
    }

    pub fn exported(&self) -> IndexMap<String, serde_json::Value> {
        guard(&self.exported).clone()
    }

    /// Persist a named artifact for this operation.
    pub fn write(&self, name: &str, data: impl Into<Vec<u8>>) {
        guard(&self.artifacts).insert(name.to_string(), data.into());
    }

    pub fn read(&self, name: &str) -> Option<Vec<u8>> {
        guard(&self.artifacts).get(name).cloned()
    }

    fn scratch_snapshot(&self) -> HashMap<String, serde_json::Value> {
        guard(&self.scratch).clone()
    }

    /// The exported values and artifacts, as returned to the issuer.
    pub fn report(&self) -> CompletionReport {
        let artifacts = guard(&self.artifacts)
            .iter()
            .map(|(name, data)| {
                (
                    name.clone(),
                    ArtifactBlob {
                        digest: digest(data),
                        data: base64::engine::general_purpose::STANDARD.encode(data),
                    },
                )
            })
            .collect();
        CompletionReport {
            network: self.network.clone(),
            phase: self.phase.to_string(),
            exported: self.exported(),
            artifacts,
        }
    }
}

/// `blake3:{hex}` digest of a byte blob.
pub fn digest(data: &[u8]) -> String {
    format!("blake3:{}", blake3::hash(data).to_hex())
}

// ============================================================================
// Store
// ============================================================================

/// Archived snapshot of the latest operation on a network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateArchive {
    pub network: String,
    pub phase: Phase,
    pub finished_at: String,
    pub progress: BuildProgress,
    pub scratch: HashMap<String, serde_json::Value>,
    pub exported: IndexMap<String, serde_json::Value>,
    /// Artifact name to digest
    pub artifacts: IndexMap<String, String>,
}

/// Hands out build states, one active operation per network.
pub struct BuildStateStore {
    state_dir: Option<PathBuf>,
    retained: Mutex<HashMap<String, HashMap<String, serde_json::Value>>>,
    active: Mutex<HashMap<String, Arc<BuildState>>>,
}

impl BuildStateStore {
    pub fn new(state_dir: Option<PathBuf>) -> Self {
        Self {
            state_dir,
            retained: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn state_dir(&self) -> Option<&Path> {
        self.state_dir.as_deref()
    }

    /// Start an operation on a network. Scratch left by earlier operations is
    /// carried over, from memory or from the archive after a restart.
    pub fn begin(&self, network: &str, phase: Phase) -> Result<Arc<BuildState>, String> {
        check_network_name(network)?;
        let mut active = guard(&self.active);
        if let Some(running) = active.get(network) {
            return Err(format!(
                "network {} already has a {} in progress",
                network,
                running.phase()
            ));
        }

        let mut seed = guard(&self.retained).get(network).cloned();
        if seed.is_none() {
            if let Some(dir) = &self.state_dir {
                seed = load_archive(dir, network)?.map(|a| a.scratch);
            }
        }

        let state = Arc::new(BuildState::seeded(network, phase, seed.unwrap_or_default()));
        active.insert(network.to_string(), Arc::clone(&state));
        Ok(state)
    }

    /// Progress of the operation currently running on a network.
    pub fn status(&self, network: &str) -> Option<BuildProgress> {
        guard(&self.active).get(network).map(|s| s.progress())
    }

    /// Close a successful operation: retain its scratch for the network,
    /// archive it, and return the report for the issuer.
    pub fn finish(&self, state: &BuildState) -> Result<CompletionReport, String> {
        guard(&self.active).remove(state.network());
        let scratch = state.scratch_snapshot();
        guard(&self.retained).insert(state.network().to_string(), scratch.clone());

        if let Some(dir) = &self.state_dir {
            let archive = StateArchive {
                network: state.network().to_string(),
                phase: state.phase(),
                finished_at: now_iso8601(),
                progress: state.progress(),
                scratch,
                exported: state.exported(),
                artifacts: guard(&state.artifacts)
                    .iter()
                    .map(|(k, v)| (k.clone(), digest(v)))
                    .collect(),
            };
            save_archive(dir, &archive)?;
        }
        Ok(state.report())
    }

    /// Close a failed operation. Nothing it stored is retained.
    pub fn abort(&self, state: &BuildState) {
        guard(&self.active).remove(state.network());
        warn!(
            network = %state.network(),
            phase = %state.phase(),
            stage = %state.stage(),
            "operation aborted"
        );
    }
}

/// Derive the archive path for a network within the state directory.
pub fn archive_path(state_dir: &Path, network: &str) -> PathBuf {
    state_dir.join(network).join("state.yaml")
}

/// Load a network's archive. Returns None if there is none.
pub fn load_archive(state_dir: &Path, network: &str) -> Result<Option<StateArchive>, String> {
    check_network_name(network)?;
    let path = archive_path(state_dir, network);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let archive: StateArchive = serde_yaml_ng::from_str(&content)
        .map_err(|e| format!("invalid state archive {}: {}", path.display(), e))?;
    Ok(Some(archive))
}

/// Save an archive atomically (write to temp, then rename).
pub fn save_archive(state_dir: &Path, archive: &StateArchive) -> Result<(), String> {
    check_network_name(&archive.network)?;
    let path = archive_path(state_dir, &archive.network);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("cannot create dir {}: {}", parent.display(), e))?;
    }

    let yaml = serde_yaml_ng::to_string(archive).map_err(|e| format!("serialize error: {}", e))?;

    let tmp_path = path.with_extension("yaml.tmp");
    std::fs::write(&tmp_path, &yaml)
        .map_err(|e| format!("cannot write {}: {}", tmp_path.display(), e))?;
    std::fs::rename(&tmp_path, &path).map_err(|e| {
        format!(
            "cannot rename {} to {}: {}",
            tmp_path.display(),
            path.display(),
            e
        )
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_state_init_once() {
        let s = BuildState::new("tn", Phase::Build);
        s.init(5).unwrap();
        let err = s.init(7).unwrap_err();
        assert!(err.contains("already set to 5"));
        assert_eq!(s.total_steps(), 5);
    }

    #[test]
    fn test_state_progress_clamps_at_total() {
        let s = BuildState::new("tn", Phase::Build);
        s.init(5).unwrap();
        for _ in 0..5 {
            assert!(s.increment_build_progress());
        }
        assert!(s.is_complete());
        assert!(!s.increment_build_progress());
        assert!(!s.increment_build_progress());
        assert_eq!(s.progress().current_step, 5);
        assert_eq!(s.progress().percent(), 100.0);
    }

    #[test]
    fn test_state_progress_before_init_does_not_advance() {
        let s = BuildState::new("tn", Phase::Build);
        assert!(!s.increment_build_progress());
        assert_eq!(s.progress().current_step, 0);
        assert!(!s.is_complete());
    }

    #[test]
    fn test_state_concurrent_increments_lose_nothing() {
        let s = Arc::new(BuildState::new("tn", Phase::Build));
        s.init(10_000).unwrap();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let s = Arc::clone(&s);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        s.increment_build_progress();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(s.progress().current_step, 8_000);
    }

    #[test]
    fn test_state_stage_last_writer_wins() {
        let s = BuildState::new("tn", Phase::Build);
        s.set_build_stage("Distributing secrets");
        s.set_build_stage("Creating the wallets");
        assert_eq!(s.stage(), "Creating the wallets");
    }

    #[test]
    fn test_state_scratch_and_exported_are_separate() {
        let s = BuildState::new("tn", Phase::Build);
        s.set("wallets", &vec!["0xabc"]).unwrap();
        s.set_ext("port", &8545).unwrap();
        assert!(s.get("port").is_none());
        assert!(!s.exported().contains_key("wallets"));
        let wallets: Vec<String> = s.get_as("wallets").unwrap().unwrap();
        assert_eq!(wallets, vec!["0xabc"]);
        assert_eq!(s.get_as::<u32>("missing").unwrap(), None);
        assert!(s.get_as::<u32>("wallets").is_err());
    }

    #[test]
    fn test_state_artifacts_in_report() {
        let s = BuildState::new("tn", Phase::Build);
        s.write("genesis.json", b"{}".to_vec());
        assert_eq!(s.read("genesis.json").unwrap(), b"{}");
        let report = s.report();
        let blob = &report.artifacts["genesis.json"];
        assert_eq!(blob.data, "e30=");
        assert!(blob.digest.starts_with("blake3:"));
        assert_eq!(report.phase, "build");
    }

    #[test]
    fn test_store_one_operation_per_network() {
        let store = BuildStateStore::new(None);
        let s = store.begin("tn", Phase::Build).unwrap();
        assert!(store.begin("tn", Phase::Add).is_err());
        assert!(store.begin("other", Phase::Build).is_ok());
        store.abort(&s);
        assert!(store.begin("tn", Phase::Add).is_ok());
    }

    #[test]
    fn test_store_scratch_carries_to_add_phase() {
        let store = BuildStateStore::new(None);
        let build = store.begin("tn", Phase::Build).unwrap();
        build.set("accounts", &vec!["a1", "a2"]).unwrap();
        build.set_ext("networkID", &15468).unwrap();
        store.finish(&build).unwrap();

        let add = store.begin("tn", Phase::Add).unwrap();
        let accounts: Vec<String> = add.get_as("accounts").unwrap().unwrap();
        assert_eq!(accounts, vec!["a1", "a2"]);
        assert!(add.exported().is_empty());
    }

    #[test]
    fn test_store_aborted_scratch_not_retained() {
        let store = BuildStateStore::new(None);
        let build = store.begin("tn", Phase::Build).unwrap();
        build.set("half", &true).unwrap();
        store.abort(&build);
        let again = store.begin("tn", Phase::Build).unwrap();
        assert!(again.get("half").is_none());
    }

    #[test]
    fn test_store_status_tracks_active() {
        let store = BuildStateStore::new(None);
        let s = store.begin("tn", Phase::Build).unwrap();
        s.init(4).unwrap();
        s.set_build_stage("Starting");
        s.increment_build_progress();
        let st = store.status("tn").unwrap();
        assert_eq!(st.current_step, 1);
        assert_eq!(st.stage, "Starting");
        store.finish(&s).unwrap();
        assert!(store.status("tn").is_none());
    }

    #[test]
    fn test_store_archive_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = BuildStateStore::new(Some(dir.path().to_path_buf()));
            let s = store.begin("tn", Phase::Build).unwrap();
            s.set("genesis", &"{\"config\":{}}").unwrap();
            s.write("CustomGenesis.json", b"{}".to_vec());
            store.finish(&s).unwrap();
        }
        let archive = load_archive(dir.path(), "tn").unwrap().unwrap();
        assert_eq!(archive.phase, Phase::Build);
        assert!(archive.artifacts["CustomGenesis.json"].starts_with("blake3:"));
        assert!(!dir.path().join("tn").join("state.yaml.tmp").exists());

        let store = BuildStateStore::new(Some(dir.path().to_path_buf()));
        let add = store.begin("tn", Phase::Add).unwrap();
        assert_eq!(
            add.get_as::<String>("genesis").unwrap().unwrap(),
            "{\"config\":{}}"
        );
    }

    #[test]
    fn test_store_network_stays_inside_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let store = BuildStateStore::new(Some(state_dir.clone()));
        for network in ["../escaped", "/tmp/abs", "a/b", ".."] {
            assert!(store.begin(network, Phase::Build).is_err(), "accepted {:?}", network);
            assert!(store.status(network).is_none());
        }
        assert!(!dir.path().join("escaped").exists());

        let archive = StateArchive {
            network: "../escaped".to_string(),
            phase: Phase::Build,
            finished_at: now_iso8601(),
            progress: BuildProgress {
                stage: String::new(),
                current_step: 0,
                total_steps: 0,
            },
            scratch: HashMap::new(),
            exported: IndexMap::new(),
            artifacts: IndexMap::new(),
        };
        assert!(save_archive(&state_dir, &archive).is_err());
        assert!(!dir.path().join("escaped/state.yaml").exists());
    }

    #[test]
    fn test_store_load_missing_archive() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_archive(dir.path(), "ghost").unwrap().is_none());
    }

    proptest! {
        #[test]
        fn prop_state_progress_never_exceeds_total(total in 0u64..40, calls in 0usize..80) {
            let s = BuildState::new("tn", Phase::Build);
            s.init(total).unwrap();
            let advanced = (0..calls).filter(|_| s.increment_build_progress()).count() as u64;
            prop_assert_eq!(advanced, total.min(calls as u64));
            prop_assert_eq!(s.progress().current_step, total.min(calls as u64));
        }
    }
}
