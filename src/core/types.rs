//! Wire and domain types: commands, orders, results, status and completion messages,
//! fleet servers and nodes.
//!
//! Everything that crosses the queue derives Serialize/Deserialize with stable,
//! camelCase field names.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Commands
// ============================================================================

/// The command sent to genesis. `id` is the idempotency key and is stable
/// across redeliveries of the same logical command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: String,

    #[serde(default)]
    pub timestamp: i64,

    /// Number of failed attempts so far
    #[serde(default)]
    pub retry: u8,

    pub target: Target,

    /// Command IDs that must succeed before this one is dispatched
    #[serde(default)]
    pub dependencies: Vec<String>,

    pub order: Order,
}

impl Command {
    /// Reject field values that would escape the state directory or reach a
    /// command line as options.
    pub fn validate(&self) -> Result<(), String> {
        check_network_name(&self.target.testnet)?;
        if let Some(ip) = &self.target.ip {
            check_host(ip).map_err(|e| format!("target ip: {}", e))?;
        }
        Ok(())
    }
}

/// A network name doubles as a directory name under the state dir, so it must
/// be a single plain path component.
pub fn check_network_name(name: &str) -> Result<(), String> {
    if name.is_empty() || name.len() > 128 {
        return Err(format!("network name must be 1 to 128 characters, got {:?}", name));
    }
    if name == "." || name == ".." {
        return Err(format!("network name {:?} is not a directory name", name));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(format!(
            "network name {:?} may only hold letters, digits, '.', '_' and '-'",
            name
        ));
    }
    Ok(())
}

/// An IP address or DNS name. Never starts with '-'.
pub fn check_host(addr: &str) -> Result<(), String> {
    let valid = addr.len() <= 253
        && addr.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && addr
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':'));
    if valid {
        Ok(())
    } else {
        Err(format!("{:?} is not a host name or address", addr))
    }
}

/// A POSIX login name.
pub fn check_user(user: &str) -> Result<(), String> {
    let valid = user.len() <= 32
        && user.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && user
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(format!("{:?} is not a user name", user))
    }
}

/// Which testnet (and optionally which host) a command is aimed at.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Target {
    pub testnet: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

/// The typed instruction inside a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    #[serde(rename = "type")]
    pub order_type: OrderType,

    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Every order genesis knows how to execute. Unknown tags fail to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderType {
    CreateContainer,
    StartContainer,
    RemoveContainer,
    CreateNetwork,
    RemoveNetwork,
    Build,
    AddNodes,
}

impl OrderType {
    pub const ALL: [OrderType; 7] = [
        Self::CreateContainer,
        Self::StartContainer,
        Self::RemoveContainer,
        Self::CreateNetwork,
        Self::RemoveNetwork,
        Self::Build,
        Self::AddNodes,
    ];
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateContainer => write!(f, "createContainer"),
            Self::StartContainer => write!(f, "startContainer"),
            Self::RemoveContainer => write!(f, "removeContainer"),
            Self::CreateNetwork => write!(f, "createNetwork"),
            Self::RemoveNetwork => write!(f, "removeNetwork"),
            Self::Build => write!(f, "build"),
            Self::AddNodes => write!(f, "addNodes"),
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// Outcome of dispatching one command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    /// Done. Carries output data when the command ends an operation.
    Success(Option<serde_json::Value>),
    /// Transient failure, eligible for retry.
    Error(String),
    /// Terminal failure, never retried.
    Fatal(String),
}

impl CommandResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// The failure cause, if any.
    pub fn cause(&self) -> Option<&str> {
        match self {
            Self::Success(_) => None,
            Self::Error(c) | Self::Fatal(c) => Some(c),
        }
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success(_) => write!(f, "SUCCESS"),
            Self::Error(c) => write!(f, "ERROR: {}", c),
            Self::Fatal(c) => write!(f, "FATAL: {}", c),
        }
    }
}

// ============================================================================
// Outbound messages
// ============================================================================

/// Terminal state reported on the status queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Success,
    Failure,
}

/// Status update for the command issuer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub id: String,
    pub network: String,
    pub status: StatusKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub retry: u8,
    pub ts: String,
}

/// A named artifact as carried in a completion message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactBlob {
    /// `blake3:{hex}` of the raw bytes
    pub digest: String,
    /// Base64 (standard alphabet) of the raw bytes
    pub data: String,
}

/// Returned to the issuer once an operation finishes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionReport {
    pub network: String,
    pub phase: String,
    pub exported: IndexMap<String, serde_json::Value>,
    pub artifacts: IndexMap<String, ArtifactBlob>,
}

/// Published on the completion queue after a successful operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub id: String,
    pub target: Target,
    pub output: serde_json::Value,
}

/// Dead-lettered command with the reason it was abandoned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,
    /// Raw body, kept when the command could not be decoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub cause: String,
}

// ============================================================================
// Fleet
// ============================================================================

/// A remote docker host belonging to a testnet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub id: String,

    /// Network address (IP or DNS)
    pub addr: String,

    /// SSH user
    #[serde(default = "default_user")]
    pub user: String,

    /// Path to SSH private key
    #[serde(default)]
    pub ssh_key: Option<String>,
}

fn default_user() -> String {
    "root".to_string()
}

impl Server {
    /// Everything that ends up on the ssh command line must be a plain value.
    pub fn validate(&self) -> Result<(), String> {
        check_host(&self.addr).map_err(|e| format!("server {}: {}", self.id, e))?;
        check_user(&self.user).map_err(|e| format!("server {}: {}", self.id, e))?;
        if let Some(key) = &self.ssh_key {
            if key.is_empty() || key.starts_with('-') {
                return Err(format!("server {}: bad ssh key path {:?}", self.id, key));
            }
        }
        Ok(())
    }

    pub fn local(id: &str) -> Self {
        Self {
            id: id.to_string(),
            addr: "127.0.0.1".to_string(),
            user: default_user(),
            ssh_key: None,
        }
    }
}

/// One node of a fleet. Only lives for the duration of a fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Index into the fleet's server list
    pub server: usize,
    /// Position among the nodes hosted by the same server
    pub local_index: usize,
    /// Position within the whole fleet
    pub global_index: usize,
}

impl Node {
    /// Name of the docker container backing this node.
    pub fn container(&self) -> String {
        format!("whiteblock-node{}", self.local_index)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}@server{}", self.global_index, self.server)
    }
}

// ============================================================================
// Tests
// ============================================================================
