//! Shell transport: run scripts on a fleet server locally or over SSH, and reach
//! node containers through `docker exec`.

pub mod local;
pub mod ssh;

use crate::core::executor::{ConnectionProvider, NodeClient};
use crate::core::types::{Node, Server};
use async_trait::async_trait;
use base64::Engine;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Output from executing a script on a target.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout on success, otherwise an error naming the exit code and stderr.
    pub fn into_result(self) -> Result<String, String> {
        if self.success() {
            Ok(self.stdout)
        } else {
            Err(format!("exit code {}: {}", self.exit_code, self.stderr.trim()))
        }
    }
}

impl From<std::process::Output> for ExecOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            // A process killed by a signal has no exit code
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

/// Spawn `cmd` with the script on its stdin and wait for it. The child is
/// killed if the returned future is dropped.
async fn run_with_stdin(mut cmd: Command, script: &str, what: &str) -> Result<ExecOutput, String> {
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn {}: {}", what, e))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(script.as_bytes())
            .await
            .map_err(|e| format!("{} stdin: {}", what, e))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| format!("{} wait: {}", what, e))?;
    Ok(output.into())
}

/// Execute a shell script on a server.
/// Dispatches to local or SSH based on address.
pub async fn exec_script(server: &Server, script: &str) -> Result<ExecOutput, String> {
    if is_local_addr(&server.addr) {
        local::exec_local(script).await
    } else {
        ssh::exec_ssh(server, script).await
    }
}

/// Check if an address is this machine.
fn is_local_addr(addr: &str) -> bool {
    addr == "127.0.0.1" || addr == "localhost" || addr == "::1"
}

/// Single-quote a string for bash.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Runs commands inside the node containers of one server.
pub struct ShellClient {
    server: Server,
}

impl ShellClient {
    pub fn new(server: Server) -> Self {
        Self { server }
    }

    async fn run(&self, script: &str) -> Result<String, String> {
        debug!(server = %self.server.id, script, "exec");
        exec_script(&self.server, script).await?.into_result()
    }
}

#[async_trait]
impl NodeClient for ShellClient {
    async fn exec(&self, node: &Node, cmd: &str) -> Result<String, String> {
        self.run(&format!(
            "docker exec {} bash -c {}",
            node.container(),
            shell_quote(cmd)
        ))
        .await
        .map_err(|e| format!("{} on {}: {}", cmd, node, e))
    }

    async fn exec_detached(&self, node: &Node, cmd: &str) -> Result<(), String> {
        self.run(&format!(
            "docker exec -d {} bash -c {}",
            node.container(),
            shell_quote(cmd)
        ))
        .await
        .map(|_| ())
        .map_err(|e| format!("{} on {}: {}", cmd, node, e))
    }

    async fn put_file(&self, node: &Node, data: &[u8], path: &str) -> Result<(), String> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        self.run(&format!(
            "printf '%s' '{}' | base64 -d | docker exec -i {} sh -c {}",
            encoded,
            node.container(),
            shell_quote(&format!("cat > {}", shell_quote(path)))
        ))
        .await
        .map(|_| ())
        .map_err(|e| format!("write {} on {}: {}", path, node, e))
    }
}

/// Connects to servers through the local shell or the `ssh` binary.
#[derive(Debug, Default, Clone)]
pub struct ShellConnector;

#[async_trait]
impl ConnectionProvider for ShellConnector {
    async fn connect(&self, server: &Server) -> Result<Arc<dyn NodeClient>, String> {
        let client: Arc<dyn NodeClient> = Arc::new(ShellClient::new(server.clone()));
        Ok(client)
    }
}
