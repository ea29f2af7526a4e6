//! Scripts on fleet servers through the system `ssh` binary, in batch mode.

use super::{run_with_stdin, ExecOutput};
use crate::core::types::Server;
use tokio::process::Command;

/// Expand a leading `~/` against `$HOME`.
fn expand_key_path(key: &str) -> String {
    match (key.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home, rest),
        _ => key.to_string(),
    }
}

fn ssh_command(server: &Server) -> Command {
    let mut cmd = Command::new("ssh");
    cmd.args(["-o", "BatchMode=yes"])
        .args(["-o", "ConnectTimeout=5"])
        .args(["-o", "StrictHostKeyChecking=accept-new"]);

    if let Some(ref key) = server.ssh_key {
        cmd.arg("-i").arg(expand_key_path(key));
    }

    // Nothing after `--` is parsed as an ssh option.
    cmd.arg("--")
        .arg(format!("{}@{}", server.user, server.addr))
        .arg("bash");
    cmd
}

/// Execute a shell script on a remote server via SSH.
pub async fn exec_ssh(server: &Server, script: &str) -> Result<ExecOutput, String> {
    server.validate()?;
    let what = format!("ssh to {}", server.addr);
    let out = run_with_stdin(ssh_command(server), script, &what).await?;
    // ssh itself exits 255 when the connection fails
    if out.exit_code == 255 {
        return Err(format!("{} failed: {}", what, out.stderr.trim()));
    }
    Ok(out)
}
