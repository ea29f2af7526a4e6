//! Scripts on this machine, through `bash`.

use super::{run_with_stdin, ExecOutput};
use tokio::process::Command;

pub async fn exec_local(script: &str) -> Result<ExecOutput, String> {
    run_with_stdin(Command::new("bash"), script, "bash").await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_exit_code_and_streams() {
        let out = exec_local("echo up; echo warn >&2; exit 42").await.unwrap();
        assert_eq!(out.exit_code, 42);
        assert_eq!(out.stdout, "up\n");
        assert_eq!(out.stderr, "warn\n");
    }

    #[tokio::test]
    async fn test_local_long_script_on_stdin() {
        let mut script = ":\n".repeat(20_000);
        script.push_str("echo done");
        let out = exec_local(&script).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "done");
    }

    #[tokio::test]
    async fn test_local_killed_has_no_code() {
        let out = exec_local("kill -9 $$").await.unwrap();
        assert_eq!(out.exit_code, -1);
        assert!(out.into_result().unwrap_err().starts_with("exit code -1"));
    }
}
