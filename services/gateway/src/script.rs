//! Concrete child-process `ScriptRunner`. The core only knows the
//! env-in/stdout-out contract; this is the one place that actually spawns
//! a process, per "script execution is a child-process boundary".

use mesh_core::{CoreError, CoreResult, ScriptRunner};
use std::time::Duration;
use tokio::process::Command;

pub struct ProcessScriptRunner {
    timeout: Duration,
}

impl ProcessScriptRunner {
    pub fn new(timeout: Duration) -> Self {
        ProcessScriptRunner { timeout }
    }
}

#[async_trait::async_trait]
impl ScriptRunner for ProcessScriptRunner {
    async fn run(&self, command: &str, args: &[String], env: Vec<(String, String)>) -> CoreResult<String> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        cmd.envs(env);
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| CoreError::Script(format!("script '{command}' timed out after {:?}", self.timeout)))?
            .map_err(|e| CoreError::Script(format!("script '{command}' failed to spawn: {e}")))?;

        if !output.status.success() {
            tracing::warn!(command, status = %output.status, "script exited non-zero");
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}
