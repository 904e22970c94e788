use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use flywheel_scheduler::{ActionContext, ActionError, JobAction};

fn default_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize)]
struct CommandPayload {
    command: String,
    /// Kill the command after this many seconds and let the retry policy
    /// decide whether to run it again.
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
}

/// Builtin `command` action: runs the payload's `command` through
/// `/bin/sh -c`. A non-zero exit or a timeout is transient (retryable); a
/// malformed payload or an unspawnable shell is fatal.
pub struct CommandAction;

#[async_trait]
impl JobAction for CommandAction {
    fn name(&self) -> &str {
        "command"
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        let payload: CommandPayload = serde_json::from_value(ctx.payload.clone())
            .map_err(|e| ActionError::Fatal(format!("invalid command payload: {e}")))?;

        let mut cmd = tokio::process::Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(&payload.command)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let timeout = Duration::from_secs(payload.timeout_secs.max(1));
        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ActionError::Fatal(format!("failed to spawn shell: {e}"))),
            Err(_) => {
                return Err(ActionError::Transient(format!(
                    "command timed out after {}s",
                    payload.timeout_secs
                )))
            }
        };

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ActionError::Transient(format!(
                "command exited with {}: {}",
                output.status,
                tail(stderr.trim(), 400)
            )))
        }
    }
}

#[derive(Debug, Deserialize)]
struct LogPayload {
    message: String,
}

/// Builtin `log` action: writes the payload's `message` to the daemon log.
/// Handy as a heartbeat and for wiring up new schedules.
pub struct LogAction;

#[async_trait]
impl JobAction for LogAction {
    fn name(&self) -> &str {
        "log"
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        let payload: LogPayload = serde_json::from_value(ctx.payload.clone())
            .map_err(|e| ActionError::Fatal(format!("invalid log payload: {e}")))?;
        info!(job_id = %ctx.job_id, cycle = %ctx.cycle_key, "{}", payload.message);
        Ok(())
    }
}

/// Last `max` bytes of `s`, on a char boundary.
fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
