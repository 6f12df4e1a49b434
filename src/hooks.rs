//! Lifecycle hook execution.
//!
//! Hooks are operator-supplied commands run at two points: `ready` hooks
//! after the listening socket is up (and again after every reload), and
//! `start` hooks during reload before the auth verifier is rebuilt (they may
//! rewrite the credentials file). Hooks are best-effort: a failure is logged
//! and the lifecycle continues.

use crate::config::HookSpec;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

/// Outcome of one hook run, as far as the lifecycle controller cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    /// Ran and exited 0.
    Ok,
    /// Failed to spawn, exited non-zero, or timed out.
    Failed,
}

/// Run `hooks` sequentially. Returns true when any hook marked
/// `reload: true` completed successfully — the caller should enqueue a
/// configuration reload.
pub async fn run_hooks(kind: &str, hooks: &[HookSpec]) -> bool {
    let mut wants_reload = false;
    for hook in hooks {
        match run_one(kind, hook).await {
            HookOutcome::Ok if hook.reload => wants_reload = true,
            _ => {}
        }
    }
    wants_reload
}

async fn run_one(kind: &str, hook: &HookSpec) -> HookOutcome {
    let Some((program, args)) = hook.command.split_first() else {
        warn!(kind, "hook with empty command ignored");
        return HookOutcome::Failed;
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            warn!(kind, command = %program, err = %e, "hook spawn failed");
            return HookOutcome::Failed;
        }
    };

    match tokio::time::timeout(hook.timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            if output.status.success() {
                info!(kind, command = %program, "hook completed");
                HookOutcome::Ok
            } else {
                warn!(
                    kind,
                    command = %program,
                    code = output.status.code().unwrap_or(-1),
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "hook exited non-zero"
                );
                HookOutcome::Failed
            }
        }
        Ok(Err(e)) => {
            warn!(kind, command = %program, err = %e, "hook wait failed");
            HookOutcome::Failed
        }
        Err(_) => {
            warn!(kind, command = %program, timeout_secs = hook.timeout.as_secs(), "hook timed out");
            HookOutcome::Failed
        }
    }
}
