//! Post-render command execution.
//!
//! Commands run through `sh -c`, which supplies POSIX word splitting plus
//! environment and backtick expansion. Each command gets its own timeout,
//! kill signal, kill timeout, and splay; execution is synchronous within the
//! render pass so a pass never returns with commands still in flight.

use std::collections::HashMap;
use std::time::Duration;

use tokio::process::Command;

use scribe_core::signal::Signal;

use crate::child::splay_sleep;
use crate::error::RunnerError;

/// Input to [`run`].
#[derive(Debug, Clone)]
pub struct CommandInput<'a> {
    pub command: &'a str,
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub kill_signal: Signal,
    pub kill_timeout: Duration,
    pub splay: Duration,
}

/// Run one command to completion. Non-zero exit and timeouts are errors.
pub async fn run(input: &CommandInput<'_>) -> Result<(), RunnerError> {
    splay_sleep(input.splay).await;
    tracing::info!(command = %input.command, "executing command");

    let mut proc = Command::new("sh")
        .arg("-c")
        .arg(input.command)
        .envs(&input.env)
        .spawn()
        .map_err(|e| RunnerError::CommandSpawn {
            command: input.command.to_string(),
            source: e,
        })?;

    let status = match input.timeout {
        None => proc.wait().await.map_err(|e| RunnerError::CommandSpawn {
            command: input.command.to_string(),
            source: e,
        })?,
        Some(timeout) => match tokio::time::timeout(timeout, proc.wait()).await {
            Ok(waited) => waited.map_err(|e| RunnerError::CommandSpawn {
                command: input.command.to_string(),
                source: e,
            })?,
            Err(_) => {
                tracing::warn!(command = %input.command, "command deadline exceeded");
                terminate(&mut proc, input).await;
                return Err(RunnerError::CommandTimeout {
                    command: input.command.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        },
    };

    if status.success() {
        Ok(())
    } else {
        Err(RunnerError::CommandExit {
            command: input.command.to_string(),
            code: status.code().unwrap_or(-1),
        })
    }
}

/// Kill-signal the overrunning command, then hard-kill after the kill
/// timeout. Best effort; the process may exit on its own in between.
async fn terminate(proc: &mut tokio::process::Child, input: &CommandInput<'_>) {
    if let Some(pid) = proc.id() {
        let rc = unsafe { libc::kill(pid as i32, input.kill_signal.as_raw()) };
        if rc != 0 {
            tracing::debug!(pid, "kill signal delivery failed");
        }
    }
    if tokio::time::timeout(input.kill_timeout, proc.wait())
        .await
        .is_err()
    {
        let _ = proc.kill().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(command: &'a str, env: &HashMap<String, String>) -> CommandInput<'a> {
        CommandInput {
            command,
            env: env.clone(),
            timeout: Some(Duration::from_secs(5)),
            kill_signal: Signal::Term,
            kill_timeout: Duration::from_secs(1),
            splay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn successful_command_returns_ok() {
        run(&input("true", &HashMap::new())).await.unwrap();
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let err = run(&input("exit 7", &HashMap::new())).await.unwrap_err();
        match err {
            RunnerError::CommandExit { code, .. } => assert_eq!(code, 7),
            other => panic!("expected CommandExit, got {other}"),
        }
    }

    #[tokio::test]
    async fn shell_expansion_applies() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("expanded");
        let env: HashMap<String, String> = [("WHO".to_string(), "scribe".to_string())].into();
        run(&input(
            &format!("echo `echo $WHO` > {}", out.display()),
            &env,
        ))
        .await
        .unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "scribe");
    }

    #[tokio::test]
    async fn timeout_kills_the_command() {
        let started = std::time::Instant::now();
        let err = run(&CommandInput {
            command: "sleep 30",
            env: HashMap::new(),
            timeout: Some(Duration::from_millis(100)),
            kill_signal: Signal::Term,
            kill_timeout: Duration::from_secs(1),
            splay: Duration::ZERO,
        })
        .await
        .unwrap_err();

        assert!(matches!(err, RunnerError::CommandTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5), "kill path must not hang");
    }
}
