//! Supervised child process.
//!
//! The child is spawned once, inherits the runner's stdio, and is signalled
//! (never respawned) when rendered bytes change. Exit is observed through a
//! watch channel fed by a waiter task that owns the process handle; signal
//! delivery goes straight to the pid.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use tokio::process::Command;
use tokio::sync::watch;

use scribe_core::signal::Signal;

use crate::error::RunnerError;

/// Input to [`Child::spawn`].
#[derive(Debug, Clone)]
pub struct SpawnInput<'a> {
    pub command: &'a str,
    pub env: HashMap<String, String>,
    pub reload_signal: Signal,
    pub kill_signal: Signal,
    pub kill_timeout: Duration,
    pub splay: Duration,
}

/// A supervised subprocess.
#[derive(Debug)]
pub struct Child {
    pid: i32,
    command: String,
    reload_signal: Signal,
    kill_signal: Signal,
    kill_timeout: Duration,
    splay: Duration,
    exit_rx: watch::Receiver<Option<i32>>,
}

impl Child {
    /// Spawn `sh -c <command>` with the composed environment layered over the
    /// agent's own, and start the waiter task.
    pub fn spawn(input: &SpawnInput<'_>) -> Result<Self, RunnerError> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(input.command).envs(&input.env);

        let mut proc = command.spawn().map_err(|e| RunnerError::CommandSpawn {
            command: input.command.to_string(),
            source: e,
        })?;
        let pid = proc.id().map(|pid| pid as i32).unwrap_or(-1);
        tracing::info!(pid, command = %input.command, "child spawned");

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            let code = match proc.wait().await {
                Ok(status) => exit_code(status),
                Err(err) => {
                    tracing::error!(error = %err, "failed waiting on child");
                    -1
                }
            };
            tracing::debug!(pid, code, "child exited");
            let _ = exit_tx.send(Some(code));
        });

        Ok(Self {
            pid,
            command: input.command.to_string(),
            reload_signal: input.reload_signal,
            kill_signal: input.kill_signal,
            kill_timeout: input.kill_timeout,
            splay: input.splay,
            exit_rx,
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Channel that holds the exit code once the child terminates.
    pub fn exit_rx(&self) -> watch::Receiver<Option<i32>> {
        self.exit_rx.clone()
    }

    /// Deliver an arbitrary signal to the child.
    pub fn signal(&self, signal: Signal) -> Result<(), RunnerError> {
        deliver(self.pid, signal)
    }

    /// Ask the child to reload its configuration, after the configured splay.
    pub async fn reload(&self) -> Result<(), RunnerError> {
        splay_sleep(self.splay).await;
        tracing::debug!(pid = self.pid, signal = %self.reload_signal, "reloading child");
        self.signal(self.reload_signal)
    }

    /// Stop the child: kill signal after splay, then a hard kill if it is
    /// still running when the kill timeout elapses. Delivery failures are
    /// ignored; the process may already be gone.
    pub async fn stop(mut self) {
        if self.exit_rx.borrow().is_some() {
            return;
        }

        splay_sleep(self.splay).await;
        tracing::debug!(pid = self.pid, signal = %self.kill_signal, "stopping child");
        let _ = deliver(self.pid, self.kill_signal);

        let timed_out = tokio::time::timeout(self.kill_timeout, async {
            let _ = self.exit_rx.wait_for(|code| code.is_some()).await;
        })
        .await
        .is_err();
        if timed_out {
            tracing::warn!(pid = self.pid, "child did not exit in time, killing");
            let _ = deliver(self.pid, Signal::Kill);
            let _ = self.exit_rx.wait_for(|code| code.is_some()).await;
        }
    }
}

fn deliver(pid: i32, signal: Signal) -> Result<(), RunnerError> {
    // Never signal 0 / -1: those address whole process groups.
    if pid <= 0 {
        return Err(RunnerError::Signal {
            pid,
            signal,
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such pid"),
        });
    }
    let rc = unsafe { libc::kill(pid, signal.as_raw()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(RunnerError::Signal {
            pid,
            signal,
            source: std::io::Error::last_os_error(),
        })
    }
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Sleep a uniformly random duration below `splay` to stagger signal storms
/// across a fleet of agents.
pub(crate) async fn splay_sleep(splay: Duration) {
    if splay.is_zero() {
        return;
    }
    let jitter = rand::thread_rng().gen_range(0..splay.as_millis().max(1) as u64);
    tokio::time::sleep(Duration::from_millis(jitter)).await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn(command: &str) -> Child {
        Child::spawn(&SpawnInput {
            command,
            env: HashMap::new(),
            reload_signal: Signal::Hup,
            kill_signal: Signal::Term,
            kill_timeout: Duration::from_secs(5),
            splay: Duration::ZERO,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn exit_code_is_observed() {
        let child = spawn("exit 3");
        let mut exit_rx = child.exit_rx();
        let code = exit_rx.wait_for(|c| c.is_some()).await.unwrap();
        assert_eq!(*code, Some(3));
    }

    #[tokio::test]
    async fn env_reaches_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let child = Child::spawn(&SpawnInput {
            command: &format!("echo \"$GREETING\" > {}", out.display()),
            env: [("GREETING".to_string(), "hello".to_string())].into(),
            reload_signal: Signal::Hup,
            kill_signal: Signal::Term,
            kill_timeout: Duration::from_secs(5),
            splay: Duration::ZERO,
        })
        .unwrap();

        let mut exit_rx = child.exit_rx();
        exit_rx.wait_for(|c| c.is_some()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "hello");
    }

    #[tokio::test]
    async fn stop_terminates_a_long_running_child() {
        let child = spawn("sleep 30");
        let mut exit_rx = child.exit_rx();
        assert!(exit_rx.borrow().is_none());

        child.stop().await;
        let code = exit_rx.wait_for(|c| c.is_some()).await.unwrap();
        assert_eq!(*code, Some(128 + libc::SIGTERM), "terminated by kill signal");
    }

    #[tokio::test]
    async fn signalling_a_reaped_child_fails() {
        let dead = spawn("exit 0");
        let mut exit_rx = dead.exit_rx();
        exit_rx.wait_for(|c| c.is_some()).await.unwrap();
        assert!(dead.signal(Signal::Hup).is_err(), "signalling a dead pid fails");
    }
}
