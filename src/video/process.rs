//! Child process supervision
//!
//! Each spawned process is owned by a watcher task that waits for it and
//! reports the exit. The handle kept by the manager can only signal it.

use super::types::{ProcessRole, VideoError, VideoResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;

/// How a process is asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Default termination (SIGTERM)
    Terminate,
    /// Interrupt (SIGINT), lets FFmpeg write the MP4 trailer
    Interrupt,
}

/// Outcome of a process, delivered once by the watcher task
#[derive(Debug, Clone, Copy)]
pub struct ExitReport {
    pub role: ProcessRole,
    pub pid: Option<u32>,
    /// Exit code, `None` when killed by a signal or when waiting failed
    pub code: Option<i32>,
    pub success: bool,
}

/// A spawned process with the pipes the caller asked for
pub struct SpawnedProcess {
    pub handle: ProcessHandle,
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
}

/// Signalling side of a supervised process
pub struct ProcessHandle {
    role: ProcessRole,
    pid: Option<u32>,
    exited: Arc<AtomicBool>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    /// Spawn `command` and hand the child to a watcher task
    ///
    /// `on_exit` runs on the watcher task after the exit flag is set.
    pub fn spawn<F>(role: ProcessRole, command: &mut Command, on_exit: F) -> VideoResult<SpawnedProcess>
    where
        F: FnOnce(ExitReport) + Send + 'static,
    {
        let mut child = command
            .spawn()
            .map_err(|source| VideoError::ProcessSpawn {
                process: role,
                source,
            })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let exited = Arc::new(AtomicBool::new(false));
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        tracing::info!("Spawned {} process (pid {:?})", role, pid);

        let exited_flag = exited.clone();
        tokio::spawn(async move {
            // A dropped kill sender disables the second branch
            let finished = tokio::select! {
                status = child.wait() => Some(status),
                Ok(()) = &mut kill_rx => None,
            };

            let status = match finished {
                Some(status) => status,
                None => {
                    tracing::warn!("Force-killing {} process (pid {:?})", role, pid);
                    if let Err(e) = child.start_kill() {
                        tracing::warn!("Failed to kill {} process: {}", role, e);
                    }
                    child.wait().await
                }
            };

            let report = match status {
                Ok(status) => ExitReport {
                    role,
                    pid,
                    code: status.code(),
                    success: status.success(),
                },
                Err(e) => {
                    tracing::error!("Failed to wait for {} process: {}", role, e);
                    ExitReport {
                        role,
                        pid,
                        code: None,
                        success: false,
                    }
                }
            };

            tracing::info!(
                "{} process (pid {:?}) exited with code {:?}",
                role,
                pid,
                report.code
            );

            exited_flag.store(true, Ordering::SeqCst);
            on_exit(report);
        });

        Ok(SpawnedProcess {
            handle: ProcessHandle {
                role,
                pid,
                exited,
                kill_tx: Some(kill_tx),
            },
            stdin,
            stdout,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Ask the process to stop without waiting for it
    ///
    /// With a grace period, a process still alive when it elapses is
    /// force-killed. Without one the signal is the only action taken.
    pub fn terminate(mut self, signal: StopSignal, grace: Option<Duration>) {
        if self.has_exited() {
            return;
        }

        if !self.send_signal(signal) {
            self.kill();
            return;
        }

        let Some(grace) = grace else {
            return;
        };
        let Some(kill_tx) = self.kill_tx.take() else {
            return;
        };

        let exited = self.exited.clone();
        let role = self.role;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if !exited.load(Ordering::SeqCst) {
                tracing::warn!(
                    "{} process ignored {:?} for {:?}, escalating",
                    role,
                    signal,
                    grace
                );
                let _ = kill_tx.send(());
            }
        });
    }

    /// Force-kill immediately
    pub fn kill(mut self) {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
    }

    #[cfg(unix)]
    fn send_signal(&self, signal: StopSignal) -> bool {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return false;
        };
        let sig = match signal {
            StopSignal::Terminate => Signal::SIGTERM,
            StopSignal::Interrupt => Signal::SIGINT,
        };

        match kill(Pid::from_raw(pid as i32), sig) {
            Ok(()) => {
                tracing::debug!("Sent {:?} to {} process (pid {})", sig, self.role, pid);
                true
            }
            Err(e) => {
                tracing::warn!("Failed to signal {} process (pid {}): {}", self.role, pid, e);
                false
            }
        }
    }

    #[cfg(not(unix))]
    fn send_signal(&self, _signal: StopSignal) -> bool {
        // No graceful signal available; caller falls back to kill
        false
    }
}
