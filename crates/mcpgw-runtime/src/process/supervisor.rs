//! Child process supervision: spawn, monitor, bounded auto-restart,
//! graceful stop.
//!
//! The supervisor owns two maps guarded by short locks: `name -> record`
//! (observable state) and `name -> handle` (pid, stdio lock, exit signal).
//! A monitor task owns each `Child` and waits for its exit; stop paths
//! signal by pid and watch for the monitor's verdict, so the handle is
//! never shared mutably.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use mcpgw_core::{
    BackendDescriptor, EventBus, GatewayEvent, Protocol, StopReason, SupervisorError,
    SupervisorSettings, now_ms, validate_args, validate_command,
};

use super::types::{ExitOutcome, ProcessInfo, ProcessRecord, ProcessState};
use super::{shutdown, signal_of};
use crate::stdio::ChildIo;

/// Grace period after SIGKILL before a stop gives up waiting for the reap.
const KILL_WAIT: Duration = Duration::from_secs(5);

struct ChildHandle {
    pid: u32,
    io: Option<Arc<tokio::sync::Mutex<ChildIo>>>,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
}

struct SupervisorInner {
    settings: SupervisorSettings,
    records: Mutex<HashMap<String, ProcessRecord>>,
    handles: Mutex<HashMap<String, ChildHandle>>,
    events: EventBus,
}

/// Process supervisor for stdio backends.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

struct SpawnedChild {
    child: tokio::process::Child,
    pid: u32,
    stdin: ChildStdin,
    stdout: ChildStdout,
    stderr: ChildStderr,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings, events: EventBus) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                settings,
                records: Mutex::new(HashMap::new()),
                handles: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Spawn the backend's child process and transition it to running.
    ///
    /// No-op when the backend is already starting or running. Startup
    /// failures propagate; later crashes surface only through events and
    /// queries. When `port` is given, `PORT` and `MCP_PORT` are injected
    /// into the child environment.
    pub async fn start_server(
        &self,
        descriptor: &BackendDescriptor,
        port: Option<u16>,
    ) -> Result<(), SupervisorError> {
        let name = descriptor.name.clone();
        if descriptor.protocol == Protocol::Http {
            return Err(SupervisorError::HttpNotSpawnable(name));
        }
        let Some(command) = descriptor.command.clone() else {
            return Err(SupervisorError::NoCommand(name));
        };
        validate_command(&command)?;
        validate_args(&descriptor.args)?;

        {
            let mut records = self.inner.records.lock().unwrap();
            let record = records
                .entry(name.clone())
                .or_insert_with(|| ProcessRecord::new(descriptor.clone()));
            if matches!(record.state, ProcessState::Starting | ProcessState::Running) {
                return Ok(());
            }
            record.descriptor = descriptor.clone();
            record.state = ProcessState::Starting;
            record.last_error = None;
            record.started_at = Some(now_ms());
            record.stopped_at = None;
            record.port = port;
            record.restart_pending = false;
        }

        let startup_timeout = self.inner.settings.startup_timeout();
        let spawned =
            match tokio::time::timeout(startup_timeout, spawn_child(descriptor, &command, port))
                .await
            {
                Ok(Ok(spawned)) => spawned,
                Ok(Err(e)) => {
                    self.fail_start(&name, &e);
                    return Err(e);
                }
                Err(_) => {
                    let e = SupervisorError::StartupTimeout(name.clone());
                    self.fail_start(&name, &e);
                    return Err(e);
                }
            };

        let SpawnedChild {
            mut child,
            pid,
            stdin,
            stdout,
            stderr,
        } = spawned;

        drain_stderr(name.clone(), stderr);

        let io = Arc::new(tokio::sync::Mutex::new(ChildIo::new(stdin, stdout)));
        let (exit_tx, exit_rx) = watch::channel(None);

        {
            let mut records = self.inner.records.lock().unwrap();
            if let Some(record) = records.get_mut(&name) {
                record.state = ProcessState::Running;
                record.pid = Some(pid);
            }
        }
        self.inner.handles.lock().unwrap().insert(
            name.clone(),
            ChildHandle {
                pid,
                io: Some(io),
                exit_rx,
            },
        );

        info!(server = %name, pid = %pid, port = ?port, "Backend started");
        self.inner.events.emit(GatewayEvent::ServerStarted {
            name: name.clone(),
            pid,
            port,
            timestamp: now_ms(),
        });

        let supervisor = self.clone();
        tokio::spawn(async move {
            let outcome = match child.wait().await {
                Ok(status) => ExitOutcome {
                    code: status.code(),
                    signal: signal_of(&status),
                },
                Err(e) => {
                    warn!(server = %name, error = %e, "Failed waiting on child");
                    ExitOutcome {
                        code: None,
                        signal: None,
                    }
                }
            };
            let _ = exit_tx.send(Some(outcome));
            supervisor.on_child_exit(&name, outcome);
        });

        Ok(())
    }

    /// Mark a failed start and schedule the auto-restart policy.
    fn fail_start(&self, name: &str, error: &SupervisorError) {
        {
            let mut records = self.inner.records.lock().unwrap();
            if let Some(record) = records.get_mut(name) {
                record.state = ProcessState::Failed;
                record.pid = None;
                record.stopped_at = Some(now_ms());
                record.last_error = Some(error.to_string());
            }
        }
        self.inner.events.emit(GatewayEvent::ServerFailed {
            name: name.to_string(),
            error: error.to_string(),
            timestamp: now_ms(),
        });
        self.schedule_restart(name);
    }

    /// Monitor callback: the child exited on its own or under a stop.
    fn on_child_exit(&self, name: &str, outcome: ExitOutcome) {
        let restarting = {
            let mut records = self.inner.records.lock().unwrap();
            let Some(record) = records.get_mut(name) else {
                return;
            };
            match record.state {
                // The stop path owns the transition to stopped.
                ProcessState::Stopping => return,
                ProcessState::Running | ProcessState::Starting => {
                    record.state = ProcessState::Failed;
                    record.pid = None;
                    record.stopped_at = Some(now_ms());
                    record.last_error = Some(format!(
                        "exited unexpectedly (code={:?}, signal={:?})",
                        outcome.code, outcome.signal
                    ));
                    record.descriptor.restart
                        && record.restart_count < self.inner.settings.max_restarts
                        && !record.restart_pending
                }
                _ => {
                    record.pid = None;
                    false
                }
            }
        };

        self.inner.handles.lock().unwrap().remove(name);

        warn!(server = %name, code = ?outcome.code, signal = ?outcome.signal, "Backend crashed");
        self.inner.events.emit(GatewayEvent::ServerCrashed {
            name: name.to_string(),
            code: outcome.code,
            signal: outcome.signal,
            restarting,
            timestamp: now_ms(),
        });

        if restarting {
            self.schedule_restart(name);
        }
    }

    /// Arm the restart timer once. Iff the descriptor opts in and the
    /// budget is not exhausted; never double-armed for one failure.
    fn schedule_restart(&self, name: &str) {
        let (descriptor, port, attempt) = {
            let mut records = self.inner.records.lock().unwrap();
            let Some(record) = records.get_mut(name) else {
                return;
            };
            if record.restart_pending
                || !record.descriptor.restart
                || record.restart_count >= self.inner.settings.max_restarts
            {
                return;
            }
            record.restart_pending = true;
            record.restart_count += 1;
            (record.descriptor.clone(), record.port, record.restart_count)
        };

        let delay = self.inner.settings.restart_delay();
        info!(server = %name, attempt = %attempt, delay_ms = %delay.as_millis(), "Restart scheduled");
        self.inner.events.emit(GatewayEvent::RestartScheduled {
            name: name.to_string(),
            attempt,
            delay_ms: delay.as_millis() as u64,
            timestamp: now_ms(),
        });

        let supervisor = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = supervisor.start_server(&descriptor, port).await {
                warn!(server = %name, error = %e, "Auto-restart failed");
            }
        });
    }

    /// Gracefully stop a backend: SIGTERM, wait, then SIGKILL.
    ///
    /// No-op when the backend is already stopping, stopped, or has no
    /// child.
    pub async fn stop_server(&self, name: &str) -> Result<(), SupervisorError> {
        let (pid, mut exit_rx) = {
            let mut records = self.inner.records.lock().unwrap();
            let Some(record) = records.get_mut(name) else {
                return Ok(());
            };
            if matches!(record.state, ProcessState::Stopping | ProcessState::Stopped) {
                return Ok(());
            }
            let handles = self.inner.handles.lock().unwrap();
            let Some(handle) = handles.get(name) else {
                return Ok(());
            };
            record.state = ProcessState::Stopping;
            (handle.pid, handle.exit_rx.clone())
        };

        debug!(server = %name, pid = %pid, "Stopping backend");
        if let Err(e) = shutdown::send_term(pid) {
            warn!(server = %name, error = %e, "Failed to signal child");
        }

        let mut forced = false;
        if !wait_for_exit(&mut exit_rx, self.inner.settings.shutdown_timeout()).await {
            warn!(server = %name, pid = %pid, "Graceful stop timed out, killing");
            forced = true;
            let _ = shutdown::send_kill(pid);
            wait_for_exit(&mut exit_rx, KILL_WAIT).await;
        }

        self.inner.handles.lock().unwrap().remove(name);
        {
            let mut records = self.inner.records.lock().unwrap();
            if let Some(record) = records.get_mut(name) {
                record.state = ProcessState::Stopped;
                record.pid = None;
                record.stopped_at = Some(now_ms());
            }
        }

        let reason = if forced {
            StopReason::Forced
        } else {
            StopReason::Manual
        };
        info!(server = %name, reason = ?reason, "Backend stopped");
        self.inner.events.emit(GatewayEvent::ServerStopped {
            name: name.to_string(),
            reason,
            timestamp: now_ms(),
        });
        Ok(())
    }

    /// Stop if live, reset the restart budget, start again on the same
    /// port.
    pub async fn restart_server(&self, name: &str) -> Result<(), SupervisorError> {
        let (descriptor, port, live) = {
            let records = self.inner.records.lock().unwrap();
            let Some(record) = records.get(name) else {
                return Err(SupervisorError::UnknownServer(name.to_string()));
            };
            (record.descriptor.clone(), record.port, record.is_live())
        };
        if live {
            self.stop_server(name).await?;
        }
        {
            let mut records = self.inner.records.lock().unwrap();
            if let Some(record) = records.get_mut(name) {
                record.restart_count = 0;
            }
        }
        self.start_server(&descriptor, port).await
    }

    /// Ask every live backend to stop, concurrently.
    pub async fn stop_all_servers(&self) {
        let names: Vec<String> = {
            let records = self.inner.records.lock().unwrap();
            records
                .values()
                .filter(|r| r.is_live())
                .map(|r| r.descriptor.name.clone())
                .collect()
        };
        let mut set = tokio::task::JoinSet::new();
        for name in names {
            let supervisor = self.clone();
            set.spawn(async move {
                let _ = supervisor.stop_server(&name).await;
            });
        }
        while set.join_next().await.is_some() {}
    }

    /// The per-child stdio handle, shared with the adapter.
    ///
    /// The inner mutex serialises round-trips; a restart replaces the
    /// whole handle, so nothing dangles across lifecycle epochs.
    pub fn child_io(&self, name: &str) -> Option<Arc<tokio::sync::Mutex<ChildIo>>> {
        self.inner
            .handles
            .lock()
            .unwrap()
            .get(name)
            .and_then(|h| h.io.clone())
    }

    pub fn has_child(&self, name: &str) -> bool {
        self.inner.handles.lock().unwrap().contains_key(name)
    }

    pub fn process_info(&self, name: &str) -> Option<ProcessInfo> {
        self.inner
            .records
            .lock()
            .unwrap()
            .get(name)
            .map(ProcessRecord::snapshot)
    }

    pub fn process_state(&self, name: &str) -> Option<ProcessState> {
        self.inner.records.lock().unwrap().get(name).map(|r| r.state)
    }

    pub fn all_processes(&self) -> Vec<ProcessInfo> {
        let records = self.inner.records.lock().unwrap();
        let mut all: Vec<_> = records.values().map(ProcessRecord::snapshot).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn running_processes(&self) -> Vec<ProcessInfo> {
        self.all_processes()
            .into_iter()
            .filter(|p| p.state == ProcessState::Running)
            .collect()
    }

    pub fn failed_processes(&self) -> Vec<ProcessInfo> {
        self.all_processes()
            .into_iter()
            .filter(|p| p.state == ProcessState::Failed)
            .collect()
    }
}

/// Spawn with merged environment and piped stdio, then catch children
/// that die before they are observable.
async fn spawn_child(
    descriptor: &BackendDescriptor,
    command: &str,
    port: Option<u16>,
) -> Result<SpawnedChild, SupervisorError> {
    let name = descriptor.name.clone();
    let mut cmd = Command::new(command);
    cmd.args(&descriptor.args);
    for (key, value) in &descriptor.env {
        cmd.env(key, value);
    }
    if let Some(port) = port {
        cmd.env("PORT", port.to_string());
        cmd.env("MCP_PORT", port.to_string());
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| SupervisorError::SpawnFailed {
        name: name.clone(),
        message: e.to_string(),
    })?;

    let pid = child.id().ok_or_else(|| SupervisorError::SpawnFailed {
        name: name.clone(),
        message: "child has no pid".to_string(),
    })?;
    let stdin = take_pipe(child.stdin.take(), &name, "stdin")?;
    let stdout = take_pipe(child.stdout.take(), &name, "stdout")?;
    let stderr = take_pipe(child.stderr.take(), &name, "stderr")?;

    // Let the runtime notice a child that died on arrival.
    tokio::task::yield_now().await;
    if let Ok(Some(status)) = child.try_wait() {
        return Err(SupervisorError::ExitedDuringStartup {
            name,
            code: status.code(),
            signal: signal_of(&status),
        });
    }

    Ok(SpawnedChild {
        child,
        pid,
        stdin,
        stdout,
        stderr,
    })
}

fn take_pipe<T>(pipe: Option<T>, name: &str, which: &str) -> Result<T, SupervisorError> {
    pipe.ok_or_else(|| SupervisorError::SpawnFailed {
        name: name.to_string(),
        message: format!("failed to capture {which}"),
    })
}

/// Forward child stderr lines into the structured log.
fn drain_stderr(name: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "mcpgw.child", server = %name, "{line}");
        }
    });
}

async fn wait_for_exit(
    rx: &mut watch::Receiver<Option<ExitOutcome>>,
    duration: Duration,
) -> bool {
    tokio::time::timeout(duration, async {
        loop {
            if rx.borrow().is_some() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    })
    .await
    .is_ok()
}
