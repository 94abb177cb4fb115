//! Shared types for process supervision.

use serde::Serialize;

use mcpgw_core::BackendDescriptor;

/// Lifecycle state of one supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// How a child left the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// Serializable snapshot of one process record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub name: String,
    pub state: ProcessState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<u64>,
    pub restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Mutable record for one supervised backend.
///
/// Created lazily on the first start, survives auto-restarts, destroyed
/// only at teardown. `pid` is set iff the state is starting, running or
/// stopping.
#[derive(Debug, Clone)]
pub(crate) struct ProcessRecord {
    pub descriptor: BackendDescriptor,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub started_at: Option<u64>,
    pub stopped_at: Option<u64>,
    pub restart_count: u32,
    pub last_error: Option<String>,
    /// Guards against double-arming the restart timer.
    pub restart_pending: bool,
}

impl ProcessRecord {
    pub fn new(descriptor: BackendDescriptor) -> Self {
        Self {
            descriptor,
            state: ProcessState::Idle,
            pid: None,
            port: None,
            started_at: None,
            stopped_at: None,
            restart_count: 0,
            last_error: None,
            restart_pending: false,
        }
    }

    pub fn snapshot(&self) -> ProcessInfo {
        ProcessInfo {
            name: self.descriptor.name.clone(),
            state: self.state,
            pid: self.pid,
            port: self.port,
            started_at: self.started_at,
            stopped_at: self.stopped_at,
            restart_count: self.restart_count,
            last_error: self.last_error.clone(),
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(
            self.state,
            ProcessState::Starting | ProcessState::Running | ProcessState::Stopping
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpgw_core::descriptor::BackendDescriptor;

    #[test]
    fn fresh_record_is_idle() {
        let descriptor = BackendDescriptor::stdio("mem", "node", vec![]).unwrap();
        let record = ProcessRecord::new(descriptor);
        assert_eq!(record.state, ProcessState::Idle);
        assert!(record.pid.is_none());
        assert!(!record.is_live());
    }

    #[test]
    fn snapshot_serializes_state_lowercase() {
        let descriptor = BackendDescriptor::stdio("mem", "node", vec![]).unwrap();
        let record = ProcessRecord::new(descriptor);
        let json = serde_json::to_string(&record.snapshot()).unwrap();
        assert!(json.contains("\"state\":\"idle\""));
        assert!(json.contains("\"restartCount\":0"));
    }
}
