//! Gateway lifecycle events.
//!
//! Subsystems emit typed events on a broadcast channel instead of calling
//! back into listener sets. The gateway drains one subscription into the
//! structured log; tests subscribe their own. Emission never blocks and
//! never fails: events published with no live subscriber are dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Why a supervised process stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    /// An operator or the shutdown sequence asked for the stop.
    Manual,
    /// The process ignored the term signal and was killed.
    Forced,
    /// The process exited on its own.
    Crashed,
}

/// One lifecycle event, tagged for the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
#[serde(rename_all_fields = "camelCase")]
pub enum GatewayEvent {
    ServerStarted {
        name: String,
        pid: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        timestamp: u64,
    },
    ServerStopped {
        name: String,
        reason: StopReason,
        timestamp: u64,
    },
    ServerCrashed {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
        restarting: bool,
        timestamp: u64,
    },
    ServerFailed {
        name: String,
        error: String,
        timestamp: u64,
    },
    RestartScheduled {
        name: String,
        attempt: u32,
        delay_ms: u64,
        timestamp: u64,
    },
    AdapterStarted {
        name: String,
        port: u16,
        timestamp: u64,
    },
    AdapterStopped {
        name: String,
        timestamp: u64,
    },
    PortAllocated {
        name: String,
        port: u16,
        timestamp: u64,
    },
    PortReleased {
        name: String,
        port: u16,
        timestamp: u64,
    },
    RelayOpened {
        connection_id: String,
        server: String,
        timestamp: u64,
    },
    RelayClosed {
        connection_id: String,
        server: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
        timestamp: u64,
    },
}

/// Current time as Unix milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Clonable broadcast bus for [`GatewayEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    /// Channel capacity. Slow subscribers lag rather than block emitters.
    const CAPACITY: usize = 256;

    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(Self::CAPACITY);
        Self { tx }
    }

    /// Publish an event. A bus with no subscribers swallows it.
    pub fn emit(&self, event: GatewayEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = GatewayEvent::ServerStarted {
            name: "mem".to_string(),
            pid: 42,
            port: Some(3001),
            timestamp: 1,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"serverStarted\""));
        assert!(json.contains("\"port\":3001"));
    }

    #[test]
    fn stop_reason_is_lowercase() {
        let event = GatewayEvent::ServerStopped {
            name: "mem".to_string(),
            reason: StopReason::Forced,
            timestamp: 1,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"reason\":\"forced\""));
    }

    #[tokio::test]
    async fn bus_delivers_to_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(GatewayEvent::AdapterStopped {
            name: "mem".to_string(),
            timestamp: now_ms(),
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, GatewayEvent::AdapterStopped { .. }));
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.emit(GatewayEvent::AdapterStopped {
            name: "x".to_string(),
            timestamp: 0,
        });
    }
}
