//! WebSocket relay: one client connection piped to one backend connection.
//!
//! The relay upgrades `/ws/<name>`, dials `ws://127.0.0.1:<port>/ws` for
//! the backend resolved through the allocator, and pipes frames both ways
//! preserving text/binary framing. A single heartbeat task sweeps all
//! connections: idle ones are closed with 1001, live clients get a ping.
//! Each connection is driven by one task; the heartbeat reaches it
//! through a small control channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message as BackendMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as BackendCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use mcpgw_core::{EventBus, GatewayEvent, RelaySettings, now_ms};
use mcpgw_runtime::PortAllocator;

/// Close codes the relay hands out.
const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_UNSUPPORTED: u16 = 1003;
const CLOSE_POLICY: u16 = 1008;
const CLOSE_INTERNAL: u16 = 1011;

type BackendSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Instructions the heartbeat (and shutdown) sends into a connection task.
enum RelayControl {
    Ping,
    Close { code: u16, reason: String },
}

struct ConnectionHandle {
    server: String,
    created_at: u64,
    last_activity: Arc<AtomicU64>,
    control: mpsc::Sender<RelayControl>,
}

/// Serializable view of one relayed connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub server: String,
    pub created_at: u64,
    pub last_activity: u64,
}

/// Aggregate relay counters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    pub total_ever: u64,
    pub active: usize,
    pub by_server: HashMap<String, usize>,
}

struct RelayInner {
    allocator: Arc<PortAllocator>,
    settings: RelaySettings,
    connections: Mutex<HashMap<String, ConnectionHandle>>,
    counter: AtomicU64,
    total_ever: AtomicU64,
    heartbeat: Mutex<Option<AbortHandle>>,
    events: EventBus,
}

/// The relay itself; cheap to clone, shared with the route handler.
#[derive(Clone)]
pub struct WsRelay {
    inner: Arc<RelayInner>,
}

impl WsRelay {
    pub fn new(allocator: Arc<PortAllocator>, settings: RelaySettings, events: EventBus) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                allocator,
                settings,
                connections: Mutex::new(HashMap::new()),
                counter: AtomicU64::new(0),
                total_ever: AtomicU64::new(0),
                heartbeat: Mutex::new(None),
                events,
            }),
        }
    }

    /// Drive one upgraded client socket to completion.
    ///
    /// `path` is the original request path; anything that is not
    /// `/ws/<name>[/...]` is closed with 1003.
    pub async fn handle_socket(&self, mut client: WebSocket, path: &str) {
        let Some(name) = server_name_from_path(path) else {
            close_client(&mut client, CLOSE_UNSUPPORTED, "Invalid path").await;
            return;
        };

        let over_limit = {
            let connections = self.inner.connections.lock().unwrap();
            connections.len() >= self.inner.settings.max_connections
        };
        if over_limit {
            close_client(&mut client, CLOSE_POLICY, "Connection limit reached").await;
            return;
        }

        let Some(port) = self.inner.allocator.port_for_name(&name) else {
            warn!(server = %name, "WebSocket requested for unknown server");
            close_client(&mut client, CLOSE_INTERNAL, "Unknown server").await;
            return;
        };

        let url = format!("ws://127.0.0.1:{port}/ws");
        let dial = tokio::time::timeout(
            self.inner.settings.connection_timeout(),
            connect_async(url.as_str()),
        )
        .await;
        let backend = match dial {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                warn!(server = %name, error = %e, "Backend WebSocket connect failed");
                close_client(&mut client, CLOSE_INTERNAL, "Backend connect failed").await;
                return;
            }
            Err(_) => {
                warn!(server = %name, "Backend WebSocket connect timed out");
                close_client(&mut client, CLOSE_INTERNAL, "Backend connect timeout").await;
                return;
            }
        };

        let sequence = self.inner.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let connection_id = format!("ws-{sequence}-{}", now_ms());
        let last_activity = Arc::new(AtomicU64::new(now_ms()));
        let (control_tx, control_rx) = mpsc::channel(8);

        self.inner.total_ever.fetch_add(1, Ordering::Relaxed);
        self.inner.connections.lock().unwrap().insert(
            connection_id.clone(),
            ConnectionHandle {
                server: name.clone(),
                created_at: now_ms(),
                last_activity: Arc::clone(&last_activity),
                control: control_tx,
            },
        );
        info!(connection = %connection_id, server = %name, "WebSocket relay opened");
        self.inner.events.emit(GatewayEvent::RelayOpened {
            connection_id: connection_id.clone(),
            server: name.clone(),
            timestamp: now_ms(),
        });

        let close_code = pipe(client, backend, control_rx, &last_activity).await;

        self.inner.connections.lock().unwrap().remove(&connection_id);
        info!(connection = %connection_id, server = %name, code = ?close_code, "WebSocket relay closed");
        self.inner.events.emit(GatewayEvent::RelayClosed {
            connection_id,
            server: name,
            code: close_code,
            timestamp: now_ms(),
        });
    }

    /// Start the periodic idle sweep and ping task.
    pub fn start_heartbeat(&self) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.settings.ping_interval());
            interval.tick().await;
            loop {
                interval.tick().await;
                let idle_cutoff = inner.settings.connection_timeout_ms;
                let now = now_ms();
                let targets: Vec<(u64, mpsc::Sender<RelayControl>)> = {
                    let connections = inner.connections.lock().unwrap();
                    connections
                        .values()
                        .map(|h| (h.last_activity.load(Ordering::Relaxed), h.control.clone()))
                        .collect()
                };
                for (last, control) in targets {
                    if now.saturating_sub(last) > idle_cutoff {
                        let _ = control
                            .send(RelayControl::Close {
                                code: CLOSE_GOING_AWAY,
                                reason: "Connection timeout".to_string(),
                            })
                            .await;
                    } else {
                        let _ = control.send(RelayControl::Ping).await;
                    }
                }
            }
        });
        *self.inner.heartbeat.lock().unwrap() = Some(handle.abort_handle());
    }

    /// Cancel the heartbeat and close every active connection.
    pub async fn shutdown(&self) {
        if let Some(heartbeat) = self.inner.heartbeat.lock().unwrap().take() {
            heartbeat.abort();
        }
        let controls: Vec<mpsc::Sender<RelayControl>> = {
            let connections = self.inner.connections.lock().unwrap();
            connections.values().map(|h| h.control.clone()).collect()
        };
        for control in controls {
            let _ = control
                .send(RelayControl::Close {
                    code: CLOSE_GOING_AWAY,
                    reason: "Server shutdown".to_string(),
                })
                .await;
        }
        // Give connection tasks a beat to flush their close frames.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        self.inner.connections.lock().unwrap().clear();
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let connections = self.inner.connections.lock().unwrap();
        let mut all: Vec<_> = connections
            .iter()
            .map(|(id, h)| ConnectionInfo {
                connection_id: id.clone(),
                server: h.server.clone(),
                created_at: h.created_at,
                last_activity: h.last_activity.load(Ordering::Relaxed),
            })
            .collect();
        all.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        all
    }

    pub fn connections_by_server(&self, name: &str) -> Vec<ConnectionInfo> {
        self.connections()
            .into_iter()
            .filter(|c| c.server == name)
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().unwrap().len()
    }

    pub fn stats(&self) -> RelayStats {
        let connections = self.inner.connections.lock().unwrap();
        let mut by_server: HashMap<String, usize> = HashMap::new();
        for handle in connections.values() {
            *by_server.entry(handle.server.clone()).or_insert(0) += 1;
        }
        RelayStats {
            total_ever: self.inner.total_ever.load(Ordering::Relaxed),
            active: connections.len(),
            by_server,
        }
    }
}

/// Extract `<name>` from `/ws/<name>[/...]`.
fn server_name_from_path(path: &str) -> Option<String> {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    if segments.next() != Some("ws") {
        return None;
    }
    segments.next().map(str::to_string)
}

/// Pipe frames both ways until either side closes.
///
/// Returns the close code reported to the client side, when one applies.
async fn pipe(
    mut client: WebSocket,
    mut backend: BackendSocket,
    mut control_rx: mpsc::Receiver<RelayControl>,
    last_activity: &AtomicU64,
) -> Option<u16> {
    loop {
        tokio::select! {
            client_msg = client.recv() => {
                last_activity.store(now_ms(), Ordering::Relaxed);
                match client_msg {
                    Some(Ok(Message::Text(text))) => {
                        if backend
                            .send(BackendMessage::Text(text.to_string().into()))
                            .await
                            .is_err()
                        {
                            close_client(&mut client, CLOSE_INTERNAL, "Backend send failed").await;
                            return Some(CLOSE_INTERNAL);
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if backend
                            .send(BackendMessage::Binary(data.to_vec().into()))
                            .await
                            .is_err()
                        {
                            close_client(&mut client, CLOSE_INTERNAL, "Backend send failed").await;
                            return Some(CLOSE_INTERNAL);
                        }
                    }
                    // Ping/pong is handled by the protocol layer; pongs only
                    // refresh the activity stamp, which already happened.
                    Some(Ok(Message::Ping(_)) | Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        let mirrored = frame.as_ref().map(|f| BackendCloseFrame {
                            code: CloseCode::from(f.code),
                            reason: f.reason.to_string().into(),
                        });
                        let _ = backend.send(BackendMessage::Close(mirrored)).await;
                        return frame.map(|f| f.code);
                    }
                    Some(Err(_)) | None => {
                        let _ = backend.send(BackendMessage::Close(None)).await;
                        return None;
                    }
                }
            }
            backend_msg = backend.next() => {
                last_activity.store(now_ms(), Ordering::Relaxed);
                match backend_msg {
                    Some(Ok(BackendMessage::Text(text))) => {
                        if client.send(Message::Text(text.to_string().into())).await.is_err() {
                            return None;
                        }
                    }
                    Some(Ok(BackendMessage::Binary(data))) => {
                        if client.send(Message::Binary(data.to_vec().into())).await.is_err() {
                            return None;
                        }
                    }
                    Some(Ok(BackendMessage::Ping(_) | BackendMessage::Pong(_))) => {}
                    Some(Ok(BackendMessage::Close(frame))) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code));
                        let mirrored = frame.map(|f| CloseFrame {
                            code: u16::from(f.code),
                            reason: f.reason.to_string().into(),
                        });
                        let _ = client.send(Message::Close(mirrored)).await;
                        return code;
                    }
                    Some(Ok(BackendMessage::Frame(_))) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "Backend WebSocket error");
                        close_client(&mut client, CLOSE_INTERNAL, "Backend error").await;
                        return Some(CLOSE_INTERNAL);
                    }
                    None => {
                        close_client(&mut client, CLOSE_GOING_AWAY, "Backend closed").await;
                        return Some(CLOSE_GOING_AWAY);
                    }
                }
            }
            ctrl = control_rx.recv() => {
                match ctrl {
                    Some(RelayControl::Ping) => {
                        let _ = client.send(Message::Ping(Vec::new().into())).await;
                    }
                    Some(RelayControl::Close { code, reason }) => {
                        let _ = backend
                            .send(BackendMessage::Close(Some(BackendCloseFrame {
                                code: CloseCode::from(code),
                                reason: reason.clone().into(),
                            })))
                            .await;
                        close_client(&mut client, code, &reason).await;
                        return Some(code);
                    }
                    None => return None,
                }
            }
        }
    }
}

async fn close_client(client: &mut WebSocket, code: u16, reason: &str) {
    let _ = client
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_parsing() {
        assert_eq!(server_name_from_path("/ws/echo"), Some("echo".to_string()));
        assert_eq!(
            server_name_from_path("/ws/echo/extra"),
            Some("echo".to_string())
        );
        assert_eq!(server_name_from_path("/ws"), None);
        assert_eq!(server_name_from_path("/other/echo"), None);
        assert_eq!(server_name_from_path("/"), None);
    }

    #[tokio::test]
    async fn connection_ids_are_monotonic() {
        // The counter half of the id must never repeat within a process.
        let events = EventBus::new();
        let allocator = Arc::new(
            PortAllocator::new(48201, 48209, std::time::Duration::from_secs(60), events.clone())
                .unwrap(),
        );
        let relay = WsRelay::new(allocator, RelaySettings::default(), events);
        let a = relay.inner.counter.fetch_add(1, Ordering::Relaxed);
        let b = relay.inner.counter.fetch_add(1, Ordering::Relaxed);
        assert!(b > a);
        assert_eq!(relay.connection_count(), 0);
        assert_eq!(relay.stats().active, 0);
    }
}
