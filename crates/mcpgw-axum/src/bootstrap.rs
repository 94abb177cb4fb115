//! Gateway composition root.
//!
//! This is the only place where the allocator, supervisor, adapters,
//! proxy, router and relay are wired together. Descriptors that cannot be
//! brought up (port exhaustion, spawn failure) are logged and skipped;
//! the rest of the gateway still serves.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mcpgw_adapter::AdapterManager;
use mcpgw_core::{BackendDescriptor, EventBus, GatewaySettings};
use mcpgw_proxy::{RequestRouter, ReverseProxy, RouterConfig};
use mcpgw_runtime::{PortAllocator, Supervisor};

use crate::relay::WsRelay;
use crate::routes::build_router;
use crate::state::AppState;

/// Everything the gateway owns, shared with every handler.
pub struct GatewayContext {
    pub settings: GatewaySettings,
    pub descriptors: Vec<BackendDescriptor>,
    pub events: EventBus,
    pub allocator: Arc<PortAllocator>,
    pub supervisor: Supervisor,
    pub adapters: Arc<AdapterManager>,
    pub proxy: Arc<ReverseProxy>,
    pub router: Arc<RequestRouter>,
    pub relay: WsRelay,
    started: Instant,
}

impl GatewayContext {
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Ordered teardown of the traffic plane: relay, adapters, supervisor.
    ///
    /// The caller closes the public listener afterwards and finishes with
    /// [`PortAllocator::cleanup`].
    pub async fn shutdown(&self) {
        info!("Shutting down relay");
        self.relay.shutdown().await;
        info!("Stopping adapters");
        self.adapters.stop_all_adapters().await;
        info!("Stopping supervised processes");
        self.supervisor.stop_all_servers().await;
    }
}

/// Construct the gateway: build A through F in order, register every
/// descriptor, allocate ports and bring stdio backends up.
pub async fn bootstrap(
    settings: GatewaySettings,
    descriptors: Vec<BackendDescriptor>,
) -> Result<AppState> {
    settings.validate().context("invalid gateway settings")?;

    info!(
        host = %settings.host,
        port = %settings.port,
        range_start = %settings.port_range_start,
        range_end = %settings.port_range_end,
        backends = %descriptors.len(),
        "Bootstrapping gateway"
    );

    let events = EventBus::new();
    spawn_event_drain(&events);

    let allocator = Arc::new(PortAllocator::new(
        settings.port_range_start,
        settings.port_range_end,
        settings.reservation_timeout(),
        events.clone(),
    )?);
    let supervisor = Supervisor::new(settings.supervisor, events.clone());
    let adapters = Arc::new(AdapterManager::new(
        supervisor.clone(),
        settings.adapter.clone(),
        events.clone(),
    ));
    let proxy = Arc::new(ReverseProxy::new(
        Arc::clone(&allocator),
        supervisor.clone(),
        settings.adapter.timeout(),
    ));
    let router = Arc::new(RequestRouter::new(RouterConfig::default(), Arc::clone(&proxy)));
    let relay = WsRelay::new(Arc::clone(&allocator), settings.relay, events.clone());

    for descriptor in &descriptors {
        router.register(descriptor.clone());
        if !descriptor.capabilities.requires_stdio {
            continue;
        }
        let port = match allocator.allocate(&descriptor.name, None) {
            Ok(port) => port,
            Err(e) => {
                warn!(server = %descriptor.name, error = %e, "Skipping backend: no port");
                continue;
            }
        };
        if let Err(e) = adapters.create_adapter(descriptor, port).await {
            warn!(server = %descriptor.name, error = %e, "Skipping backend: adapter failed");
            allocator.release_port(&descriptor.name);
        }
    }

    if settings.enable_websocket {
        relay.start_heartbeat();
    }

    Ok(Arc::new(GatewayContext {
        settings,
        descriptors,
        events,
        allocator,
        supervisor,
        adapters,
        proxy,
        router,
        relay,
        started: Instant::now(),
    }))
}

/// Serve the public listener until `cancel` fires.
pub async fn serve(state: AppState, cancel: CancellationToken) -> Result<()> {
    let app = build_router(Arc::clone(&state));
    let listener = TcpListener::bind((state.settings.host.as_str(), state.settings.port))
        .await
        .with_context(|| {
            format!(
                "failed to bind {}:{}",
                state.settings.host, state.settings.port
            )
        })?;
    let addr: SocketAddr = listener.local_addr().context("listener has no address")?;
    info!("Gateway listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    info!("Gateway listener closed");
    Ok(())
}

/// Serve until `shutdown_signal` resolves, then tear down in order:
/// relay, adapters, supervisor, listener, allocator.
pub async fn run(
    state: AppState,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let mut serve_task = tokio::spawn(serve(Arc::clone(&state), cancel.clone()));

    tokio::select! {
        result = &mut serve_task => {
            // The listener died on its own; tear down what was started.
            state.shutdown().await;
            state.allocator.cleanup();
            return match result {
                Ok(outcome) => outcome,
                Err(e) => Err(anyhow!("listener task panicked: {e}")),
            };
        }
        () = shutdown_signal => {
            info!("Shutdown signal received");
        }
    }

    state.shutdown().await;
    cancel.cancel();
    match serve_task.await {
        Ok(result) => result?,
        Err(e) => warn!(error = %e, "Listener task failed"),
    }
    state.allocator.cleanup();
    info!("Gateway stopped");
    Ok(())
}

/// Drain lifecycle events into the structured log.
fn spawn_event_drain(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => info!(target: "mcpgw.events", event = ?event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(target: "mcpgw.events", missed = %missed, "Event drain lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
