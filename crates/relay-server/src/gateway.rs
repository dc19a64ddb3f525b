//! Wires config, plugins and components into one application.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use relay_core::{
    ChannelAdapter, Clock, GatewayConfig, Plugin, PluginRegistry, RegistryError,
};
use relay_session::{
    AbortRegistry, ChatHistoryStore, DispatchCoordinator, SessionStore, storage::InMemoryStore,
};
use relay_transport::{
    RpcDispatcher,
    websocket::{WsState, create_ws_router},
};
use tokio::task::JoinHandle;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    echo::{ECHO_PROVIDER, EchoEngine},
    http::{self, AppState},
};

/// Memory plugin holding chat history.
pub const MEMORY_PLUGIN: &str = "memory";

/// Registry with the plugins shipped in this binary.
///
/// # Errors
/// Returns error on a duplicate plugin name.
pub fn builtin_registry(clock: &Arc<dyn Clock>) -> Result<PluginRegistry, RegistryError> {
    let mut registry = PluginRegistry::new();
    registry.register(
        MEMORY_PLUGIN,
        Plugin::Memory(Arc::new(InMemoryStore::with_clock(Arc::clone(clock)))),
    )?;
    registry.register(ECHO_PROVIDER, Plugin::Provider(Arc::new(EchoEngine::new())))?;
    Ok(registry)
}

/// A running gateway's shared components.
pub struct Gateway {
    pub router: Router,
    pub coordinator: Arc<DispatchCoordinator>,
    channels: Vec<Arc<dyn ChannelAdapter>>,
    sweeper: JoinHandle<()>,
}

impl Gateway {
    /// Build every component and the HTTP router.
    ///
    /// # Errors
    /// Returns error if the configured backend or the memory plugin is
    /// not registered.
    pub fn build(config: &GatewayConfig, registry: &PluginRegistry, clock: Arc<dyn Clock>) -> Result<Self> {
        let engine = match config.agent.backend.as_deref() {
            Some(name) => Some(
                registry
                    .provider(name)
                    .with_context(|| format!("Unknown agent backend: {name}"))?,
            ),
            None => {
                tracing::warn!("No agent backend configured, chat is unavailable");
                None
            }
        };
        let memory = registry
            .memory(MEMORY_PLUGIN)
            .with_context(|| format!("Missing memory plugin: {MEMORY_PLUGIN}"))?;

        let sessions = Arc::new(SessionStore::new(config.session.clone(), Arc::clone(&clock)));
        let sweeper = Arc::clone(&sessions).spawn_sweeper();
        let history = Arc::new(ChatHistoryStore::new(memory, Arc::clone(&clock)));
        let coordinator = Arc::new(
            DispatchCoordinator::new(sessions, Arc::new(AbortRegistry::new()), engine)
                .with_history(Arc::clone(&history)),
        );

        let channels = registry.channels();
        for adapter in &channels {
            coordinator.bind_channel(adapter);
        }

        let dispatcher = Arc::new(RpcDispatcher::new(
            Arc::clone(&coordinator),
            history,
            registry.skills(),
            config.streaming.clone(),
            Arc::clone(&clock),
        ));
        let ws_state = Arc::new(WsState {
            dispatcher,
            protocol: config.protocol.clone(),
            server_version: env!("CARGO_PKG_VERSION").to_owned(),
            clock: Arc::clone(&clock),
        });

        let router = http::router(AppState::new(Arc::clone(&coordinator), clock))
            .merge(create_ws_router(ws_state))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive());

        Ok(Self {
            router,
            coordinator,
            channels,
            sweeper,
        })
    }

    /// Start every bound channel adapter.
    ///
    /// # Errors
    /// Returns error if an adapter fails to start.
    pub async fn start_channels(&self) -> Result<()> {
        for adapter in &self.channels {
            adapter
                .start()
                .await
                .with_context(|| format!("Failed to start channel {}", adapter.name()))?;
            tracing::info!(channel = adapter.name(), "Channel started");
        }
        Ok(())
    }

    /// Stop channels and background tasks.
    pub async fn shutdown(self) {
        for adapter in &self.channels {
            if let Err(e) = adapter.stop().await {
                tracing::warn!(channel = adapter.name(), error = %e, "Failed to stop channel");
            }
        }
        self.sweeper.abort();
    }
}
