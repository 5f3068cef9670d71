//! Application state module
//!
//! Contains the shared state used across all server connections, and the
//! periodic maintenance the Kernel runs against it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::auth::{require_session, DevSessionValidator, JwtSessionValidator, SessionValidator};
use crate::config::ServerConfig;
use crate::error::Result;
use crate::game::store::{GameStateStore, InMemoryGameStore};
use crate::game::sync::{CharacterSyncManager, SyncReport};
use crate::kernel::Kernel;
use crate::net::connection::ConnectionOptions;
use crate::net::session::SessionManager;
use crate::protocol::dispatch::{DispatchRegistry, HandlerContext};
use crate::protocol::frame::PacketCodec;
use crate::protocol::registry::TypeRegistry;

/// Application state shared across all connections
pub struct AppState {
    /// Server configuration
    pub config: ServerConfig,
    /// Frame codec shared by every connection
    pub codec: Arc<PacketCodec>,
    /// Command handlers
    pub dispatcher: DispatchRegistry,
    /// Collaborators handed to handlers
    pub handler_context: HandlerContext,
    /// Open connections
    pub sessions: Arc<SessionManager>,
    /// Game state repository
    pub store: Arc<dyn GameStateStore>,
    /// Outgoing character deltas
    pub sync: Arc<CharacterSyncManager>,
    /// Deferred and periodic work
    pub kernel: Arc<Kernel>,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
    shutting_down: AtomicBool,
}

impl AppState {
    /// Create the application state with the validator the config selects and an in-memory store
    pub fn new(config: ServerConfig, shutdown_tx: broadcast::Sender<()>) -> Result<Self> {
        let validator: Arc<dyn SessionValidator> = if config.auth.jwt_secret.is_empty() {
            warn!("No JWT secret configured; dev mode accepts any session token");
            Arc::new(DevSessionValidator::new())
        } else {
            Arc::new(JwtSessionValidator::new(&config.auth.jwt_secret, config.auth.leeway_secs))
        };

        info!("Game state store: in-memory");
        let store: Arc<dyn GameStateStore> = Arc::new(InMemoryGameStore::new());

        Self::with_collaborators(config, shutdown_tx, validator, store)
    }

    /// Create the application state around externally provided collaborators
    pub fn with_collaborators(
        config: ServerConfig,
        shutdown_tx: broadcast::Sender<()>,
        validator: Arc<dyn SessionValidator>,
        store: Arc<dyn GameStateStore>,
    ) -> Result<Self> {
        let registry = TypeRegistry::builtin()?;
        info!(
            types = registry.len(),
            codec = %config.payload_codec,
            "Type registry built"
        );
        let codec = Arc::new(
            PacketCodec::new(config.payload_codec, Arc::new(registry)).with_max_frame_size(config.max_frame_size),
        );

        let dispatcher = DispatchRegistry::builtin()?;
        debug!(commands = ?dispatcher.commands(), "Dispatch registry built");

        let sessions = Arc::new(SessionManager::new(config.max_connections_per_ip));
        let sync = Arc::new(CharacterSyncManager::new());
        let kernel = Arc::new(Kernel::new(config.kernel_poll_interval()));

        let handler_context = HandlerContext {
            validator,
            store: Arc::clone(&store),
            sessions: Arc::clone(&sessions),
            sync: Arc::clone(&sync),
        };

        Ok(Self {
            config,
            codec,
            dispatcher,
            handler_context,
            sessions,
            store,
            sync,
            kernel,
            shutdown_tx,
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        self.config.connection_options()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Schedule the idle sweep, keep-alive and sync timeouts; each re-arms itself
    pub fn start_maintenance(self: &Arc<Self>) {
        let idle_timeout = self.config.session_idle_timeout();
        let sweep_interval = (idle_timeout / 4).max(Duration::from_secs(1));

        schedule_repeating(self, sweep_interval, move |state| {
            let expired = state.sessions.expire_idle(idle_timeout);
            if expired > 0 {
                info!(expired, "Closed idle connections");
            }
        });

        schedule_repeating(self, self.config.keep_alive_interval(), |state| {
            let sent = state.sessions.keep_alive_all();
            debug!(sent, "Keep-alive sent");
        });

        schedule_repeating(self, self.config.sync_interval(), |state| {
            state.run_sync_tick();
        });

        info!(
            sweep_interval_ms = sweep_interval.as_millis() as u64,
            keep_alive_interval_secs = self.config.keep_alive_interval_secs,
            sync_interval_ms = self.config.sync_interval_ms,
            "Maintenance scheduled"
        );
    }

    /// Push character deltas to every authenticated connection
    pub fn run_sync_tick(&self) -> SyncReport {
        let mut total = SyncReport::default();
        for (user_id, connection) in self.sessions.authenticated_users() {
            let token = connection.session_token();
            if require_session(self.handler_context.validator.as_ref(), token.as_deref()).is_err() {
                continue;
            }
            let report = self.sync.sync_user(&connection, self.store.as_ref(), user_id);
            total.state_deltas += report.state_deltas;
            total.skill_deltas += report.skill_deltas;
        }
        total
    }

    /// Close every connection and stop the Kernel
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        info!(connections = self.sessions.count(), "Closing all connections");
        self.sessions.close_all();
        self.kernel.shutdown();
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("server_name", &self.config.server_name)
            .field("sessions", &self.sessions)
            .field("kernel", &self.kernel)
            .finish_non_exhaustive()
    }
}

/// Run `task` every `interval` on the Kernel until shutdown or until the state is dropped
fn schedule_repeating<F>(state: &Arc<AppState>, interval: Duration, task: F)
where
    F: Fn(&AppState) + Send + Sync + 'static,
{
    arm(state, interval, Arc::new(task));
}

fn arm<F>(state: &Arc<AppState>, interval: Duration, task: Arc<F>)
where
    F: Fn(&AppState) + Send + Sync + 'static,
{
    let weak: Weak<AppState> = Arc::downgrade(state);
    state.kernel.set_timeout(interval, move || {
        let Some(state) = weak.upgrade() else {
            return;
        };
        if state.is_shutting_down() {
            return;
        }
        task(state.as_ref());
        arm(&state, interval, task);
    });
}
