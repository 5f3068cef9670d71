//! Command dispatch
//!
//! Maps a packet's command id to the handler bound to it. The table is built
//! once at startup and is read-only afterwards. Packets whose command has no
//! handler go to [`UnsupportedPacketHandler`], which logs and drops them.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tracing::{trace, warn};

use crate::auth::SessionValidator;
use crate::error::{AuthError, DispatchError, Result, SyncError};
use crate::game::store::GameStateStore;
use crate::game::sync::CharacterSyncManager;
use crate::net::connection::{Connection, KEEP_ALIVE_COMMAND};
use crate::net::session::SessionManager;
use crate::protocol::packet::{Packet, Payload};

/// Presents a session token
pub const AUTHENTICATE: &str = "authenticate";
/// Clock exchange
pub const SYNC_TIME: &str = "sync_time";
/// Liveness check
pub const KEEP_ALIVE: &str = KEEP_ALIVE_COMMAND;
/// Full or delta character state
pub const UPDATE_CHARACTER_STATE: &str = "update_character_state";
/// Full or delta character skills
pub const UPDATE_CHARACTER_SKILLS: &str = "update_character_skills";
pub const UPDATE_USER_SESSION_STATS: &str = "update_user_session_stats";
pub const UPDATE_USER_LOYALTY: &str = "update_user_loyalty";
/// Batch-of-packets envelope
pub const COLLECTION_COMMAND: &str = "collection";

/// Collaborators handlers work against
#[derive(Clone)]
pub struct HandlerContext {
    pub validator: Arc<dyn SessionValidator>,
    pub store: Arc<dyn GameStateStore>,
    pub sessions: Arc<SessionManager>,
    pub sync: Arc<CharacterSyncManager>,
}

impl fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("sessions", &self.sessions.count())
            .finish_non_exhaustive()
    }
}

/// Logic bound to one command id
pub trait PacketHandler: Send + Sync {
    /// Handle one inbound packet
    ///
    /// Errors are logged once by the registry; handlers return early without
    /// replying when session validation fails.
    fn handle<'a>(
        &'a self,
        ctx: &'a HandlerContext,
        connection: &'a Arc<Connection>,
        packet: Packet,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Result of dispatching one packet
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// A handler ran successfully
    Handled,
    /// No handler is registered for the command
    Unsupported,
    /// Session validation failed; nothing was changed and no reply was sent
    Rejected(AuthError),
    /// The handler failed for another reason
    Failed(String),
    /// Outcomes of the packets inside a `collection`, in order
    Batch(Vec<DispatchOutcome>),
}

impl DispatchOutcome {
    pub fn is_handled(&self) -> bool {
        matches!(self, DispatchOutcome::Handled)
    }
}

/// Fallback for commands without a handler
#[derive(Debug, Default)]
pub struct UnsupportedPacketHandler {
    count: AtomicU64,
}

impl UnsupportedPacketHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Packets routed here so far
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Count and log a packet nobody handles
    pub fn record(&self, connection: &Connection, packet: &Packet) {
        self.count.fetch_add(1, Ordering::Relaxed);
        warn!(
            connection_id = connection.id(),
            command = %packet.id,
            payload_type = %packet.type_name,
            "Unsupported packet"
        );
    }
}

impl PacketHandler for UnsupportedPacketHandler {
    fn handle<'a>(
        &'a self,
        _ctx: &'a HandlerContext,
        connection: &'a Arc<Connection>,
        packet: Packet,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.record(connection, &packet);
            Ok(())
        })
    }
}

/// Builder for [`DispatchRegistry`]
#[derive(Default)]
pub struct DispatchRegistryBuilder {
    handlers: HashMap<String, Arc<dyn PacketHandler>>,
}

impl DispatchRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler to a command id; each id may be bound once
    pub fn register<H>(&mut self, command: &str, handler: H) -> std::result::Result<&mut Self, DispatchError>
    where
        H: PacketHandler + 'static,
    {
        if self.handlers.contains_key(command) {
            return Err(DispatchError::DuplicateHandler(command.to_string()));
        }
        self.handlers.insert(command.to_string(), Arc::new(handler));
        Ok(self)
    }

    pub fn build(self) -> DispatchRegistry {
        DispatchRegistry {
            handlers: self.handlers,
            unsupported: UnsupportedPacketHandler::new(),
        }
    }
}

/// Command id to handler table
pub struct DispatchRegistry {
    handlers: HashMap<String, Arc<dyn PacketHandler>>,
    unsupported: UnsupportedPacketHandler,
}

impl DispatchRegistry {
    pub fn builder() -> DispatchRegistryBuilder {
        DispatchRegistryBuilder::new()
    }

    pub fn try_get(&self, command: &str) -> Option<&Arc<dyn PacketHandler>> {
        self.handlers.get(command)
    }

    pub fn unsupported(&self) -> &UnsupportedPacketHandler {
        &self.unsupported
    }

    /// Registered command ids, sorted
    pub fn commands(&self) -> Vec<&str> {
        let mut commands: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        commands.sort_unstable();
        commands
    }

    /// Route one packet to its handler
    ///
    /// A `collection` envelope is unpacked and each inner packet dispatched
    /// in order. Handler errors are logged here and never propagate.
    pub fn dispatch<'a>(
        &'a self,
        ctx: &'a HandlerContext,
        connection: &'a Arc<Connection>,
        packet: Packet,
    ) -> BoxFuture<'a, DispatchOutcome> {
        Box::pin(async move {
            if packet.id == COLLECTION_COMMAND {
                if let Payload::Collection(inner) = packet.payload {
                    trace!(connection_id = connection.id(), packets = inner.len(), "Dispatching collection");
                    let mut outcomes = Vec::with_capacity(inner.len());
                    for packet in inner {
                        outcomes.push(self.dispatch(ctx, connection, packet).await);
                    }
                    return DispatchOutcome::Batch(outcomes);
                }
            }

            let Some(handler) = self.try_get(&packet.id) else {
                self.unsupported.record(connection, &packet);
                return DispatchOutcome::Unsupported;
            };

            let command = packet.id.clone();
            let payload_type = packet.type_name.clone();
            trace!(connection_id = connection.id(), command = %command, payload_type = %payload_type, "Dispatching");

            match handler.handle(ctx, connection, packet).await {
                Ok(()) => DispatchOutcome::Handled,
                Err(SyncError::Auth(e)) => {
                    warn!(
                        connection_id = connection.id(),
                        command = %command,
                        error = %e,
                        "Session rejected, packet dropped"
                    );
                    DispatchOutcome::Rejected(e)
                }
                Err(e) => {
                    warn!(
                        connection_id = connection.id(),
                        command = %command,
                        payload_type = %payload_type,
                        error = %e,
                        "Handler failed"
                    );
                    DispatchOutcome::Failed(e.to_string())
                }
            }
        })
    }
}

impl fmt::Debug for DispatchRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchRegistry")
            .field("commands", &self.commands())
            .field("unsupported", &self.unsupported.count())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::StaticSessionValidator;
    use crate::game::store::InMemoryGameStore;
    use crate::net::connection::{ConnectionOptions, OutboundQueue};
    use crate::net::transport::TransportKind;
    use crate::protocol::codec::PayloadCodec;
    use crate::protocol::frame::PacketCodec;
    use crate::protocol::registry::TypeRegistry;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    pub(crate) fn test_context() -> HandlerContext {
        HandlerContext {
            validator: Arc::new(StaticSessionValidator::new()),
            store: Arc::new(InMemoryGameStore::new()),
            sessions: Arc::new(SessionManager::new(10)),
            sync: Arc::new(CharacterSyncManager::new()),
        }
    }

    pub(crate) fn test_codec() -> Arc<PacketCodec> {
        let registry = Arc::new(TypeRegistry::builtin().unwrap());
        Arc::new(PacketCodec::new(PayloadCodec::Json, registry))
    }

    pub(crate) fn test_connection() -> (Arc<Connection>, OutboundQueue) {
        Connection::new(
            1,
            "127.0.0.1:40000".parse().unwrap(),
            TransportKind::Tcp,
            test_codec(),
            ConnectionOptions::default(),
        )
    }

    struct Counting(Arc<AtomicUsize>);

    impl PacketHandler for Counting {
        fn handle<'a>(
            &'a self,
            _ctx: &'a HandlerContext,
            _connection: &'a Arc<Connection>,
            _packet: Packet,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    struct Rejecting;

    impl PacketHandler for Rejecting {
        fn handle<'a>(
            &'a self,
            _ctx: &'a HandlerContext,
            _connection: &'a Arc<Connection>,
            _packet: Packet,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move { Err(AuthError::SessionExpired.into()) })
        }
    }

    #[test]
    fn test_duplicate_handler_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut builder = DispatchRegistry::builder();
        builder.register("ping", Counting(Arc::clone(&calls))).unwrap();

        let err = builder.register("ping", Counting(calls)).err();
        assert_eq!(err, Some(DispatchError::DuplicateHandler("ping".to_string())));
        assert_eq!(builder.build().commands(), vec!["ping"]);
    }

    #[tokio::test]
    async fn test_unknown_command_goes_to_fallback() {
        let registry = DispatchRegistry::builder().build();
        let ctx = test_context();
        let (connection, _queue) = test_connection();

        let outcome = registry
            .dispatch(&ctx, &connection, Packet::new("fly_to_moon", true))
            .await;

        assert_eq!(outcome, DispatchOutcome::Unsupported);
        assert_eq!(registry.unsupported().count(), 1);
        assert!(!connection.is_closed());
    }

    #[tokio::test]
    async fn test_fallback_counts_as_handler_and_directly() {
        let fallback = UnsupportedPacketHandler::new();
        let ctx = test_context();
        let (connection, _queue) = test_connection();

        fallback.record(&connection, &Packet::new("fly_to_moon", true));
        fallback
            .handle(&ctx, &connection, Packet::new("fly_to_moon", false))
            .await
            .unwrap();

        assert_eq!(fallback.count(), 2);
    }

    #[tokio::test]
    async fn test_collection_dispatches_in_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut builder = DispatchRegistry::builder();
        builder.register("ping", Counting(Arc::clone(&calls))).unwrap();
        builder.register("guarded", Rejecting).unwrap();
        let registry = builder.build();
        let ctx = test_context();
        let (connection, _queue) = test_connection();

        let packet = Packet::collection(vec![
            Packet::new("ping", ()),
            Packet::new("guarded", ()),
            Packet::new("missing", ()),
            Packet::new("ping", ()),
        ]);
        let outcome = registry.dispatch(&ctx, &connection, packet).await;

        assert_eq!(
            outcome,
            DispatchOutcome::Batch(vec![
                DispatchOutcome::Handled,
                DispatchOutcome::Rejected(AuthError::SessionExpired),
                DispatchOutcome::Unsupported,
                DispatchOutcome::Handled,
            ])
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
