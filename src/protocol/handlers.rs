//! Command handlers
//!
//! One handler per command id. Handlers that touch game state validate the
//! session on the connection first and return the auth error without
//! replying when it is missing or expired.

use std::sync::Arc;

use chrono::Utc;
use futures_util::future::BoxFuture;
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth::{require_session, Principal};
use crate::error::{AuthError, DispatchError, GameError, Result};
use crate::game::sync::delta::{apply, EntityDelta, Trackable};
use crate::net::connection::Connection;
use crate::protocol::dispatch::{
    DispatchRegistry, HandlerContext, PacketHandler, AUTHENTICATE, KEEP_ALIVE, SYNC_TIME,
    UPDATE_CHARACTER_SKILLS, UPDATE_CHARACTER_STATE, UPDATE_USER_LOYALTY, UPDATE_USER_SESSION_STATS,
};
use crate::protocol::messages::{
    AuthToken, CharacterSkillUpdate, CharacterSkillsDelta, CharacterStateDelta, CharacterStateUpdate, TimeSync,
    UserLoyaltyUpdate, UserSessionStats,
};
use crate::protocol::packet::{Packet, PayloadType};

impl DispatchRegistry {
    /// Registry with every built-in command
    pub fn builtin() -> std::result::Result<Self, DispatchError> {
        let mut builder = DispatchRegistry::builder();
        builder
            .register(AUTHENTICATE, AuthenticateHandler)?
            .register(SYNC_TIME, SyncTimeHandler)?
            .register(KEEP_ALIVE, KeepAliveHandler)?
            .register(UPDATE_CHARACTER_STATE, UpdateCharacterStateHandler)?
            .register(UPDATE_CHARACTER_SKILLS, UpdateCharacterSkillsHandler)?
            .register(UPDATE_USER_SESSION_STATS, UpdateUserSessionStatsHandler)?
            .register(UPDATE_USER_LOYALTY, UpdateUserLoyaltyHandler)?;
        Ok(builder.build())
    }
}

/// Session check shared by the state handlers
fn authorize(ctx: &HandlerContext, connection: &Connection) -> std::result::Result<Principal, AuthError> {
    require_session(ctx.validator.as_ref(), connection.session_token().as_deref())
}

fn expect_payload<T: PayloadType>(packet: &Packet) -> Result<&T> {
    packet.payload_as::<T>().ok_or_else(|| {
        GameError::UnexpectedPayload {
            command: packet.id.clone(),
            payload_type: packet.type_name.clone(),
        }
        .into()
    })
}

/// Reply `true` to a request; pushes carry no correlation id and get nothing
async fn acknowledge(connection: &Connection, packet: &Packet) -> Result<()> {
    match packet.correlation_id {
        Some(correlation_id) => connection.reply(correlation_id, &packet.id, true).await,
        None => Ok(()),
    }
}

/// Apply a batch of deltas onto stored snapshots, in order
///
/// The batch is all or nothing: every delta is applied to a staged copy and
/// the store is only written once the whole batch succeeded.
fn apply_deltas<T, L, S>(deltas: &[EntityDelta], load: L, mut save: S) -> Result<usize>
where
    T: Trackable,
    L: Fn(Uuid) -> Option<T>,
    S: FnMut(Uuid, T) -> Result<()>,
{
    // (entity, snapshot, dirty) in first-seen order; later deltas chain onto earlier ones
    let mut staged: Vec<(Uuid, T, bool)> = Vec::new();
    let mut changed = 0;
    for delta in deltas {
        let slot = match staged.iter().position(|(id, _, _)| *id == delta.entity_id) {
            Some(slot) => slot,
            None => {
                let snapshot = load(delta.entity_id).unwrap_or_default();
                staged.push((delta.entity_id, snapshot, false));
                staged.len() - 1
            }
        };
        let (_, snapshot, dirty) = &mut staged[slot];
        if apply(snapshot, delta)? {
            *dirty = true;
            changed += 1;
        }
    }

    for (id, snapshot, dirty) in staged {
        if dirty {
            save(id, snapshot)?;
        }
    }
    Ok(changed)
}

/// Rejects a delta for a character owned by someone else before it is applied
fn check_owner(ctx: &HandlerContext, user_id: Uuid, character_id: Uuid) -> Result<()> {
    match ctx.store.character_owner(character_id) {
        Some(owner) if owner != user_id => Err(GameError::CharacterNotOwned { character_id, user_id }.into()),
        _ => Ok(()),
    }
}

/// `authenticate`: binds a session token to the connection
pub struct AuthenticateHandler;

impl PacketHandler for AuthenticateHandler {
    fn handle<'a>(
        &'a self,
        ctx: &'a HandlerContext,
        connection: &'a Arc<Connection>,
        packet: Packet,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let AuthToken { token } = expect_payload::<AuthToken>(&packet)?.clone();

            let Some(session) = ctx.validator.resolve(&token) else {
                if let Some(correlation_id) = packet.correlation_id {
                    connection.reply(correlation_id, &packet.id, false).await?;
                }
                return Err(AuthError::InvalidToken("unknown session token".to_string()).into());
            };

            let user_id = session.principal.user_id;
            connection.authenticate(token, user_id);
            ctx.sessions.bind_user(user_id, connection.id());

            if session.expired {
                // Kept on the connection so later packets are rejected as expired
                debug!(connection_id = connection.id(), user_id = %user_id, "Authenticated with expired token");
            } else {
                info!(
                    connection_id = connection.id(),
                    user_id = %user_id,
                    username = %session.principal.username,
                    "Connection authenticated"
                );
            }

            if let Some(correlation_id) = packet.correlation_id {
                connection.reply(correlation_id, &packet.id, !session.expired).await?;
            }
            Ok(())
        })
    }
}

/// `sync_time`: tells the client the server clock
pub struct SyncTimeHandler;

impl PacketHandler for SyncTimeHandler {
    fn handle<'a>(
        &'a self,
        _ctx: &'a HandlerContext,
        connection: &'a Arc<Connection>,
        packet: Packet,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let server_time = Utc::now();
            let client_time = packet.payload_as::<TimeSync>().and_then(|sync| sync.client_time);
            let offset_ms = client_time
                .map(|client| (server_time - client).num_milliseconds())
                .unwrap_or(0);
            let reply = TimeSync {
                server_time,
                client_time,
                offset_ms,
            };

            match packet.correlation_id {
                Some(correlation_id) => connection.reply(correlation_id, &packet.id, reply).await,
                None => {
                    connection.push(&packet.id, reply);
                    Ok(())
                }
            }
        })
    }
}

/// `keep_alive`: refreshes connection activity
pub struct KeepAliveHandler;

impl PacketHandler for KeepAliveHandler {
    fn handle<'a>(
        &'a self,
        _ctx: &'a HandlerContext,
        connection: &'a Arc<Connection>,
        _packet: Packet,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            connection.touch();
            Ok(())
        })
    }
}

/// `update_character_state`: full state or a delta batch
pub struct UpdateCharacterStateHandler;

impl PacketHandler for UpdateCharacterStateHandler {
    fn handle<'a>(
        &'a self,
        ctx: &'a HandlerContext,
        connection: &'a Arc<Connection>,
        packet: Packet,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let principal = authorize(ctx, connection)?;
            let user_id = principal.user_id;

            if let Some(CharacterStateUpdate { character_id, state }) = packet.payload_as::<CharacterStateUpdate>() {
                ctx.store.store_character_state(user_id, *character_id, state.clone())?;
                ctx.sync.acknowledge_state(*character_id, state.clone());
                debug!(connection_id = connection.id(), character_id = %character_id, "Character state updated");
            } else {
                let CharacterStateDelta { deltas } = expect_payload::<CharacterStateDelta>(&packet)?;
                for delta in deltas {
                    check_owner(ctx, user_id, delta.entity_id)?;
                }
                let changed = apply_deltas(
                    deltas,
                    |id| ctx.store.character_state(id),
                    |id, state| {
                        ctx.store.store_character_state(user_id, id, state.clone())?;
                        ctx.sync.acknowledge_state(id, state);
                        Ok(())
                    },
                )?;
                debug!(connection_id = connection.id(), deltas = deltas.len(), changed, "Character state deltas applied");
            }

            acknowledge(connection, &packet).await
        })
    }
}

/// `update_character_skills`: full skill set or a delta batch
pub struct UpdateCharacterSkillsHandler;

impl PacketHandler for UpdateCharacterSkillsHandler {
    fn handle<'a>(
        &'a self,
        ctx: &'a HandlerContext,
        connection: &'a Arc<Connection>,
        packet: Packet,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let principal = authorize(ctx, connection)?;
            let user_id = principal.user_id;

            if let Some(CharacterSkillUpdate { character_id, skills }) = packet.payload_as::<CharacterSkillUpdate>() {
                ctx.store.store_character_skills(user_id, *character_id, skills.clone())?;
                ctx.sync.acknowledge_skills(*character_id, skills.clone());
                debug!(connection_id = connection.id(), character_id = %character_id, "Character skills updated");
            } else {
                let CharacterSkillsDelta { deltas } = expect_payload::<CharacterSkillsDelta>(&packet)?;
                for delta in deltas {
                    check_owner(ctx, user_id, delta.entity_id)?;
                }
                let changed = apply_deltas(
                    deltas,
                    |id| ctx.store.character_skills(id),
                    |id, skills| {
                        ctx.store.store_character_skills(user_id, id, skills.clone())?;
                        ctx.sync.acknowledge_skills(id, skills);
                        Ok(())
                    },
                )?;
                debug!(connection_id = connection.id(), deltas = deltas.len(), changed, "Character skill deltas applied");
            }

            acknowledge(connection, &packet).await
        })
    }
}

/// `update_user_session_stats`
pub struct UpdateUserSessionStatsHandler;

impl PacketHandler for UpdateUserSessionStatsHandler {
    fn handle<'a>(
        &'a self,
        ctx: &'a HandlerContext,
        connection: &'a Arc<Connection>,
        packet: Packet,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let principal = authorize(ctx, connection)?;
            let stats = expect_payload::<UserSessionStats>(&packet)?;
            ctx.store.record_session_stats(principal.user_id, stats.clone())?;
            acknowledge(connection, &packet).await
        })
    }
}

/// `update_user_loyalty`: viewer loyalty reported by the game client
pub struct UpdateUserLoyaltyHandler;

impl PacketHandler for UpdateUserLoyaltyHandler {
    fn handle<'a>(
        &'a self,
        ctx: &'a HandlerContext,
        connection: &'a Arc<Connection>,
        packet: Packet,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            authorize(ctx, connection)?;
            let update = expect_payload::<UserLoyaltyUpdate>(&packet)?;
            ctx.store.apply_loyalty(update)?;
            acknowledge(connection, &packet).await
        })
    }
}
