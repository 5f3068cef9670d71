//! Character state store
//!
//! The game-state repository the packet handlers read and write. The
//! relational store lives outside this crate; [`InMemoryGameStore`] keeps
//! the same contract in memory for development and tests.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::error::{GameError, Result};
use crate::game::character::{CharacterSkills, CharacterState};
use crate::protocol::messages::{UserLoyaltyUpdate, UserSessionStats};

/// Accumulated loyalty of one viewer
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoyaltyRecord {
    pub user_name: String,
    pub gifted_subs: i64,
    pub cheered_bits: i64,
    pub is_moderator: bool,
    pub is_subscriber: bool,
    pub is_vip: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Read/write access to character and user state
pub trait GameStateStore: Send + Sync {
    /// Owner of a character, if the character is known
    fn character_owner(&self, character_id: Uuid) -> Option<Uuid>;

    /// Characters owned by a user
    fn characters_of(&self, user_id: Uuid) -> Vec<Uuid>;

    fn character_state(&self, character_id: Uuid) -> Option<CharacterState>;

    fn character_skills(&self, character_id: Uuid) -> Option<CharacterSkills>;

    /// Replace a character's runtime state; fails if another user owns it
    fn store_character_state(&self, user_id: Uuid, character_id: Uuid, state: CharacterState) -> Result<()>;

    /// Replace a character's skills; fails if another user owns it
    fn store_character_skills(&self, user_id: Uuid, character_id: Uuid, skills: CharacterSkills) -> Result<()>;

    fn record_session_stats(&self, user_id: Uuid, stats: UserSessionStats) -> Result<()>;

    fn apply_loyalty(&self, update: &UserLoyaltyUpdate) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
struct CharacterRecord {
    owner: Uuid,
    state: Option<CharacterState>,
    skills: Option<CharacterSkills>,
}

/// Thread-safe in-memory store
#[derive(Debug, Default)]
pub struct InMemoryGameStore {
    characters: DashMap<Uuid, CharacterRecord>,
    session_stats: DashMap<Uuid, UserSessionStats>,
    loyalty: DashMap<Uuid, LoyaltyRecord>,
}

impl InMemoryGameStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a character for a user without any state yet
    pub fn insert_character(&self, user_id: Uuid, character_id: Uuid) {
        self.characters.entry(character_id).or_insert_with(|| CharacterRecord {
            owner: user_id,
            ..Default::default()
        });
    }

    pub fn session_stats(&self, user_id: Uuid) -> Option<UserSessionStats> {
        self.session_stats.get(&user_id).map(|s| s.clone())
    }

    pub fn loyalty(&self, user_id: Uuid) -> Option<LoyaltyRecord> {
        self.loyalty.get(&user_id).map(|r| r.clone())
    }

    fn with_owned_record<F>(&self, user_id: Uuid, character_id: Uuid, update: F) -> Result<()>
    where
        F: FnOnce(&mut CharacterRecord),
    {
        let mut record = self.characters.entry(character_id).or_insert_with(|| {
            debug!(user_id = %user_id, character_id = %character_id, "Character registered");
            CharacterRecord {
                owner: user_id,
                ..Default::default()
            }
        });
        if record.owner != user_id {
            return Err(GameError::CharacterNotOwned { character_id, user_id }.into());
        }
        update(&mut *record);
        Ok(())
    }
}

impl GameStateStore for InMemoryGameStore {
    fn character_owner(&self, character_id: Uuid) -> Option<Uuid> {
        self.characters.get(&character_id).map(|r| r.owner)
    }

    fn characters_of(&self, user_id: Uuid) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .characters
            .iter()
            .filter(|entry| entry.owner == user_id)
            .map(|entry| *entry.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    fn character_state(&self, character_id: Uuid) -> Option<CharacterState> {
        self.characters.get(&character_id).and_then(|r| r.state.clone())
    }

    fn character_skills(&self, character_id: Uuid) -> Option<CharacterSkills> {
        self.characters.get(&character_id).and_then(|r| r.skills.clone())
    }

    fn store_character_state(&self, user_id: Uuid, character_id: Uuid, state: CharacterState) -> Result<()> {
        self.with_owned_record(user_id, character_id, |record| record.state = Some(state))
    }

    fn store_character_skills(&self, user_id: Uuid, character_id: Uuid, skills: CharacterSkills) -> Result<()> {
        self.with_owned_record(user_id, character_id, |record| record.skills = Some(skills))
    }

    fn record_session_stats(&self, user_id: Uuid, stats: UserSessionStats) -> Result<()> {
        self.session_stats.insert(user_id, stats);
        Ok(())
    }

    fn apply_loyalty(&self, update: &UserLoyaltyUpdate) -> Result<()> {
        let mut record = self.loyalty.entry(update.user_id).or_default();
        record.user_name = update.user_name.clone();
        record.gifted_subs += i64::from(update.new_gifted_subs);
        record.cheered_bits += i64::from(update.new_cheered_bits);
        record.is_moderator = update.is_moderator;
        record.is_subscriber = update.is_subscriber;
        record.is_vip = update.is_vip;
        record.updated_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_state_is_scoped_to_owner() {
        let store = InMemoryGameStore::new();
        let (alice, bob, character) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let mut state = CharacterState::default();
        state.health = 42;
        store.store_character_state(alice, character, state.clone()).unwrap();

        assert_eq!(store.character_owner(character), Some(alice));
        assert_eq!(store.character_state(character), Some(state));
        assert_eq!(store.characters_of(alice), vec![character]);

        let err = store
            .store_character_state(bob, character, CharacterState::default())
            .unwrap_err();
        assert!(matches!(err, SyncError::Game(GameError::CharacterNotOwned { .. })));
        assert_eq!(store.character_state(character).unwrap().health, 42);
    }

    #[test]
    fn test_insert_character_without_state() {
        let store = InMemoryGameStore::new();
        let (user, character) = (Uuid::new_v4(), Uuid::new_v4());
        store.insert_character(user, character);

        assert_eq!(store.character_owner(character), Some(user));
        assert!(store.character_state(character).is_none());
        assert!(store.character_skills(character).is_none());
    }

    #[test]
    fn test_loyalty_accumulates() {
        let store = InMemoryGameStore::new();
        let mut update = UserLoyaltyUpdate {
            user_id: Uuid::new_v4(),
            user_name: "viewer".to_string(),
            platform: "twitch".to_string(),
            platform_id: "42".to_string(),
            new_gifted_subs: 2,
            new_cheered_bits: 100,
            is_moderator: false,
            is_subscriber: true,
            is_vip: false,
        };
        store.apply_loyalty(&update).unwrap();
        update.new_gifted_subs = 1;
        update.new_cheered_bits = 50;
        update.is_vip = true;
        store.apply_loyalty(&update).unwrap();

        let record = store.loyalty(update.user_id).unwrap();
        assert_eq!(record.gifted_subs, 3);
        assert_eq!(record.cheered_bits, 150);
        assert!(record.is_vip);
    }
}
