//! Character synchronization manager
//!
//! Sender side: [`DeltaTracker`] remembers the last snapshot each receiver
//! accepted and builds dirty-mask deltas against it every sync tick.
//! Receiver side: [`SnapshotCache`] applies deltas, in the order received, to
//! its cached snapshots.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::GameError;
use crate::game::character::{CharacterSkills, CharacterState};
use crate::game::store::GameStateStore;
use crate::game::sync::delta::{apply, diff, EntityDelta, Trackable};
use crate::net::connection::Connection;
use crate::protocol::dispatch::{UPDATE_CHARACTER_SKILLS, UPDATE_CHARACTER_STATE};
use crate::protocol::messages::{CharacterSkillsDelta, CharacterStateDelta};

/// Deltas produced in one tick, with the snapshots that become baselines once sent
#[derive(Debug)]
pub struct DeltaBatch<T> {
    pub deltas: Vec<EntityDelta>,
    snapshots: Vec<(Uuid, T)>,
}

impl<T: Trackable> DeltaBatch<T> {
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    /// Split into the deltas to send and the snapshots to acknowledge
    pub fn into_parts(self) -> (Vec<EntityDelta>, Vec<(Uuid, T)>) {
        (self.deltas, self.snapshots)
    }
}

/// Last acknowledged snapshot per entity
#[derive(Debug)]
pub struct DeltaTracker<T> {
    baselines: RwLock<HashMap<Uuid, T>>,
}

impl<T: Trackable> DeltaTracker<T> {
    pub fn new() -> Self {
        Self {
            baselines: RwLock::new(HashMap::new()),
        }
    }

    /// Delta from the acknowledged baseline to `current`
    pub fn diff(&self, entity_id: Uuid, current: &T) -> Option<EntityDelta> {
        diff(entity_id, self.baselines.read().get(&entity_id), current)
    }

    /// Build one batch; unchanged entities are left out
    pub fn collect<I>(&self, entities: I) -> DeltaBatch<T>
    where
        I: IntoIterator<Item = (Uuid, T)>,
    {
        let baselines = self.baselines.read();
        let mut batch = DeltaBatch {
            deltas: Vec::new(),
            snapshots: Vec::new(),
        };
        for (entity_id, current) in entities {
            if let Some(delta) = diff(entity_id, baselines.get(&entity_id), &current) {
                batch.deltas.push(delta);
                batch.snapshots.push((entity_id, current));
            }
        }
        batch
    }

    /// Record snapshots the receiver now holds
    pub fn acknowledge<I>(&self, snapshots: I)
    where
        I: IntoIterator<Item = (Uuid, T)>,
    {
        let mut baselines = self.baselines.write();
        for (entity_id, snapshot) in snapshots {
            baselines.insert(entity_id, snapshot);
        }
    }

    /// Drop the baseline; the next diff resends every non-default field
    pub fn forget(&self, entity_id: Uuid) {
        self.baselines.write().remove(&entity_id);
    }

    pub fn tracked(&self) -> usize {
        self.baselines.read().len()
    }
}

impl<T: Trackable> Default for DeltaTracker<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver-side snapshots
#[derive(Debug, Default)]
pub struct SnapshotCache<T> {
    snapshots: HashMap<Uuid, T>,
}

impl<T: Trackable> SnapshotCache<T> {
    pub fn new() -> Self {
        Self {
            snapshots: HashMap::new(),
        }
    }

    pub fn get(&self, entity_id: Uuid) -> Option<&T> {
        self.snapshots.get(&entity_id)
    }

    pub fn insert(&mut self, entity_id: Uuid, snapshot: T) {
        self.snapshots.insert(entity_id, snapshot);
    }

    /// Apply one delta; an unknown entity is seeded from defaults
    pub fn apply(&mut self, delta: &EntityDelta) -> Result<bool, GameError> {
        let snapshot = self.snapshots.entry(delta.entity_id).or_default();
        apply(snapshot, delta)
    }

    /// Apply deltas in order, returning how many changed something
    pub fn apply_all<'a, I>(&mut self, deltas: I) -> Result<usize, GameError>
    where
        I: IntoIterator<Item = &'a EntityDelta>,
    {
        let mut changed = 0;
        for delta in deltas {
            if self.apply(delta)? {
                changed += 1;
            }
        }
        Ok(changed)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

/// What one sync pass sent to a connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub state_deltas: usize,
    pub skill_deltas: usize,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.state_deltas == 0 && self.skill_deltas == 0
    }
}

/// Pushes changed character state and skills to game clients
#[derive(Debug, Default)]
pub struct CharacterSyncManager {
    states: DeltaTracker<CharacterState>,
    skills: DeltaTracker<CharacterSkills>,
}

impl CharacterSyncManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn states(&self) -> &DeltaTracker<CharacterState> {
        &self.states
    }

    pub fn skills(&self) -> &DeltaTracker<CharacterSkills> {
        &self.skills
    }

    /// Mark snapshots received from a client as known to it
    pub fn acknowledge_state(&self, character_id: Uuid, state: CharacterState) {
        self.states.acknowledge([(character_id, state)]);
    }

    pub fn acknowledge_skills(&self, character_id: Uuid, skills: CharacterSkills) {
        self.skills.acknowledge([(character_id, skills)]);
    }

    /// Push deltas for every character of `user_id` over `connection`
    ///
    /// Baselines advance only for batches the connection accepted.
    pub fn sync_user(&self, connection: &Connection, store: &dyn GameStateStore, user_id: Uuid) -> SyncReport {
        let characters = store.characters_of(user_id);
        let mut report = SyncReport::default();

        let states = self.states.collect(
            characters
                .iter()
                .filter_map(|&id| store.character_state(id).map(|state| (id, state))),
        );
        if !states.is_empty() {
            let (deltas, snapshots) = states.into_parts();
            let count = deltas.len();
            if connection.push(UPDATE_CHARACTER_STATE, CharacterStateDelta { deltas }) {
                self.states.acknowledge(snapshots);
                report.state_deltas = count;
            }
        }

        let skills = self.skills.collect(
            characters
                .iter()
                .filter_map(|&id| store.character_skills(id).map(|skills| (id, skills))),
        );
        if !skills.is_empty() {
            let (deltas, snapshots) = skills.into_parts();
            let count = deltas.len();
            if connection.push(UPDATE_CHARACTER_SKILLS, CharacterSkillsDelta { deltas }) {
                self.skills.acknowledge(snapshots);
                report.skill_deltas = count;
            }
        }

        if !report.is_empty() {
            trace!(
                connection_id = connection.id(),
                user_id = %user_id,
                state_deltas = report.state_deltas,
                skill_deltas = report.skill_deltas,
                "Pushed character deltas"
            );
        }
        report
    }

    /// Forget every baseline of a user's characters
    pub fn forget_user(&self, store: &dyn GameStateStore, user_id: Uuid) {
        let characters = store.characters_of(user_id);
        for &character_id in &characters {
            self.states.forget(character_id);
            self.skills.forget(character_id);
        }
        debug!(user_id = %user_id, characters = characters.len(), "Sync baselines dropped");
    }
}
