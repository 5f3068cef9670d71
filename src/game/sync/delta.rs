//! Dirty-mask deltas
//!
//! A delta carries one entity's changed fields: bit `i` of the mask means field
//! `i` changed, and `values` holds the new values in ascending field order.
//! `mask.count_ones() == values.len()` holds for every delta produced here and
//! is checked before any delta is applied.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GameError;

/// Largest number of fields a tracked entity may expose (one mask bit each)
pub const MAX_TRACKED_FIELDS: usize = 64;

/// New value of a single skill carried in a skills delta
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillUpdate {
    pub index: u8,
    pub level: i32,
    pub experience: f64,
}

/// Value of one tracked field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Int(i32),
    Float(f64),
    Bool(bool),
    Text(String),
    Skill(SkillUpdate),
}

impl FieldValue {
    pub fn kind(&self) -> &'static str {
        match self {
            FieldValue::Int(_) => "int",
            FieldValue::Float(_) => "float",
            FieldValue::Bool(_) => "bool",
            FieldValue::Text(_) => "text",
            FieldValue::Skill(_) => "skill",
        }
    }
}

/// An entity whose fields can be diffed and patched by index
pub trait Trackable: Default + Clone + PartialEq {
    /// Number of fields; must not exceed [`MAX_TRACKED_FIELDS`]
    const FIELD_COUNT: usize;

    /// Current value of field `index`
    fn field(&self, index: usize) -> Option<FieldValue>;

    /// Overwrite field `index`
    fn set_field(&mut self, index: usize, value: FieldValue) -> Result<(), GameError>;
}

/// Changed fields of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDelta {
    pub entity_id: Uuid,
    pub mask: u64,
    pub values: Vec<FieldValue>,
}

impl EntityDelta {
    /// Whether the mask and value list agree
    pub fn is_consistent(&self) -> bool {
        self.mask.count_ones() as usize == self.values.len()
    }

    /// Field indices marked in the mask, ascending
    pub fn changed_fields(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_TRACKED_FIELDS).filter(move |bit| self.mask & (1u64 << bit) != 0)
    }

    /// Pairs of (field index, new value) in application order
    pub fn entries(&self) -> impl Iterator<Item = (usize, &FieldValue)> + '_ {
        self.changed_fields().zip(self.values.iter())
    }
}

/// Build the delta that turns `previous` into `current`
///
/// A missing `previous` is diffed against `T::default()`, which is also what a
/// receiver without a snapshot seeds from. Returns `None` when nothing changed.
pub fn diff<T: Trackable>(entity_id: Uuid, previous: Option<&T>, current: &T) -> Option<EntityDelta> {
    let default_snapshot;
    let previous = match previous {
        Some(previous) => previous,
        None => {
            default_snapshot = T::default();
            &default_snapshot
        }
    };

    let mut mask = 0u64;
    let mut values = Vec::new();

    for index in 0..T::FIELD_COUNT.min(MAX_TRACKED_FIELDS) {
        let new_value = current.field(index);
        if new_value != previous.field(index) {
            if let Some(value) = new_value {
                mask |= 1u64 << index;
                values.push(value);
            }
        }
    }

    if mask == 0 {
        return None;
    }

    Some(EntityDelta {
        entity_id,
        mask,
        values,
    })
}

/// Apply a delta to a snapshot, returning whether any field actually changed
///
/// Fields are overwritten only when the value differs, so applying the same
/// delta again is a no-op.
pub fn apply<T: Trackable>(snapshot: &mut T, delta: &EntityDelta) -> Result<bool, GameError> {
    if !delta.is_consistent() {
        return Err(GameError::DeltaLengthMismatch {
            mask_bits: delta.mask.count_ones() as usize,
            values: delta.values.len(),
        });
    }

    if let Some(index) = delta.changed_fields().find(|&index| index >= T::FIELD_COUNT) {
        return Err(GameError::InvalidField {
            index,
            count: T::FIELD_COUNT,
        });
    }

    // Validate every value before touching the snapshot
    let mut patched = snapshot.clone();
    let mut changed = false;
    for (index, value) in delta.entries() {
        if patched.field(index).as_ref() != Some(value) {
            patched.set_field(index, value.clone())?;
            changed = true;
        }
    }

    if changed {
        *snapshot = patched;
    }
    Ok(changed)
}
