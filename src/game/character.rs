//! Character snapshots
//!
//! The two entity shapes kept in sync with game clients: runtime state
//! (health, location, task) and skills. Both implement [`Trackable`] so the
//! delta layer can diff and patch them field by field.

use serde::{Deserialize, Serialize};

use crate::error::GameError;
use crate::game::sync::delta::{FieldValue, SkillUpdate, Trackable};
use crate::game::sync::update_flags::StateFields;

/// Skill IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Skill {
    Attack = 0,
    Defense = 1,
    Strength = 2,
    Health = 3,
    Woodcutting = 4,
    Fishing = 5,
    Mining = 6,
    Crafting = 7,
    Cooking = 8,
    Farming = 9,
    Slayer = 10,
    Magic = 11,
    Ranged = 12,
    Sailing = 13,
    Healing = 14,
    Gathering = 15,
    Alchemy = 16,
}

impl Skill {
    /// Total number of skills
    pub const COUNT: usize = 17;

    pub const ALL: [Skill; Skill::COUNT] = [
        Skill::Attack,
        Skill::Defense,
        Skill::Strength,
        Skill::Health,
        Skill::Woodcutting,
        Skill::Fishing,
        Skill::Mining,
        Skill::Crafting,
        Skill::Cooking,
        Skill::Farming,
        Skill::Slayer,
        Skill::Magic,
        Skill::Ranged,
        Skill::Sailing,
        Skill::Healing,
        Skill::Gathering,
        Skill::Alchemy,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Convert from a wire index
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

/// Level and experience of one skill
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkillValue {
    pub level: i32,
    pub experience: f64,
}

impl Default for SkillValue {
    fn default() -> Self {
        Self {
            level: 1,
            experience: 0.0,
        }
    }
}

/// All skills of a character
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterSkills {
    pub skills: [SkillValue; Skill::COUNT],
}

impl Default for CharacterSkills {
    fn default() -> Self {
        let mut skills = [SkillValue::default(); Skill::COUNT];
        // Health starts at level 10
        skills[Skill::Health.index()].level = 10;
        Self { skills }
    }
}

impl CharacterSkills {
    pub fn get(&self, skill: Skill) -> SkillValue {
        self.skills[skill.index()]
    }

    pub fn set(&mut self, skill: Skill, level: i32, experience: f64) {
        self.skills[skill.index()] = SkillValue { level, experience };
    }

    /// Get the total level
    pub fn total_level(&self) -> i64 {
        self.skills.iter().map(|s| i64::from(s.level)).sum()
    }
}

impl Trackable for CharacterSkills {
    const FIELD_COUNT: usize = Skill::COUNT;

    fn field(&self, index: usize) -> Option<FieldValue> {
        self.skills.get(index).map(|value| {
            FieldValue::Skill(SkillUpdate {
                index: index as u8,
                level: value.level,
                experience: value.experience,
            })
        })
    }

    fn set_field(&mut self, index: usize, value: FieldValue) -> Result<(), GameError> {
        let slot = self.skills.get_mut(index).ok_or(GameError::InvalidField {
            index,
            count: Skill::COUNT,
        })?;
        match value {
            FieldValue::Skill(update) if usize::from(update.index) == index => {
                *slot = SkillValue {
                    level: update.level,
                    experience: update.experience,
                };
                Ok(())
            }
            _ => Err(GameError::FieldTypeMismatch {
                index,
                expected: "skill",
            }),
        }
    }
}

/// Runtime state of a character
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterState {
    pub health: i32,
    pub island: String,
    pub task: String,
    pub task_argument: String,
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub in_raid: bool,
    pub in_arena: bool,
    pub in_dungeon: bool,
    pub in_onsen: bool,
    pub exp_per_hour: f64,
}

impl Default for CharacterState {
    fn default() -> Self {
        Self {
            health: 10,
            island: String::new(),
            task: String::new(),
            task_argument: String::new(),
            x: 0,
            y: 0,
            z: 0,
            in_raid: false,
            in_arena: false,
            in_dungeon: false,
            in_onsen: false,
            exp_per_hour: 0.0,
        }
    }
}

fn expect_int(index: usize, value: FieldValue) -> Result<i32, GameError> {
    match value {
        FieldValue::Int(v) => Ok(v),
        _ => Err(GameError::FieldTypeMismatch { index, expected: "int" }),
    }
}

fn expect_bool(index: usize, value: FieldValue) -> Result<bool, GameError> {
    match value {
        FieldValue::Bool(v) => Ok(v),
        _ => Err(GameError::FieldTypeMismatch { index, expected: "bool" }),
    }
}

fn expect_text(index: usize, value: FieldValue) -> Result<String, GameError> {
    match value {
        FieldValue::Text(v) => Ok(v),
        _ => Err(GameError::FieldTypeMismatch { index, expected: "text" }),
    }
}

impl Trackable for CharacterState {
    const FIELD_COUNT: usize = StateFields::COUNT;

    fn field(&self, index: usize) -> Option<FieldValue> {
        // Indices follow the StateFields bit positions
        let value = match index {
            0 => FieldValue::Int(self.health),
            1 => FieldValue::Text(self.island.clone()),
            2 => FieldValue::Text(self.task.clone()),
            3 => FieldValue::Text(self.task_argument.clone()),
            4 => FieldValue::Int(self.x),
            5 => FieldValue::Int(self.y),
            6 => FieldValue::Int(self.z),
            7 => FieldValue::Bool(self.in_raid),
            8 => FieldValue::Bool(self.in_arena),
            9 => FieldValue::Bool(self.in_dungeon),
            10 => FieldValue::Bool(self.in_onsen),
            11 => FieldValue::Float(self.exp_per_hour),
            _ => return None,
        };
        Some(value)
    }

    fn set_field(&mut self, index: usize, value: FieldValue) -> Result<(), GameError> {
        match index {
            0 => self.health = expect_int(index, value)?,
            1 => self.island = expect_text(index, value)?,
            2 => self.task = expect_text(index, value)?,
            3 => self.task_argument = expect_text(index, value)?,
            4 => self.x = expect_int(index, value)?,
            5 => self.y = expect_int(index, value)?,
            6 => self.z = expect_int(index, value)?,
            7 => self.in_raid = expect_bool(index, value)?,
            8 => self.in_arena = expect_bool(index, value)?,
            9 => self.in_dungeon = expect_bool(index, value)?,
            10 => self.in_onsen = expect_bool(index, value)?,
            11 => match value {
                FieldValue::Float(v) => self.exp_per_hour = v,
                _ => {
                    return Err(GameError::FieldTypeMismatch {
                        index,
                        expected: "float",
                    })
                }
            },
            _ => {
                return Err(GameError::InvalidField {
                    index,
                    count: StateFields::COUNT,
                })
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::sync::delta::{apply, diff};
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    #[test]
    fn test_skill_index_roundtrip() {
        for skill in Skill::ALL {
            assert_eq!(Skill::from_index(skill.index()), Some(skill));
        }
        assert_eq!(Skill::from_index(Skill::COUNT), None);
    }

    #[test]
    fn test_default_skills() {
        let skills = CharacterSkills::default();
        assert_eq!(skills.get(Skill::Health).level, 10);
        assert_eq!(skills.get(Skill::Attack).level, 1);
        assert_eq!(skills.total_level(), 16 + 10);
    }

    #[test]
    fn test_state_delta_uses_flag_bits() {
        let before = CharacterState::default();
        let mut after = before.clone();
        after.health = 42;
        after.island = "Away".to_string();
        after.y = 7;

        let delta = diff(Uuid::new_v4(), Some(&before), &after).unwrap();
        assert_eq!(
            StateFields::from_mask(delta.mask),
            StateFields::HEALTH | StateFields::ISLAND | StateFields::Y
        );
        assert_eq!(
            delta.values,
            vec![
                FieldValue::Int(42),
                FieldValue::Text("Away".to_string()),
                FieldValue::Int(7)
            ]
        );
    }

    #[test]
    fn test_skills_delta_carries_index_level_experience() {
        let before = CharacterSkills::default();
        let mut after = before.clone();
        after.set(Skill::Woodcutting, 12, 1650.25);

        let delta = diff(Uuid::new_v4(), Some(&before), &after).unwrap();
        assert_eq!(delta.mask, 1 << Skill::Woodcutting.index());
        assert_eq!(
            delta.values,
            vec![FieldValue::Skill(SkillUpdate {
                index: 4,
                level: 12,
                experience: 1650.25
            })]
        );

        let mut receiver = before;
        assert!(apply(&mut receiver, &delta).unwrap());
        assert_eq!(receiver, after);
    }

    #[test]
    fn test_skill_index_must_match_slot() {
        let mut skills = CharacterSkills::default();
        let wrong_slot = FieldValue::Skill(SkillUpdate {
            index: 3,
            level: 5,
            experience: 10.0,
        });
        assert!(skills.set_field(2, wrong_slot).is_err());
    }

    #[test]
    fn test_state_field_type_mismatch() {
        let mut state = CharacterState::default();
        assert_eq!(
            state.set_field(0, FieldValue::Text("x".to_string())),
            Err(GameError::FieldTypeMismatch { index: 0, expected: "int" })
        );
        assert_eq!(
            state.set_field(12, FieldValue::Int(1)),
            Err(GameError::InvalidField { index: 12, count: 12 })
        );
    }
}
