//! Game module
//!
//! Game state the sync protocol carries:
//! - Characters (runtime state and skills)
//! - The game-state store handlers write to
//! - Delta synchronization of character state to clients

pub mod character;
pub mod store;
pub mod sync;

pub use character::{CharacterSkills, CharacterState, Skill, SkillValue};
pub use store::{GameStateStore, InMemoryGameStore};
