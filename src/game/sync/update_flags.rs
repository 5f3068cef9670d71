//! Update flags for character state synchronization
//!
//! Named bits of the character-state dirty mask. Bit positions are the field
//! indices of [`CharacterState`](crate::game::character::CharacterState) and
//! must not be reordered once clients depend on them.

use bitflags::bitflags;

bitflags! {
    /// Flags indicating which character state fields changed
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StateFields: u64 {
        /// No updates needed
        const NONE = 0;
        /// Current health
        const HEALTH = 1 << 0;
        /// Island the character is on (empty while sailing)
        const ISLAND = 1 << 1;
        /// Current task (fighting, woodcutting, ...)
        const TASK = 1 << 2;
        /// Task target
        const TASK_ARGUMENT = 1 << 3;
        const X = 1 << 4;
        const Y = 1 << 5;
        const Z = 1 << 6;
        const IN_RAID = 1 << 7;
        const IN_ARENA = 1 << 8;
        const IN_DUNGEON = 1 << 9;
        const IN_ONSEN = 1 << 10;
        /// Experience rate estimate for the current task
        const EXP_PER_HOUR = 1 << 11;
        /// Map position
        const POSITION = Self::X.bits() | Self::Y.bits() | Self::Z.bits();
    }
}

impl Default for StateFields {
    fn default() -> Self {
        Self::NONE
    }
}

impl StateFields {
    /// Number of tracked state fields
    pub const COUNT: usize = 12;

    /// Interpret a wire mask, dropping unknown bits
    pub fn from_mask(mask: u64) -> Self {
        Self::from_bits_truncate(mask)
    }

    /// Flag for a single field index
    pub fn of(index: usize) -> Self {
        if index >= Self::COUNT {
            return Self::NONE;
        }
        Self::from_bits_truncate(1u64 << index)
    }

    /// Check if any updates are flagged
    pub fn has_update(&self) -> bool {
        !self.is_empty()
    }

    /// Check if the position moved
    pub fn moved(&self) -> bool {
        self.intersects(Self::POSITION)
    }

    /// Clear all flags
    pub fn clear(&mut self) {
        *self = Self::NONE;
    }

    /// Get the wire mask
    pub fn to_mask(&self) -> u64 {
        self.bits()
    }
}
