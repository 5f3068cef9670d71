//! Character synchronization module
//!
//! Handles synchronization of character state between server and clients.
//! This includes:
//! - Dirty-mask deltas over trackable snapshots
//! - Field bit assignments for character state
//! - Per-receiver baselines and the periodic delta push

pub mod character_sync;
pub mod delta;
pub mod update_flags;

pub use character_sync::{CharacterSyncManager, DeltaTracker, SnapshotCache, SyncReport};
pub use delta::{apply, diff, EntityDelta, FieldValue, Trackable};
pub use update_flags::StateFields;
