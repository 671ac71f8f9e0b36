mod barrier;
mod bridge;
mod delete;
mod heap;
mod phase;
pub mod rc;
mod settings;
pub mod space;
mod stats;
mod sync;
mod system;
mod zct;

pub use barrier::{AtomicStore, StoreDelegate};
pub use heap::*;
pub use phase::{CollectionPhase, CycleInput, ReferenceKind};
pub use settings::{
    BridgePolicy, DeleteStrategy, HeapSettings, InitialCount, NonHeapPolicy,
    SettingsError,
};
pub use space::{Space, SpaceKind, SpaceUsage};
pub use stats::{CollectionStats, CycleStats};
pub use sync::{GcSnapshot, GcState, HandOver, SenseBarrier, SyncState};
pub use system::OS_PAGE_SIZE;
pub use zct::EntryState;
