//! Read-state reconciliation and the single-writer sync pipeline.

pub mod actor;
pub mod engine;
pub mod events;
pub mod read_state;

pub use actor::{SyncActorHandle, SyncCommand, load_engine, spawn_sync_actor};
pub use engine::{ApplyReport, SyncEngine};
pub use events::InboundEvent;
pub use read_state::{ReadState, Reconciler};
