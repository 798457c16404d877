pub mod projector;

pub use projector::{InboxSnapshot, ThreadSummary};
