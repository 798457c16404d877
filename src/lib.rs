//! Inbox synchronization for CRM lead conversations.
//!
//! Messages arrive from a periodic store poll, a real-time push stream and a
//! device-local read cache. The crate merges them into one duplicate-free,
//! threaded inbox with monotonic read state.

pub mod actor;
pub mod cache;
pub mod config;
pub mod constants;
pub mod message;
#[cfg(feature = "notifications")]
pub mod notification;
pub mod replay;
pub mod store;
pub mod sync;
pub mod view;
