//! Local persistence and long-term memory for a chat assistant.
//!
//! Three pieces, leaves first: a journaled, self-healing [`store::StorageEngine`]
//! over a single SQLite file, a sliding-window [`rate_limit::RateLimiter`]
//! guarding write-class operations, and a [`memory::MemoryManager`] that turns
//! chat text into durable facts and facts back into a bounded prompt summary.
//! [`subsystem::MemorySubsystem`] wires them together behind the
//! [`interfaces::ConversationMemory`] seam consumed by the streaming client.

pub mod config;
pub mod error;
pub mod interfaces;
pub mod logging;
pub mod memory;
pub mod rate_limit;
pub mod runtime_paths;
pub mod store;
pub mod subsystem;

pub use error::EmberError;

pub type Result<T> = std::result::Result<T, EmberError>;
