//! Conversation turns.
//!
//! - Assembling streamed fragments into finalized turns
//! - The per-session conversation log
//! - Fire-and-forget persistence with retries

mod accumulator;
mod log;
mod model;
mod persist;

pub use accumulator::TurnAccumulator;
pub use log::ConversationLog;
pub use model::{Fragment, Role, Turn};
pub use persist::{PersistConfig, Persister};
