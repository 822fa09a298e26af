//! Conversation sessions and their registry.

pub mod manager;
pub mod session;

pub use manager::SessionManager;
pub use session::{Session, TurnSummary};
