//! Concrete implementations of the core seams used by the binary.

pub mod command;
pub mod file_state_store;

pub use command::CommandProvider;
pub use file_state_store::FileStateStore;
