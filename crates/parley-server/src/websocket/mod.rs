//! `WebSocket` connection management, heartbeat and per-client session loop.

pub mod connection;
pub mod heartbeat;
pub mod registry;
pub mod session;

pub use connection::ClientConnection;
pub use registry::ConnectionRegistry;
