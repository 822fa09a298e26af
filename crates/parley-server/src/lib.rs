//! # parley-server
//!
//! Axum HTTP + `WebSocket` front end of the Parley broker.
//!
//! - `WebSocket` gateway: connection registry, heartbeat, envelope routing
//! - Conversation sessions: one serialized provider call at a time, output
//!   fanned out to every subscriber
//! - Plugin host: the four registries, event dispatch, UI state fan-out
//! - HTTP endpoints: health check, Prometheus scrape, plugin and audit-log
//!   introspection, event ingress, instance and UI state administration
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod api;
pub mod config;
pub mod conversation;
pub mod errors;
pub mod gateway;
pub mod health;
pub mod metrics;
pub mod plugins;
pub mod server;
pub mod shutdown;
pub mod snapshot;
pub mod websocket;

pub use config::ServerConfig;
pub use conversation::{Session, SessionManager, TurnSummary};
pub use errors::{ApiError, GatewayError};
pub use gateway::Gateway;
pub use plugins::{DispatchSettings, PluginHost};
pub use server::{AppState, ParleyServer};
pub use shutdown::ShutdownCoordinator;
pub use snapshot::{RecentActivitySnapshot, SnapshotSource, StaticSnapshot};
pub use websocket::{ClientConnection, ConnectionRegistry};
