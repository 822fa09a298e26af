//! # parley-core
//!
//! Shared vocabulary for the Parley session and plugin-event broker.
//!
//! - **Branded IDs**: [`ConnectionId`], [`SessionId`], [`InstanceId`]
//! - **Envelope**: [`Inbound`] and [`Outbound`] WebSocket messages
//! - **Provider seam**: [`CompletionProvider`] streaming [`ProviderEvent`]s
//! - **State seam**: [`StateStore`] for keyed JSON blobs
//! - **Logging**: [`logging::init_subscriber`]

#![deny(unsafe_code)]

pub mod envelope;
pub mod ids;
pub mod logging;
pub mod provider;
pub mod state;

pub use envelope::{EnvelopeError, Inbound, Notification, Outbound, Priority};
pub use ids::{ConnectionId, InstanceId, SessionId};
pub use provider::{
    CompletionProvider, ProviderError, ProviderEvent, ProviderEventStream, QueryOptions, ToolSpec,
};
pub use state::{MemoryStateStore, StateError, StateStore};
