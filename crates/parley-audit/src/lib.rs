//! # parley-audit
//!
//! Append-only audit trail. Each plugin execution produces one
//! [`ExecutionLogEntry`], written as one JSON line to the subject's file.
//! Entries are never rewritten.

#![deny(unsafe_code)]

pub mod entry;
pub mod errors;
pub mod writer;

pub use entry::ExecutionLogEntry;
pub use errors::{AuditError, Result};
pub use writer::{AuditLogWriter, Partition};
