//! Tabula Audit - bounded audit logging for the plugin host.
//!
//! This crate provides:
//! - [`AuditEvent`] records for every security decision the host makes
//! - [`AuditLog`], a ring buffer bounded by count and by age
//! - Filtered queries and JSON-lines export
//!
//! Recording is synchronous, in-memory, and infallible from the caller's
//! point of view: a failure to record never fails the operation that
//! produced the event.
//!
//! # Example
//!
//! ```
//! use tabula_audit::{AuditEvent, AuditEventKind, AuditFilter, AuditLog, Severity};
//!
//! let log = AuditLog::default();
//! log.record(
//!     AuditEvent::new("geo", AuditEventKind::PermissionCheck)
//!         .with_resource("network")
//!         .with_severity(Severity::Low),
//! );
//!
//! let events = log.query(&AuditFilter::for_plugin("geo"));
//! assert_eq!(events.len(), 1);
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod error;
mod event;
mod log;

pub use error::{AuditError, AuditResult};
pub use event::{AuditEvent, AuditEventKind, Severity};
pub use log::{AuditFilter, AuditLog, DEFAULT_CAPACITY, DEFAULT_MAX_AGE_DAYS};
