//! Prelude module - commonly used types for convenient import.
//!
//! Use `use tabula_audit::prelude::*;` to import all essential types.

// Errors
pub use crate::{AuditError, AuditResult};

// Events
pub use crate::{AuditEvent, AuditEventKind, Severity};

// Log
pub use crate::{AuditFilter, AuditLog};
