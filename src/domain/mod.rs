//! Domain module
//!
//! Execution context, coordinator errors and input validation.

pub mod context;
pub mod error;
pub mod validate;

pub use context::OperationContext;
pub use error::LedgerError;
pub use validate::{FieldViolation, ValidationError, Violations};
