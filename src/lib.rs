//! simple_bank Library
//!
//! Ledger service core: transactional transfers over a relational store and
//! a durable background task queue for side effects.

pub mod api;
pub mod config;
pub mod db;
pub mod domain;
pub mod jobs;
pub mod ledger;
pub mod mail;
pub mod store;
pub mod telemetry;
pub mod worker;

mod error;

pub use config::Config;
pub use domain::{LedgerError, OperationContext};
pub use error::{AppError, AppResult, ErrorResponse};
pub use ledger::Ledger;
