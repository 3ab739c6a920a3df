//! Shared building blocks for the notification relay: configuration,
//! the common error type, domain types and the Postgres pool helper.

pub mod config;
pub mod db;
pub mod error;
pub mod types;
