//! Library root for the `avsig` crate
//!
//! Signed distribution of a malware-signature catalog plus the refresh-token
//! core used by its administrative API.

// Core error handling
pub mod errors;

// Catalog data and canonical encoding
pub mod model;
pub mod record_encoder;

// Keys and signing
pub mod keys;
pub mod signer;

// Persistence
pub mod store;
pub mod store_sled;

// Audit trail
pub mod audit;

// Catalog, manifest and verification
pub mod catalog;
pub mod manifest;
pub mod sweep;

// Tokens
pub mod tokens;

// Configuration, wiring & CLI
pub mod app_state;
pub mod cli;
pub mod config;
pub mod logging;

pub use errors::{AvError, AvResult, TokenRejection};
