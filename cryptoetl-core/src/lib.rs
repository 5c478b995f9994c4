//! cryptoetl core: domain types, extraction, staging, and the loader.
//!
//! - Domain types (series keys, canonical rows, load batches)
//! - CryptoCompare extraction with retry and a circuit breaker
//! - Transformation into canonical rows and atomic batch staging files
//! - The loader state machine: validate, back up, dry run, commit, roll back
//! - Target stores (Postgres and in-memory) and audit sinks

pub mod data;
pub mod domain;
pub mod fsio;
pub mod load;
