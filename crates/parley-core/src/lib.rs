//! Core types, config, errors, and transcript stores for Parley.

pub mod config;
pub mod error;
pub mod session;
pub mod session_store;
pub mod types;
