//! Collaborator seams: the execution engine, the iteration store, config and
//! envelope logs.

pub mod clock;
pub mod config;
pub mod engine;
pub mod envelope_log;
pub mod store;
