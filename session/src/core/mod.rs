//! Deterministic, pure logic for the session protocol.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod envelope;
pub mod input_request;
pub mod invariants;
pub mod lifecycle;
pub mod message;
pub mod pm;
pub mod session;
pub mod stage;
pub mod transcript;
pub mod types;
