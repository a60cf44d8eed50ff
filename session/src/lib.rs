//! Iteration session protocol for a staged, agent-driven pipeline.
//!
//! A session tracks one iteration of the pipeline (`idea → … → delivery`)
//! while the execution engine streams progress envelopes at it. The crate is
//! split the same way the protocol is:
//!
//! - **[`core`]**: Pure, deterministic logic (transcript folding, lifecycle
//!   transitions, the input-request handshake, post-delivery chat). No I/O and
//!   no clock reads; every function that stamps time takes it as a parameter.
//! - **[`io`]**: Seams to external collaborators (execution engine, project
//!   store, configuration, envelope logs).
//!
//! Orchestration modules ([`actor`], [`controller`], [`replay`]) wire core
//! state to the collaborators: one actor per session mutates state serially,
//! and the controller routes envelopes and enforces project-wide rules.

pub mod actor;
pub mod controller;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod replay;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
