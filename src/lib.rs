//! examd: a socket server that delivers timed multiple-choice examinations
//! to authorized users and tracks each user's progress through an attempt.
//!
//! - Test definitions are line-oriented markup files ([`parser`])
//! - Per-test policy comes from a TOML configuration file ([`config`])
//! - Both are combined once at startup into a read-only [`catalog`]
//! - Attempt state lives in the [`session`] registry, the only structure
//!   mutated after startup
//! - Clients speak one JSON request/response per TCP connection
//!   ([`protocol`], [`server`])

pub mod catalog;
pub mod config;
pub mod parser;
pub mod protocol;
pub mod server;
pub mod session;
