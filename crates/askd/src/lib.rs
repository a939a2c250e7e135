//! askd library.
//!
//! Core components for the command-line assistant daemon: query composition,
//! history persistence, credential resolution, session management, the bus
//! endpoints and the audit log.

pub mod audit;
pub mod backend;
pub mod chat;
pub mod client;
pub mod compose;
pub mod config;
pub mod credentials;
pub mod daemon;
pub mod error;
pub mod history;
pub mod policy;
pub mod session;
