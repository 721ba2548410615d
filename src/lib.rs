//! shuttle
//!
//! Protocol workers, the launcher daemon that starts and pools them, and the
//! job engine applications use to drive them.

pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod job;
pub mod launcher;
pub mod logger;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod spawner;
pub mod worker;
