//! Shared plumbing for the guest agent executables
//!
//! This crate holds the pieces both binaries need:
//! - Metadata service client with ETag long-poll semantics
//! - Instance config file reader (INI, case-insensitive)
//! - Serial port publisher for one-line JSON messages
//! - Persistent key store for "last applied" state
//! - Script download / staging / execution

pub mod config;
pub mod dedup;
pub mod metadata;
pub mod script;
pub mod serial;
pub mod store;
