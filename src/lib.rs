//! cairn: file backup over a length-prefixed JSON object protocol
//!
//! The server authenticates clients with a shared-secret handshake, then
//! ingests files they name: content is fetched over a side channel, written
//! under a storage directory and recorded in an SQLite catalog.

pub mod auth;
pub mod catalog;
pub mod checksum;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod ingest;
pub mod logger;
pub mod object_stream;
pub mod protocol;
pub mod protocol_core;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;
pub mod transfer;
pub mod url;

#[cfg(test)]
mod test_support;

pub use client::BackupClient;
pub use error::BackupError;
pub use object_stream::ObjectStream;
