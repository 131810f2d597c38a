//! frame-relay: a fixed-frame TCP message relay
//!
//! The server accepts many concurrent clients and handles two message kinds:
//! - Broadcast (type 77): forwarded to every other connected client
//! - Reverse (type 201): payload reversed and echoed to the sender only
//!
//! An operator console on the server shows the last received message and
//! the connected clients. The `relay-client` binary is a terminal front end
//! that sends frames and prints whatever the server returns.

pub mod cache;
pub mod client;
pub mod config;
pub mod console;
pub mod dispatch;
pub mod frame;
pub mod handler;
pub mod registry;
pub mod server;
