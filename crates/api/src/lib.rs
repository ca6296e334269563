//! Settlement server: command channels, event channels and the query API,
//! plus the bank-side agent that drives the handshake.

pub mod app;
pub mod config;
pub mod context;
pub mod middleware;
pub mod peer;
pub mod protocol;
