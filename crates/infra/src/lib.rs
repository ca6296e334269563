//! Infrastructure layer: event store, outbox, stream broker, consumers,
//! projections and the account/key registry.

pub mod broker;
pub mod command_dispatcher;
pub mod consumer;
pub mod event_store;
pub mod outbox;
pub mod projections;
pub mod read_model;
pub mod registry;
pub mod workers;

#[cfg(test)]
mod integration_tests;
