//! `instapay-events` — event-sourcing mechanics shared by domain crates and infra.
//!
//! Nothing in here knows about payments: it defines what an event, a command,
//! an envelope and a routing destination look like.

pub mod command;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod projection;
pub mod route;

pub use command::Command;
pub use envelope::EventEnvelope;
pub use event::Event;
pub use handler::execute;
pub use projection::Projection;
pub use route::{Destination, Routable};
