// src/relay/mod.rs
//
// Store-and-forward of occupancy events: durable local outbox plus the
// background worker that drains it to the ingest endpoint.

pub mod delivery;
pub mod outbox;

pub use delivery::{BatchOutcome, DeliverySettings, DeliveryTransport, DeliveryWorker, HttpTransport};
pub use outbox::{Outbox, OutboxRecord};
