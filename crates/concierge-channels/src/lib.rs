//! Delivery adapters and the dispatch queue for concierge
//!
//! This crate provides the outbound side of the engine (webhook and log
//! delivery) and the supervised task queue that feeds inbound messages to
//! the orchestrator.

pub mod delivery;
pub mod dispatch;

pub use delivery::{LogDelivery, WebhookDelivery};
pub use dispatch::{DispatchQueue, DispatchStats, Dispatcher, MessageProcessor};
