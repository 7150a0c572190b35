//! wa-crm-bridge - multi-tenant WhatsApp ↔ GoHighLevel connector core
//!
//! Resolves WhatsApp contact identifiers to phone numbers, classifies and
//! deduplicates session events, suppresses echoes of our own sends, drips
//! outbound messages per tenant and runs the per-tenant connection state
//! machine. [`service::ConnectorService`] wires it all together.

pub mod classify;
pub mod config;
pub mod crm;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod origin;
pub mod queue;
pub mod service;
pub mod session;
pub mod store;
pub mod utils;
pub mod webhook;

pub use config::Config;
pub use error::{ConnectorError, Result, SessionError};
pub use service::{ConnectorService, MessageOutcome, OutboundMessage};
