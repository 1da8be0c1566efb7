// src/messaging/mod.rs
// Order-side messaging: the message catalog and the service that speaks it.

pub mod pending;
pub mod service;
pub mod types;

pub use pending::{PendingRequests, PendingResponse};
pub use service::{MessagingService, DEFAULT_RPC_TIMEOUT};
pub use types::*;
