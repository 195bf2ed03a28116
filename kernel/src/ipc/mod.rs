//! Inter-process communication
//!
//! Synchronous, rendezvous-based message passing with capability transfer.

pub mod endpoint;
pub mod message;
pub mod rendezvous;


pub use endpoint::{Endpoint, EndpointPtr};
pub use message::{MessageInput, MESSAGE_MAX_DESCRIPTORS, MESSAGE_MAX_SIZE};
pub use rendezvous::ReceiveOutcome;
