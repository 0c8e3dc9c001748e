pub mod client;
pub mod message;

pub use client::{ProtooClient, SignalEvent};
pub use message::{ProtooMessage, RequestIdAllocator};
