pub mod client;
pub mod frame;
pub mod handshake;
pub mod session;

pub use client::WsClientConfig;
pub use frame::{Frame, FrameDecoder, Opcode};
pub use session::{Role, WsEvent, WsHandle};
