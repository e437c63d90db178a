//! WebSocket client protocol: frame codec and connection state machine.

pub mod client;
pub mod frame;

pub use client::{Inbound, WsClient, WsEndpoint, WsState, WEBSOCKET_SOCKET};
pub use frame::{Frame, Opcode};
