//! wschat-core: Shared protocol library for the wschat server.
//!
//! Provides the RFC 6455 frame codec, the opening handshake, and the chat
//! envelope types carried inside text frames. No I/O happens here.

pub mod error;
pub mod frame;
pub mod handshake;
pub mod messages;

// Re-export commonly used items at crate root.
pub use error::{ChatError, ChatResult};
pub use frame::{decode, encode, encode_masked, Frame, FrameDecoder, Message, OpCode, Reassembler, Role};
pub use handshake::{accept_key, UpgradeRequest};
pub use messages::{Envelope, ServerMessage};
