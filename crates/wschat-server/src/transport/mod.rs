//! Socket-facing side of the server.

pub mod websocket;

pub use websocket::{serve, ConnectionSettings};
