//! wschat-server: WebSocket chat relay over raw TCP.
//!
//! Clients upgrade a plain socket, attach a user id with an `auth`
//! envelope, and exchange direct messages addressed by user id.

pub mod auth;
pub mod config;
pub mod hub;
pub mod relay;
pub mod server;
pub mod transport;

pub use config::{IdentityBinding, Overrides, ServerConfig};
pub use hub::RegistryStats;
pub use server::{ChatServer, ServerHandle};
