//! Relay for the peer mesh.
//!
//! The relay groups clients into rooms by connection path, assigns each
//! client an integer id and forwards addressed messages between members of
//! the same room. It never looks inside the messages it forwards.
//!
//! ```no_run
//! use mesh_relay::{serve, RelayHub};
//! use std::sync::Arc;
//!
//! # async fn run() -> std::io::Result<()> {
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! serve(listener, Arc::new(RelayHub::new())).await
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod hub;
pub mod memory;
pub mod server;

pub use hub::RelayHub;
pub use memory::MemoryRelay;
pub use server::serve;
