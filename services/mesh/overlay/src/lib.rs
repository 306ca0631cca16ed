//! Publish/subscribe overlay for the peer mesh.
//!
//! A [`Mesh`] is a named session holding the local node and a [`Peers`]
//! collection of remote [`Node`]s. Applications bind handlers to event types
//! and trigger events; the mesh announces interest to peers, filters
//! outbound events by the peers' declared interest and carries them over the
//! best open channel (direct when negotiated, otherwise the relay).
//!
//! ## Example
//!
//! ```rust,no_run
//! use mesh_overlay::{EventHandler, Mesh, MeshOptions};
//!
//! # async fn example() -> Result<(), mesh_overlay::MeshError> {
//! let mesh = Mesh::builder(MeshOptions::with_ws("wss://relay.example.com/lobby")).build()?;
//!
//! mesh.bind(
//!     "chat",
//!     EventHandler::new(|e| println!("{:?} says {:?}", e.node.id(), e.first_str())),
//! )?;
//! mesh.trigger("chat", "hello")?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod discovery;
pub mod error;
pub mod event;
pub mod mesh;
pub mod node;
pub mod options;
pub mod peers;

pub use discovery::{Discovery, HttpDiscovery};
pub use error::MeshError;
pub use event::{Event, EventHandler};
pub use mesh::{Mesh, MeshBuilder};
pub use node::{Node, NodeState};
pub use options::{Delay, MeshOptions, DEFAULT_API, DEFAULT_RETRY_INTERVAL};
pub use peers::Peers;
