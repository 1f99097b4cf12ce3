//! Peer-to-peer networking
//!
//! Nodes exchange one framed message per TCP connection (see [`message`]).
//! A node learns the chain from the central node at startup, relays
//! transactions and announces the blocks it mines.

pub mod message;
pub mod node;
pub mod server;

pub use message::{OpType, Package};
pub use node::{Node, Nodes};
pub use server::{send_tx, NodeState, Server, ServerHandle, NODE_VERSION};
