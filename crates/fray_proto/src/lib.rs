//! Wire protocol for distributed rendering: message set, length-prefixed
//! JSON transport, node list parsing and coordinator-side sessions.

pub mod client;
pub mod message;
pub mod node_list;
pub mod transport;

pub use client::{shutdown_nodes, sync_clients, RemoteClient};
pub use message::{Message, SceneSync, TileJob, TileResult, DEFAULT_PORT, PROTOCOL_VERSION};
pub use node_list::{parse_node_list, NodeAddr};
pub use transport::{FramedStream, ProtoError, MAX_FRAME_BYTES};
