//! Coordinator-side session handling for render nodes: connecting,
//! handshaking, shipping the scene, and the per-tile request cycle.

use crate::message::{Message, SceneSync, TileJob, TileResult, PROTOCOL_VERSION};
use crate::node_list::NodeAddr;
use crate::transport::{FramedStream, ProtoError};
use std::net::TcpStream;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// An established, scene-synced connection to one render node.
pub struct RemoteClient {
    stream: FramedStream,
    addr: NodeAddr,
    /// Worker threads the node reported at handshake.
    pub threads: usize,
}

impl RemoteClient {
    /// Connect to a node, verify the protocol version and ship the scene.
    /// Returns only once the node reports the scene rebuilt and ready.
    pub fn connect(addr: &NodeAddr, sync: &SceneSync) -> Result<RemoteClient, ProtoError> {
        let stream = TcpStream::connect((addr.host.as_str(), addr.port))?;
        let mut framed = FramedStream::new(stream);

        framed.send(&Message::Handshake {
            version: VERSION.to_string(),
            protocol: PROTOCOL_VERSION,
        })?;
        let threads = match framed.recv()? {
            Message::HandshakeAck {
                protocol, threads, ..
            } => {
                if protocol != PROTOCOL_VERSION {
                    return Err(ProtoError::Version {
                        ours: PROTOCOL_VERSION,
                        theirs: protocol,
                    });
                }
                threads
            }
            _ => {
                return Err(ProtoError::Unexpected {
                    expected: "HandshakeAck",
                })
            }
        };

        framed.send(&Message::SyncScene(sync.clone()))?;
        match framed.recv()? {
            Message::SceneReady => {}
            _ => {
                return Err(ProtoError::Unexpected {
                    expected: "SceneReady",
                })
            }
        }
        Ok(RemoteClient {
            stream: framed,
            addr: addr.clone(),
            threads,
        })
    }

    pub fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    /// Send one tile job and block until its pixels come back.
    pub fn render_tile(&mut self, job: &TileJob) -> Result<TileResult, ProtoError> {
        self.stream.send(&Message::RenderTile(job.clone()))?;
        match self.stream.recv()? {
            Message::TileResult(result) => Ok(result),
            _ => Err(ProtoError::Unexpected {
                expected: "TileResult",
            }),
        }
    }
}

/// Connect and sync every node in the list. Nodes that fail to come up are
/// logged and dropped; the render proceeds with whoever made it.
pub fn sync_clients(nodes: &[NodeAddr], sync: &SceneSync) -> Vec<RemoteClient> {
    let mut clients = Vec::new();
    for node in nodes {
        match RemoteClient::connect(node, sync) {
            Ok(client) => {
                log::info!("Render node {node} up, {} threads", client.threads);
                clients.push(client);
            }
            Err(e) => log::warn!("Render node {node} unavailable: {e}"),
        }
    }
    clients
}

/// Ask every node in the list to exit its accept loop. Nodes that are
/// already gone count as shut down.
pub fn shutdown_nodes(nodes: &[NodeAddr]) {
    for node in nodes {
        match TcpStream::connect((node.host.as_str(), node.port)) {
            Ok(stream) => {
                let mut framed = FramedStream::new(stream);
                match framed.send(&Message::Shutdown) {
                    Ok(()) => log::info!("Sent shutdown to {node}"),
                    Err(e) => log::debug!("Shutdown send to {node} failed: {e}"),
                }
            }
            Err(e) => log::debug!("Node {node} not reachable for shutdown: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fray_core::Scene;
    use std::net::TcpListener;

    fn empty_sync() -> SceneSync {
        SceneSync {
            snapshot: Scene::new().snapshot(),
            selected_camera: 0,
            width: 8,
            height: 8,
            bounces: 2,
        }
    }

    #[test]
    fn test_sync_clients_skips_unreachable_nodes() {
        // Grab a free port and release it so nobody is listening there.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let nodes = vec![NodeAddr {
            host: "127.0.0.1".into(),
            port,
        }];
        assert!(sync_clients(&nodes, &empty_sync()).is_empty());
    }

    #[test]
    fn test_connect_rejects_protocol_mismatch() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut framed = FramedStream::new(stream);
            framed.recv().unwrap();
            framed
                .send(&Message::HandshakeAck {
                    version: "test".into(),
                    protocol: PROTOCOL_VERSION + 1,
                    threads: 1,
                })
                .unwrap();
        });

        let addr = NodeAddr {
            host: "127.0.0.1".into(),
            port,
        };
        match RemoteClient::connect(&addr, &empty_sync()) {
            Err(ProtoError::Version { theirs, .. }) => assert_eq!(theirs, PROTOCOL_VERSION + 1),
            other => panic!("expected version mismatch, got {:?}", other.err()),
        }
        server.join().unwrap();
    }

    #[test]
    fn test_shutdown_reaches_listening_node() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut framed = FramedStream::new(stream);
            framed.recv().unwrap().kind()
        });

        let nodes = vec![NodeAddr {
            host: "127.0.0.1".into(),
            port,
        }];
        shutdown_nodes(&nodes);
        assert_eq!(server.join().unwrap(), "Shutdown");
    }
}
