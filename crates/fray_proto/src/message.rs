//! Messages exchanged between the coordinator and render nodes.
//!
//! A session is: `Handshake`/`HandshakeAck`, `SyncScene`/`SceneReady`, then
//! any number of `RenderTile`/`TileResult` pairs until the coordinator closes
//! the connection. `Shutdown` may arrive instead of a handshake and asks the
//! node process to exit its accept loop.

use fray_core::SceneSnapshot;
use serde::{Deserialize, Serialize};

/// Bumped on any incompatible change to the message set.
pub const PROTOCOL_VERSION: u32 = 1;

/// Port render nodes listen on unless told otherwise.
pub const DEFAULT_PORT: u16 = 2222;

/// Everything a node needs before tiles can be dispatched to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneSync {
    pub snapshot: SceneSnapshot,
    pub selected_camera: usize,
    /// Output resolution, already including any override the coordinator
    /// applies on top of the camera.
    pub width: u32,
    pub height: u32,
    pub bounces: u32,
}

/// One tile assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileJob {
    pub index: usize,
    pub start_x: u32,
    pub start_y: u32,
    pub width: u32,
    pub height: u32,
    pub samples: u64,
}

/// A finished tile coming back from a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileResult {
    pub index: usize,
    pub samples: u64,
    /// Row-major RGBA, `width * height * 4` floats, linear.
    pub pixels: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Handshake {
        version: String,
        protocol: u32,
    },
    HandshakeAck {
        version: String,
        protocol: u32,
        /// Worker threads the node will render with.
        threads: usize,
    },
    SyncScene(SceneSync),
    SceneReady,
    RenderTile(TileJob),
    TileResult(TileResult),
    Shutdown,
}

impl Message {
    /// Variant name for logs and error reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Handshake { .. } => "Handshake",
            Message::HandshakeAck { .. } => "HandshakeAck",
            Message::SyncScene(_) => "SyncScene",
            Message::SceneReady => "SceneReady",
            Message::RenderTile(_) => "RenderTile",
            Message::TileResult(_) => "TileResult",
            Message::Shutdown => "Shutdown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_job_roundtrip() {
        let job = TileJob {
            index: 3,
            start_x: 64,
            start_y: 128,
            width: 64,
            height: 32,
            samples: 25,
        };
        let json = serde_json::to_string(&Message::RenderTile(job.clone())).unwrap();
        match serde_json::from_str(&json).unwrap() {
            Message::RenderTile(got) => assert_eq!(got, job),
            other => panic!("decoded as {}", other.kind()),
        }
    }

    #[test]
    fn test_handshake_carries_protocol() {
        let msg = Message::Handshake {
            version: "0.1.0".into(),
            protocol: PROTOCOL_VERSION,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("Handshake"));
        assert!(json.contains("\"protocol\":1"));
    }

    #[test]
    fn test_unit_messages_decode() {
        let json = serde_json::to_string(&Message::Shutdown).unwrap();
        let msg: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(msg.kind(), "Shutdown");
    }
}
