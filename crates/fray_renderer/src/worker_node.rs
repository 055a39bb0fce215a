//! The render node side of network rendering.
//!
//! A node process sits in an accept loop and serves one coordinator at a
//! time: handshake, receive the scene, then render whatever tiles the
//! coordinator sends until it hangs up. A `Shutdown` message, arriving
//! either in place of a handshake or mid-session, ends the accept loop and
//! lets the process exit.

use crate::tile::{Tile, TileState};
use crate::trace::{render_tile, TraceView};
use fray_core::{Camera, Scene};
use fray_proto::{
    FramedStream, Message, ProtoError, TileJob, TileResult, PROTOCOL_VERSION,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use std::net::TcpListener;
use std::time::Instant;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How a session ended, as seen by the accept loop.
pub enum SessionEnd {
    /// The coordinator hung up; go back to accepting.
    Closed,
    /// The coordinator asked the node process to exit.
    Shutdown,
}

/// Listen on all interfaces and serve render sessions until a coordinator
/// sends `Shutdown`. A `thread_limit` of zero means use every core.
pub fn serve(port: u16, thread_limit: usize) -> Result<(), ProtoError> {
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    log::info!("Render node listening on port {port}");
    serve_listener(listener, thread_limit)
}

/// Accept loop over an already-bound listener.
pub fn serve_listener(listener: TcpListener, thread_limit: usize) -> Result<(), ProtoError> {
    let threads = if thread_limit == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        thread_limit
    };
    loop {
        let (stream, peer) = listener.accept()?;
        log::info!("Coordinator connected from {peer}");
        match handle_session(FramedStream::new(stream), threads) {
            Ok(SessionEnd::Shutdown) => {
                log::info!("Shutdown requested, render node exiting");
                return Ok(());
            }
            Ok(SessionEnd::Closed) => log::info!("Session from {peer} ended"),
            Err(e) => log::warn!("Session from {peer} failed: {e}"),
        }
    }
}

fn handle_session(mut stream: FramedStream, threads: usize) -> Result<SessionEnd, ProtoError> {
    let their_protocol = match stream.recv()? {
        Message::Shutdown => return Ok(SessionEnd::Shutdown),
        Message::Handshake { version, protocol } => {
            log::debug!("Coordinator runs version {version}, protocol {protocol}");
            protocol
        }
        _ => return Err(ProtoError::Unexpected { expected: "Handshake" }),
    };
    // Ack with our own numbers either way; the coordinator rejects the
    // mismatch on its side too.
    stream.send(&Message::HandshakeAck {
        version: VERSION.to_string(),
        protocol: PROTOCOL_VERSION,
        threads,
    })?;
    if their_protocol != PROTOCOL_VERSION {
        return Err(ProtoError::Version {
            ours: PROTOCOL_VERSION,
            theirs: their_protocol,
        });
    }

    let sync = match stream.recv()? {
        Message::SyncScene(sync) => sync,
        Message::Shutdown => return Ok(SessionEnd::Shutdown),
        _ => return Err(ProtoError::Unexpected { expected: "SyncScene" }),
    };
    let begun = Instant::now();
    let scene = Scene::from_snapshot(sync.snapshot);
    scene.pool().wait();
    scene.rebuild_top_level();
    let Some(mut camera) = scene.camera(sync.selected_camera) else {
        return Err(ProtoError::Session(format!(
            "synced scene has no camera {}",
            sync.selected_camera
        )));
    };
    camera.width = sync.width;
    camera.height = sync.height;
    camera.recompute_optics();
    log::info!(
        "Scene ready in {}ms: {:?}",
        begun.elapsed().as_millis(),
        scene.totals()
    );
    stream.send(&Message::SceneReady)?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("fray-node-{i}"))
        .build()
        .map_err(|e| ProtoError::Session(format!("thread pool: {e}")))?;

    loop {
        match stream.recv() {
            Ok(Message::RenderTile(job)) => {
                let result = render_job(&scene, &camera, &job, sync.bounces, &pool);
                stream.send(&Message::TileResult(result))?;
            }
            Ok(Message::Shutdown) => return Ok(SessionEnd::Shutdown),
            Ok(other) => log::debug!("Ignoring {} mid-session", other.kind()),
            Err(ProtoError::Closed) => return Ok(SessionEnd::Closed),
            Err(e) => return Err(e),
        }
    }
}

/// Render one tile to its full sample target, rows spread across the node's
/// pool.
fn render_job(
    scene: &Scene,
    camera: &Camera,
    job: &TileJob,
    bounces: u32,
    pool: &rayon::ThreadPool,
) -> TileResult {
    let view = TraceView::capture(scene);
    let begun = Instant::now();
    let rows: Vec<Vec<[f32; 4]>> = pool.install(|| {
        (0..job.height)
            .into_par_iter()
            .map(|row| {
                let mut rng = StdRng::from_entropy();
                let strip = Tile {
                    index: job.index,
                    start_x: job.start_x,
                    start_y: job.start_y + row,
                    end_x: job.start_x + job.width,
                    end_y: job.start_y + row + 1,
                    width: job.width,
                    height: 1,
                    state: TileState::Rendering,
                    network_renderer: false,
                    total_samples: job.samples,
                    completed_samples: 0,
                };
                render_tile(&view, camera, &strip, job.samples, bounces, &mut rng)
            })
            .collect()
    });
    let mut pixels = Vec::with_capacity((job.width * job.height * 4) as usize);
    for row in rows {
        for px in row {
            pixels.extend_from_slice(&px);
        }
    }
    log::debug!(
        "Tile {} ({}x{}, {} samples) took {}ms",
        job.index,
        job.width,
        job.height,
        job.samples,
        begun.elapsed().as_millis()
    );
    TileResult {
        index: job.index,
        samples: job.samples,
        pixels,
    }
}
