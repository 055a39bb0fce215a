//! Tile dispatch to remote render nodes.
//!
//! Each connected node gets one dispatch thread that claims tiles from the
//! same set as the local workers and sends them over the wire. A node that
//! errors out mid-render is dropped and its in-flight tile goes back in the
//! queue for someone else.

use crate::renderer::RenderShared;
use fray_proto::{RemoteClient, TileJob};
use std::sync::Arc;

pub(crate) fn dispatch_loop(shared: Arc<RenderShared>, mut client: RemoteClient, id: usize) {
    let node = client.addr().to_string();
    loop {
        if !shared.active() {
            break;
        }
        shared.registry.park_if_paused(id, || !shared.active());
        if !shared.active() {
            break;
        }
        // Nodes render a tile to target in one shot, so only batch renders
        // dispatch remotely and a claimed tile never comes back partial.
        let Some(claim) = shared.tiles.claim_next(true) else {
            break;
        };
        let tile = &claim.tile;
        let job = TileJob {
            index: tile.index,
            start_x: tile.start_x,
            start_y: tile.start_y,
            width: tile.width,
            height: tile.height,
            samples: tile
                .total_samples
                .saturating_sub(tile.completed_samples)
                .max(1),
        };
        match client.render_tile(&job) {
            Ok(result) => {
                let expected = (tile.width * tile.height * 4) as usize;
                if result.pixels.len() != expected {
                    log::warn!(
                        "Node {node} returned {} floats for tile {}, wanted {expected}; dropping node",
                        result.pixels.len(),
                        tile.index
                    );
                    shared.tiles.requeue(&claim);
                    break;
                }
                let block: Vec<[f32; 4]> = result
                    .pixels
                    .chunks_exact(4)
                    .map(|px| [px[0], px[1], px[2], px[3]])
                    .collect();
                shared.fb.lock().blend_region(
                    tile.start_x,
                    tile.start_y,
                    tile.width,
                    tile.height,
                    &block,
                    1.0,
                );
                shared
                    .registry
                    .add_samples(id, result.samples * (tile.width * tile.height) as u64);
                shared.tiles.report_finished(&claim, result.samples);
            }
            Err(e) => {
                log::warn!("Render node {node} dropped: {e}");
                shared.tiles.requeue(&claim);
                break;
            }
        }
    }
    log::debug!("Dispatch for {node} done");
}
