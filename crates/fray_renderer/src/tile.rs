//! Tile quantization and the shared claim/report scheduler.
//!
//! The frame is chopped into fixed-size tiles (edge tiles are clamped to the
//! frame), put in dispatch order once, and then claimed one at a time by
//! however many workers the render has, local or remote. All bookkeeping
//! lives behind one mutex; workers hold it only long enough to pick or
//! report a tile, never while rendering.

use parking_lot::{Condvar, Mutex};
use rand::seq::SliceRandom;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileState {
    Ready,
    Rendering,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TileOrder {
    #[default]
    Normal,
    TopToBottom,
    Random,
    FromMiddle,
    ToMiddle,
}

impl TileOrder {
    /// Parse the tile order preference. Unknown names mean normal order.
    pub fn from_name(name: &str) -> TileOrder {
        match name {
            "random" => TileOrder::Random,
            "topToBottom" => TileOrder::TopToBottom,
            "fromMiddle" => TileOrder::FromMiddle,
            "toMiddle" => TileOrder::ToMiddle,
            _ => TileOrder::Normal,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TileOrder::Normal => "normal",
            TileOrder::TopToBottom => "topToBottom",
            TileOrder::Random => "random",
            TileOrder::FromMiddle => "fromMiddle",
            TileOrder::ToMiddle => "toMiddle",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Tile {
    /// Position in dispatch order, assigned after ordering.
    pub index: usize,
    pub start_x: u32,
    pub start_y: u32,
    pub end_x: u32,
    pub end_y: u32,
    pub width: u32,
    pub height: u32,
    pub state: TileState,
    /// Set while a remote node holds the claim.
    pub network_renderer: bool,
    pub total_samples: u64,
    pub completed_samples: u64,
}

/// Chop a frame into tiles and order them for dispatch.
pub fn quantize(width: u32, height: u32, tile_w: u32, tile_h: u32, order: TileOrder) -> Vec<Tile> {
    let tile_w = tile_w.max(1);
    let tile_h = tile_h.max(1);
    let tiles_x = (width + tile_w - 1) / tile_w;
    let tiles_y = (height + tile_h - 1) / tile_h;

    let mut tiles = Vec::with_capacity((tiles_x * tiles_y) as usize);
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let start_x = tx * tile_w;
            let start_y = ty * tile_h;
            let end_x = (start_x + tile_w).min(width);
            let end_y = (start_y + tile_h).min(height);
            tiles.push(Tile {
                index: 0,
                start_x,
                start_y,
                end_x,
                end_y,
                width: end_x - start_x,
                height: end_y - start_y,
                state: TileState::Ready,
                network_renderer: false,
                total_samples: 0,
                completed_samples: 0,
            });
        }
    }
    reorder(&mut tiles, order, width, height);
    for (i, tile) in tiles.iter_mut().enumerate() {
        tile.index = i;
    }
    tiles
}

fn reorder(tiles: &mut [Tile], order: TileOrder, width: u32, height: u32) {
    let center_x = width as f32 / 2.0;
    let center_y = height as f32 / 2.0;
    let distance = |t: &Tile| -> f32 {
        let cx = (t.start_x + t.end_x) as f32 / 2.0;
        let cy = (t.start_y + t.end_y) as f32 / 2.0;
        (cx - center_x).powi(2) + (cy - center_y).powi(2)
    };
    match order {
        TileOrder::Normal => {}
        TileOrder::TopToBottom => {
            tiles.sort_by_key(|t| t.start_y);
        }
        TileOrder::Random => {
            tiles.shuffle(&mut rand::thread_rng());
        }
        TileOrder::FromMiddle => {
            tiles.sort_by(|a, b| {
                distance(a)
                    .partial_cmp(&distance(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        TileOrder::ToMiddle => {
            tiles.sort_by(|a, b| {
                distance(b)
                    .partial_cmp(&distance(a))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
    }
}

/// A claimed tile and the generation of the set it was claimed from.
/// Reports and requeues carry the claim back; a claim whose set has been
/// replaced in the meantime is dead and gets ignored.
#[derive(Debug, Clone)]
pub struct TileClaim {
    pub tile: Tile,
    pub generation: u64,
}

struct TileSetInner {
    tiles: Vec<Tile>,
    finished: usize,
    generation: u64,
}

/// The shared tile scheduler for one render.
///
/// Claiming hands out at most one claimant per tile. In iterative mode a
/// reported tile goes back to `Ready` until it reaches its sample target;
/// claiming prefers the tiles with the fewest completed samples so no tile
/// runs ahead, which is what keeps whole-image passes converging together.
/// Replacing the set bumps its generation, which orphans any claims still
/// out against the old tiles.
pub struct TileSet {
    inner: Mutex<TileSetInner>,
    progress: Condvar,
}

impl TileSet {
    pub fn new() -> TileSet {
        TileSet {
            inner: Mutex::new(TileSetInner {
                tiles: Vec::new(),
                finished: 0,
                generation: 0,
            }),
            progress: Condvar::new(),
        }
    }

    /// Swap in a freshly quantized set, e.g. after a resolution change.
    pub fn replace(&self, mut tiles: Vec<Tile>, samples_target: u64) {
        for tile in &mut tiles {
            tile.total_samples = samples_target;
        }
        let mut inner = self.inner.lock();
        inner.tiles = tiles;
        inner.finished = 0;
        inner.generation += 1;
        self.progress.notify_all();
    }

    /// Return every tile to the start of its life, keeping the rectangles.
    /// Tiles currently being rendered keep their claim; their in-flight
    /// samples get reported against the zeroed counters.
    pub fn reset(&self, samples_target: u64) {
        let mut inner = self.inner.lock();
        inner.finished = 0;
        for tile in &mut inner.tiles {
            tile.total_samples = samples_target;
            tile.completed_samples = 0;
            if tile.state != TileState::Rendering {
                tile.state = TileState::Ready;
                tile.network_renderer = false;
            }
        }
        self.progress.notify_all();
    }

    /// Claim the next tile for rendering, or `None` when nothing is ready.
    /// Among ready tiles, the least-sampled one earliest in dispatch order
    /// wins. The returned claim is the claimant's work order; bookkeeping
    /// happens at report time.
    pub fn claim_next(&self, network: bool) -> Option<TileClaim> {
        let mut inner = self.inner.lock();
        let generation = inner.generation;
        let least = inner
            .tiles
            .iter()
            .filter(|t| t.state == TileState::Ready)
            .map(|t| t.completed_samples)
            .min()?;
        let tile = inner
            .tiles
            .iter_mut()
            .find(|t| t.state == TileState::Ready && t.completed_samples == least)?;
        tile.state = TileState::Rendering;
        tile.network_renderer = network;
        Some(TileClaim {
            tile: tile.clone(),
            generation,
        })
    }

    /// Record `samples` finished samples for a claimed tile. The tile
    /// becomes `Finished` when it reaches its target, bumping the finished
    /// counter exactly once, and otherwise returns to `Ready` for the next
    /// pass. Reports against tiles that are not claimed, or claims from a
    /// set that has since been replaced, are rejected.
    pub fn report_finished(&self, claim: &TileClaim, samples: u64) -> bool {
        let mut inner = self.inner.lock();
        if claim.generation != inner.generation {
            return false;
        }
        let Some(tile) = inner.tiles.get_mut(claim.tile.index) else {
            return false;
        };
        if tile.state != TileState::Rendering {
            return false;
        }
        tile.completed_samples += samples;
        if tile.completed_samples >= tile.total_samples {
            tile.state = TileState::Finished;
            tile.network_renderer = false;
            inner.finished += 1;
        } else {
            tile.state = TileState::Ready;
            tile.network_renderer = false;
        }
        self.progress.notify_all();
        true
    }

    /// Return a claimed tile to the ready pool with nothing recorded, e.g.
    /// when the render node holding it went away. Claims orphaned by a
    /// replace are ignored.
    pub fn requeue(&self, claim: &TileClaim) {
        let mut inner = self.inner.lock();
        if claim.generation != inner.generation {
            return;
        }
        if let Some(tile) = inner.tiles.get_mut(claim.tile.index) {
            if tile.state == TileState::Rendering {
                tile.state = TileState::Ready;
                tile.network_renderer = false;
                self.progress.notify_all();
            }
        }
    }

    pub fn finished(&self) -> usize {
        self.inner.lock().finished
    }

    /// Generation of the current set; [`TileSet::replace`] bumps it.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    pub fn tile_count(&self) -> usize {
        self.inner.lock().tiles.len()
    }

    pub fn all_finished(&self) -> bool {
        let inner = self.inner.lock();
        inner.finished == inner.tiles.len()
    }

    pub fn snapshot(&self) -> Vec<Tile> {
        self.inner.lock().tiles.clone()
    }

    /// Samples completed across all tiles.
    pub fn completed_samples(&self) -> u64 {
        self.inner
            .lock()
            .tiles
            .iter()
            .map(|t| t.completed_samples)
            .sum()
    }

    /// Sample target summed across all tiles.
    pub fn target_samples(&self) -> u64 {
        self.inner.lock().tiles.iter().map(|t| t.total_samples).sum()
    }

    /// The lowest completed sample count of any tile; the number of
    /// whole-image passes finished so far.
    pub fn min_completed(&self) -> u64 {
        self.inner
            .lock()
            .tiles
            .iter()
            .map(|t| t.completed_samples)
            .min()
            .unwrap_or(0)
    }

    /// Block until some tile is ready or the timeout passes. Used by
    /// iterative workers when the set is momentarily all claimed.
    pub fn wait_for_ready(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        if inner.tiles.iter().any(|t| t.state == TileState::Ready) {
            return true;
        }
        self.progress.wait_for(&mut inner, timeout);
        inner.tiles.iter().any(|t| t.state == TileState::Ready)
    }

    /// Wake every waiter, used on state transitions so blocked workers
    /// re-check their exit conditions.
    pub fn wake_all(&self) {
        self.progress.notify_all();
    }
}

impl Default for TileSet {
    fn default() -> Self {
        TileSet::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_quantize_exact_grid() {
        let tiles = quantize(256, 256, 64, 64, TileOrder::Normal);
        assert_eq!(tiles.len(), 16);
        assert!(tiles.iter().all(|t| t.width == 64 && t.height == 64));
        // Normal order is row-major creation order.
        assert_eq!(tiles[1].start_x, 64);
        assert_eq!(tiles[4].start_y, 64);
    }

    #[test]
    fn test_quantize_clamps_edge_tiles() {
        let tiles = quantize(100, 70, 32, 32, TileOrder::Normal);
        assert_eq!(tiles.len(), 4 * 3);
        let last = tiles.last().unwrap();
        assert_eq!(last.width, 100 - 96);
        assert_eq!(last.height, 70 - 64);
        // Every pixel is covered exactly once.
        let area: u32 = tiles.iter().map(|t| t.width * t.height).sum();
        assert_eq!(area, 100 * 70);
    }

    #[test]
    fn test_indices_follow_dispatch_order() {
        for order in [
            TileOrder::Normal,
            TileOrder::Random,
            TileOrder::FromMiddle,
            TileOrder::ToMiddle,
        ] {
            let tiles = quantize(256, 256, 64, 64, order);
            for (i, tile) in tiles.iter().enumerate() {
                assert_eq!(tile.index, i);
            }
        }
    }

    #[test]
    fn test_from_middle_starts_near_center() {
        let tiles = quantize(256, 256, 64, 64, TileOrder::FromMiddle);
        let center = |t: &Tile| {
            let cx = (t.start_x + t.end_x) as f32 / 2.0 - 128.0;
            let cy = (t.start_y + t.end_y) as f32 / 2.0 - 128.0;
            cx * cx + cy * cy
        };
        let first = center(&tiles[0]);
        let last = center(tiles.last().unwrap());
        assert!(first < last);

        let inverted = quantize(256, 256, 64, 64, TileOrder::ToMiddle);
        assert!(center(&inverted[0]) > center(inverted.last().unwrap()));
    }

    #[test]
    fn test_top_to_bottom_rows_nondecreasing() {
        let tiles = quantize(300, 300, 50, 50, TileOrder::TopToBottom);
        for pair in tiles.windows(2) {
            assert!(pair[0].start_y <= pair[1].start_y);
        }
    }

    #[test]
    fn test_random_is_a_permutation() {
        let normal = quantize(256, 256, 64, 64, TileOrder::Normal);
        let random = quantize(256, 256, 64, 64, TileOrder::Random);
        let mut rects: Vec<(u32, u32)> = random.iter().map(|t| (t.start_x, t.start_y)).collect();
        rects.sort_unstable();
        let mut expected: Vec<(u32, u32)> =
            normal.iter().map(|t| (t.start_x, t.start_y)).collect();
        expected.sort_unstable();
        assert_eq!(rects, expected);
    }

    #[test]
    fn test_order_names_roundtrip() {
        for name in ["normal", "topToBottom", "random", "fromMiddle", "toMiddle"] {
            assert_eq!(TileOrder::from_name(name).name(), name);
        }
        assert_eq!(TileOrder::from_name("bogus"), TileOrder::Normal);
    }

    #[test]
    fn test_batch_claim_and_finish() {
        let set = TileSet::new();
        set.replace(quantize(64, 64, 32, 32, TileOrder::Normal), 25);
        let mut claims = Vec::new();
        while let Some(claim) = set.claim_next(false) {
            claims.push(claim);
        }
        let order: Vec<usize> = claims.iter().map(|c| c.tile.index).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        assert!(set.claim_next(false).is_none());
        for claim in &claims {
            assert!(set.report_finished(claim, 25));
        }
        assert_eq!(set.finished(), 4);
        assert!(set.all_finished());
    }

    #[test]
    fn test_iterative_tile_cycles_until_target() {
        let set = TileSet::new();
        set.replace(quantize(32, 32, 32, 32, TileOrder::Normal), 2);
        let claim = set.claim_next(false).unwrap();
        assert!(set.report_finished(&claim, 1));
        // One sample down, one to go: back to ready.
        assert_eq!(set.finished(), 0);
        let again = set.claim_next(false).unwrap();
        assert_eq!(again.tile.index, claim.tile.index);
        assert_eq!(again.tile.completed_samples, 1);
        assert!(set.report_finished(&again, 1));
        assert_eq!(set.finished(), 1);
        assert!(set.all_finished());
    }

    #[test]
    fn test_claim_prefers_least_sampled() {
        let set = TileSet::new();
        set.replace(quantize(64, 32, 32, 32, TileOrder::Normal), 3);
        let first = set.claim_next(false).unwrap();
        assert_eq!(first.tile.index, 0);
        set.report_finished(&first, 1);
        // Tile 0 is ready again but tile 1 has seen nothing yet.
        let second = set.claim_next(false).unwrap();
        assert_eq!(second.tile.index, 1);
        set.report_finished(&second, 1);
        // Both even again: dispatch order breaks the tie.
        assert_eq!(set.claim_next(false).unwrap().tile.index, 0);
    }

    #[test]
    fn test_network_flag_follows_claimant() {
        let set = TileSet::new();
        set.replace(quantize(32, 32, 32, 32, TileOrder::Normal), 1);
        let claim = set.claim_next(true).unwrap();
        assert!(claim.tile.network_renderer);
        assert!(set.snapshot()[0].network_renderer);
        set.report_finished(&claim, 1);
        assert!(!set.snapshot()[0].network_renderer);
    }

    #[test]
    fn test_requeue_returns_tile_to_pool() {
        let set = TileSet::new();
        set.replace(quantize(32, 32, 32, 32, TileOrder::Normal), 1);
        let claim = set.claim_next(true).unwrap();
        assert!(set.claim_next(false).is_none());
        set.requeue(&claim);
        let again = set.claim_next(false).unwrap();
        assert_eq!(again.tile.index, claim.tile.index);
        assert!(!again.tile.network_renderer);
        assert_eq!(again.tile.completed_samples, 0);
    }

    #[test]
    fn test_bogus_reports_are_rejected() {
        let set = TileSet::new();
        set.replace(quantize(32, 32, 32, 32, TileOrder::Normal), 1);
        // Not claimed yet.
        let unclaimed = TileClaim {
            tile: set.snapshot()[0].clone(),
            generation: set.generation(),
        };
        assert!(!set.report_finished(&unclaimed, 1));
        // Index past the set.
        let mut out_of_range = unclaimed.clone();
        out_of_range.tile.index = 99;
        assert!(!set.report_finished(&out_of_range, 1));
        let claim = set.claim_next(false).unwrap();
        assert!(set.report_finished(&claim, 1));
        // Double report.
        assert!(!set.report_finished(&claim, 1));
        assert_eq!(set.finished(), 1);
    }

    #[test]
    fn test_reset_keeps_rectangles_and_claims() {
        let set = TileSet::new();
        set.replace(quantize(64, 64, 32, 32, TileOrder::Normal), 2);
        let held = set.claim_next(false).unwrap();
        let done = set.claim_next(false).unwrap();
        set.report_finished(&done, 2);
        assert_eq!(set.finished(), 1);

        set.reset(2);
        assert_eq!(set.finished(), 0);
        assert_eq!(set.tile_count(), 4);
        assert_eq!(set.min_completed(), 0);
        let snap = set.snapshot();
        // The in-flight claim survives; everything else is ready again.
        assert_eq!(snap[held.tile.index].state, TileState::Rendering);
        assert_eq!(snap[done.tile.index].state, TileState::Ready);
        // A reset is not a replace: the in-flight worker's claim is still
        // good and its pass lands in the zeroed counters.
        assert!(set.report_finished(&held, 1));
        assert_eq!(set.snapshot()[held.tile.index].completed_samples, 1);
    }

    #[test]
    fn test_replace_invalidates_outstanding_claims() {
        let set = TileSet::new();
        set.replace(quantize(64, 64, 32, 32, TileOrder::Normal), 2);
        let stale = set.claim_next(false).unwrap();

        // A resize swaps in a whole new set while the claim is out.
        set.replace(quantize(128, 128, 32, 32, TileOrder::Normal), 2);
        assert_eq!(set.generation(), stale.generation + 1);

        // The new set's first tile goes to a current claimant, so index and
        // state alone cannot tell the stale report apart from a live one.
        let fresh = set.claim_next(false).unwrap();
        assert_eq!(fresh.tile.index, stale.tile.index);

        assert!(!set.report_finished(&stale, 2));
        assert_eq!(set.finished(), 0);
        assert_eq!(set.completed_samples(), 0);
        set.requeue(&stale);
        assert_eq!(set.snapshot()[0].state, TileState::Rendering);

        // The live claim is untouched by any of that.
        assert!(set.report_finished(&fresh, 2));
        assert_eq!(set.finished(), 1);
    }

    #[test]
    fn test_wait_for_ready_times_out_when_all_claimed() {
        let set = TileSet::new();
        set.replace(quantize(32, 32, 32, 32, TileOrder::Normal), 1);
        assert!(set.wait_for_ready(Duration::from_millis(1)));
        let _claim = set.claim_next(false).unwrap();
        assert!(!set.wait_for_ready(Duration::from_millis(10)));
    }

    #[test]
    fn test_concurrent_claims_are_exclusive() {
        let set = Arc::new(TileSet::new());
        set.replace(quantize(512, 512, 64, 64, TileOrder::Random), 1);
        let claims = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let set = Arc::clone(&set);
            let claims = Arc::clone(&claims);
            handles.push(std::thread::spawn(move || {
                while let Some(claim) = set.claim_next(false) {
                    claims.fetch_add(1, Ordering::SeqCst);
                    assert!(set.report_finished(&claim, 1));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        // 64 tiles, each claimed exactly once.
        assert_eq!(claims.load(Ordering::SeqCst), 64);
        assert_eq!(set.finished(), 64);
    }
}
