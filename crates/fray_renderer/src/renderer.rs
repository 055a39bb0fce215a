//! The renderer: preferences, run-state machine, worker supervision and the
//! top-level render entry points.
//!
//! A render, batch or interactive, always has the same shape: settle the
//! scene, quantize tiles, register workers, let them drain the tile set, and
//! tear down. Batch renders run on the calling thread and block; interactive
//! renders run the same pipeline on a supervisor thread and keep refining
//! until stopped. State transitions go through one condvar-backed cell so
//! `stop` can wait for teardown instead of polling.

use crate::remote;
use crate::tile::{quantize, Tile, TileOrder, TileSet};
use crate::trace::{render_tile, TraceView};
use crate::worker::{WorkerKind, WorkerRegistry};
use fray_core::{Camera, Framebuffer, Scene, SharedFramebuffer};
use fray_proto::{parse_node_list, RemoteClient, SceneSync};
use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Upper limit on the bounce preference; deeper paths are a configuration
/// mistake, not a use case.
pub const MAX_BOUNCES: u32 = 512;

/// Supervisor tick: stats and status callbacks are refreshed at least this
/// often. State transitions wake the supervisor early.
const STATUS_TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Rendering,
    Paused,
    Exiting,
}

impl RunState {
    /// A render currently owns the shared state, running or paused.
    pub fn is_active(self) -> bool {
        matches!(self, RunState::Rendering | RunState::Paused)
    }
}

struct StateCell {
    state: Mutex<RunState>,
    changed: Condvar,
}

impl StateCell {
    fn new() -> Self {
        StateCell {
            state: Mutex::new(RunState::Idle),
            changed: Condvar::new(),
        }
    }

    fn get(&self) -> RunState {
        *self.state.lock()
    }

    fn set(&self, next: RunState) {
        *self.state.lock() = next;
        self.changed.notify_all();
    }

    /// Transition only if a render is active; avoids racing a teardown that
    /// already happened.
    fn set_if_active(&self, next: RunState) -> bool {
        let mut state = self.state.lock();
        if !state.is_active() {
            return false;
        }
        *state = next;
        self.changed.notify_all();
        true
    }

    fn replace(&self, from: RunState, to: RunState) -> bool {
        let mut state = self.state.lock();
        if *state != from {
            return false;
        }
        *state = to;
        self.changed.notify_all();
        true
    }

    fn wait_while(&self, pred: impl Fn(RunState) -> bool) {
        let mut state = self.state.lock();
        while pred(*state) {
            self.changed.wait(&mut state);
        }
    }

    fn wait_for_tick(&self, timeout: Duration) {
        let mut state = self.state.lock();
        let _ = self.changed.wait_for(&mut state, timeout);
    }
}

/// Render preferences. Validated entries go through the setter methods on
/// [`Renderer`]; the rest can be edited freely between renders via
/// [`Renderer::configure`].
#[derive(Debug, Clone)]
pub struct Prefs {
    pub threads: usize,
    pub samples: u64,
    pub bounces: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub tile_order: TileOrder,
    /// Refine the whole image one sample per tile at a time instead of
    /// finishing each tile outright.
    pub iterative: bool,
    pub selected_camera: usize,
    /// Render at this resolution instead of the camera's.
    pub override_width: Option<u32>,
    pub override_height: Option<u32>,
    /// Comma or space separated `host[:port]` render nodes to distribute to.
    pub node_list: Option<String>,
    /// Directory scene-relative asset references resolve against. The core
    /// only stores it; loaders consume it.
    pub asset_path: Option<String>,
}

impl Default for Prefs {
    fn default() -> Self {
        Prefs {
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            samples: 25,
            bounces: 20,
            tile_width: 64,
            tile_height: 64,
            tile_order: TileOrder::Normal,
            iterative: false,
            selected_camera: 0,
            override_width: None,
            override_height: None,
            node_list: None,
            asset_path: None,
        }
    }
}

impl Prefs {
    /// Put the render camera at the resolution the render actually runs at:
    /// the override when one is set, the camera's own otherwise. The scene's
    /// camera is never touched, only the working copy.
    fn apply_resolution(&self, camera: &mut Camera) {
        if let Some(w) = self.override_width {
            camera.width = w;
        }
        if let Some(h) = self.override_height {
            camera.height = h;
        }
        camera.recompute_optics();
    }
}

/// Progress report handed to callbacks. The framebuffer handle can be locked
/// and read; the tile list is a snapshot from the same moment.
pub struct CallbackInfo<'a> {
    pub framebuffer: &'a SharedFramebuffer,
    pub tiles: &'a [Tile],
    pub active_workers: usize,
    pub avg_ray_time_us: f64,
    pub samples_per_sec: u64,
    pub eta_ms: u64,
    pub finished_passes: u64,
    /// Fraction of the total sample target completed, 0 to 1.
    pub completion: f64,
    pub paused: bool,
    pub aborted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    /// Workers are registered and the first tile is about to go out.
    OnStart,
    /// The render finished or was stopped; the result is final.
    OnStop,
    /// Periodic progress, at most once per supervisor tick.
    Status,
    /// Pause state flipped.
    StateChanged,
    /// An interactive render completed a whole-image pass.
    PassFinished,
}

type Callback = Arc<dyn Fn(&CallbackInfo) + Send + Sync + 'static>;

#[derive(Default)]
struct Callbacks {
    on_start: Option<Callback>,
    on_stop: Option<Callback>,
    status: Option<Callback>,
    state_changed: Option<Callback>,
    pass_finished: Option<Callback>,
}

pub(crate) struct RenderShared {
    pub(crate) scene: Arc<Scene>,
    state: StateCell,
    pub(crate) registry: WorkerRegistry,
    pub(crate) tiles: TileSet,
    pub(crate) fb: SharedFramebuffer,
    pub(crate) camera: Mutex<Camera>,
    callbacks: Mutex<Callbacks>,
    iterative_run: AtomicBool,
    finished_passes: AtomicU64,
    aborted: AtomicBool,
    rays_fired: AtomicU64,
    trace_nanos: AtomicU64,
}

impl RenderShared {
    /// True while a render owns the shared state; workers exit when it goes
    /// false.
    pub(crate) fn active(&self) -> bool {
        self.state.get().is_active()
    }
}

pub struct Renderer {
    shared: Arc<RenderShared>,
    prefs: Mutex<Prefs>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Renderer {
    pub fn new() -> Renderer {
        Renderer {
            shared: Arc::new(RenderShared {
                scene: Arc::new(Scene::new()),
                state: StateCell::new(),
                registry: WorkerRegistry::new(),
                tiles: TileSet::new(),
                fb: SharedFramebuffer::new(Framebuffer::new_float(0, 0, 4)),
                camera: Mutex::new(Camera::new()),
                callbacks: Mutex::new(Callbacks::default()),
                iterative_run: AtomicBool::new(false),
                finished_passes: AtomicU64::new(1),
                aborted: AtomicBool::new(false),
                rays_fired: AtomicU64::new(0),
                trace_nanos: AtomicU64::new(0),
            }),
            prefs: Mutex::new(Prefs::default()),
            supervisor: Mutex::new(None),
        }
    }

    pub fn scene(&self) -> &Arc<Scene> {
        &self.shared.scene
    }

    pub fn state(&self) -> RunState {
        self.shared.state.get()
    }

    /// Handle to the output buffer. Valid across restarts; resizes show up
    /// through it.
    pub fn result(&self) -> SharedFramebuffer {
        self.shared.fb.clone()
    }

    pub fn prefs(&self) -> Prefs {
        self.prefs.lock().clone()
    }

    /// Edit preferences in place. Takes effect at the next render or
    /// restart; a running render keeps the preferences it started with.
    pub fn configure(&self, f: impl FnOnce(&mut Prefs)) {
        f(&mut self.prefs.lock());
    }

    /// Set the bounce limit. Values past [`MAX_BOUNCES`] are rejected.
    pub fn set_bounces(&self, bounces: u32) -> bool {
        if bounces > MAX_BOUNCES {
            log::warn!("Bounce limit {bounces} is past the cap of {MAX_BOUNCES}, ignoring");
            return false;
        }
        self.prefs.lock().bounces = bounces;
        true
    }

    /// Select the camera to render from. Rejects indices the scene does not
    /// have.
    pub fn select_camera(&self, index: usize) -> bool {
        if index >= self.shared.scene.camera_count() {
            log::warn!("Camera {index} does not exist in the scene");
            return false;
        }
        self.prefs.lock().selected_camera = index;
        true
    }

    /// Set the tile dispatch order by preference name; unknown names fall
    /// back to normal order.
    pub fn set_tile_order(&self, name: &str) {
        self.prefs.lock().tile_order = TileOrder::from_name(name);
    }

    pub fn set_callback(
        &self,
        kind: CallbackKind,
        cb: impl Fn(&CallbackInfo) + Send + Sync + 'static,
    ) {
        let cb: Callback = Arc::new(cb);
        let mut callbacks = self.shared.callbacks.lock();
        match kind {
            CallbackKind::OnStart => callbacks.on_start = Some(cb),
            CallbackKind::OnStop => callbacks.on_stop = Some(cb),
            CallbackKind::Status => callbacks.status = Some(cb),
            CallbackKind::StateChanged => callbacks.state_changed = Some(cb),
            CallbackKind::PassFinished => callbacks.pass_finished = Some(cb),
        }
    }

    /// Render to completion on the calling thread. With a node list set,
    /// the scene is shipped to every reachable render node first and tiles
    /// are distributed across local threads and nodes. With zero local
    /// threads and no nodes this is a no-op.
    pub fn render(&self) {
        let prefs = self.prefs.lock().clone();
        if self.shared.state.get() != RunState::Idle {
            log::warn!("A render is already running");
            return;
        }

        let mut clients = Vec::new();
        let nodes = prefs
            .node_list
            .as_deref()
            .map(parse_node_list)
            .unwrap_or_default();
        if !nodes.is_empty() {
            // The scene must be complete before it ships.
            self.shared.scene.pool().wait();
            match self.build_scene_sync(&prefs) {
                Some(sync) => {
                    clients = fray_proto::sync_clients(&nodes, &sync);
                    log::info!("{} of {} render nodes up", clients.len(), nodes.len());
                }
                None => {
                    log::warn!("Camera {} does not exist, aborting render", prefs.selected_camera);
                    return;
                }
            }
        }
        if prefs.threads == 0 && clients.is_empty() {
            log::warn!("No local threads and no render nodes, nothing to render");
            return;
        }
        run_render(Arc::clone(&self.shared), prefs, clients);
    }

    /// Start an iterative render on a supervisor thread and return
    /// immediately. Progress arrives through callbacks; the render runs
    /// until it reaches the sample target or [`Renderer::stop`] is called.
    pub fn start_interactive(&self) {
        let prefs = {
            let mut prefs = self.prefs.lock();
            prefs.iterative = true;
            prefs.clone()
        };
        if self.shared.state.get() != RunState::Idle {
            log::warn!("A render is already running");
            return;
        }
        if prefs.threads == 0 {
            log::warn!("Interactive rendering needs local threads");
            return;
        }
        if prefs.node_list.is_some() {
            log::debug!("Render nodes only join batch renders, ignoring node list");
        }
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("fray-supervisor".into())
            .spawn(move || run_render(shared, prefs, Vec::new()));
        match handle {
            Ok(handle) => *self.supervisor.lock() = Some(handle),
            Err(e) => log::error!("failed to spawn supervisor: {e}"),
        }
    }

    /// Restart a running interactive render after scene or camera edits:
    /// accumulation starts over from pass one against the current content.
    /// If the camera resolution changed, every worker is parked first, then
    /// the framebuffer and tile set are swapped to the new size. Bails out
    /// quietly if the render stops while workers are being gathered.
    pub fn restart_interactive(&self) {
        let prefs = self.prefs.lock().clone();
        if !self.shared.iterative_run.load(Ordering::SeqCst)
            || !self.shared.state.get().is_active()
            || self.shared.registry.count() == 0
        {
            return;
        }
        let scene = &self.shared.scene;
        let Some(mut camera) = scene.camera(prefs.selected_camera) else {
            log::warn!("Camera {} does not exist, restart ignored", prefs.selected_camera);
            return;
        };
        // The resize check must see the same resolution the render runs at,
        // overrides included, or an overridden render would resize itself.
        prefs.apply_resolution(&mut camera);

        let (fb_w, fb_h) = {
            let fb = self.shared.fb.lock();
            (fb.width(), fb.height())
        };
        let (new_w, new_h) = (camera.width, camera.height);
        if fb_w != new_w || fb_h != new_h {
            self.shared.registry.set_paused_all(true);
            let parked = self
                .shared
                .registry
                .wait_all_parked(|| !self.shared.state.get().is_active());
            if !parked {
                self.shared.registry.set_paused_all(false);
                return;
            }
            // Everyone is quiesced; swap the output surfaces.
            self.shared
                .fb
                .replace(Framebuffer::new_float(new_w, new_h, 4));
            self.shared.tiles.replace(
                quantize(
                    new_w,
                    new_h,
                    prefs.tile_width,
                    prefs.tile_height,
                    prefs.tile_order,
                ),
                prefs.samples,
            );
            *self.shared.camera.lock() = camera;
            self.shared.registry.set_paused_all(false);
            log::info!("Restarting interactive render at {new_w}x{new_h}");
        } else {
            *self.shared.camera.lock() = camera;
        }

        // Unconditionally: back to pass one against current scene content.
        self.shared.finished_passes.store(1, Ordering::SeqCst);
        self.shared.tiles.reset(prefs.samples);
        self.shared.fb.lock().clear();
        self.shared.registry.zero_samples();
        self.shared.rays_fired.store(0, Ordering::SeqCst);
        self.shared.trace_nanos.store(0, Ordering::SeqCst);
        scene.rebuild_top_level();
        scene.pool().wait();
    }

    /// Flip the pause state of every worker. During an interactive render
    /// the run state follows along so observers see `Paused`.
    pub fn toggle_pause(&self) {
        if !self.shared.state.get().is_active() {
            return;
        }
        let paused = self.shared.registry.toggle_pause_all();
        if self.shared.iterative_run.load(Ordering::SeqCst) {
            if paused {
                self.shared.state.replace(RunState::Rendering, RunState::Paused);
            } else {
                self.shared.state.replace(RunState::Paused, RunState::Rendering);
            }
        }
        self.shared.registry.wake_all();
        self.shared.tiles.wake_all();
        fire_callback(&self.shared, CallbackKind::StateChanged, Instant::now());
    }

    /// Ask the current render to wind down. For iterative renders this
    /// blocks until the supervisor has torn everything down and the state
    /// machine is back at idle. Stopping an idle renderer does nothing.
    pub fn stop(&self) {
        let signalled = self.shared.state.set_if_active(RunState::Exiting);
        if signalled {
            self.shared.registry.wake_all();
            self.shared.tiles.wake_all();
        } else if self.shared.state.get() != RunState::Exiting {
            return;
        }
        if self.shared.iterative_run.load(Ordering::SeqCst) {
            self.shared.state.wait_while(|s| s == RunState::Exiting);
            if let Some(handle) = self.supervisor.lock().take() {
                let _ = handle.join();
            }
        }
    }

    fn build_scene_sync(&self, prefs: &Prefs) -> Option<SceneSync> {
        let camera = self.shared.scene.camera(prefs.selected_camera)?;
        Some(SceneSync {
            snapshot: self.shared.scene.snapshot(),
            selected_camera: prefs.selected_camera,
            width: prefs.override_width.unwrap_or(camera.width),
            height: prefs.override_height.unwrap_or(camera.height),
            bounces: prefs.bounces,
        })
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Renderer::new()
    }
}

/// The shared render pipeline: set up output and tiles, spawn workers,
/// supervise to completion, tear down. Batch calls this on the caller's
/// thread, interactive on the supervisor thread.
fn run_render(shared: Arc<RenderShared>, prefs: Prefs, clients: Vec<RemoteClient>) {
    // Claim the state machine up front so two callers cannot both set up.
    if !shared.state.replace(RunState::Idle, RunState::Rendering) {
        log::warn!("A render is already running");
        return;
    }

    let scene = Arc::clone(&shared.scene);
    scene.pool().wait();
    if scene.top_level_dirty() {
        scene.rebuild_top_level();
    }

    let Some(mut camera) = scene.camera(prefs.selected_camera) else {
        log::warn!("Camera {} does not exist, aborting render", prefs.selected_camera);
        shared.state.set(RunState::Idle);
        return;
    };
    prefs.apply_resolution(&mut camera);
    let (width, height) = (camera.width, camera.height);
    *shared.camera.lock() = camera;

    shared.fb.replace(Framebuffer::new_float(width, height, 4));
    shared.tiles.replace(
        quantize(
            width,
            height,
            prefs.tile_width,
            prefs.tile_height,
            prefs.tile_order,
        ),
        prefs.samples,
    );
    shared.iterative_run.store(prefs.iterative, Ordering::SeqCst);
    shared.finished_passes.store(1, Ordering::SeqCst);
    shared.aborted.store(false, Ordering::SeqCst);
    shared.rays_fired.store(0, Ordering::SeqCst);
    shared.trace_nanos.store(0, Ordering::SeqCst);
    shared.registry.clear();

    log::info!(
        "Starting {} render at {}x{}, {} samples, {} tiles",
        if prefs.iterative { "iterative" } else { "batch" },
        width,
        height,
        prefs.samples,
        shared.tiles.tile_count()
    );

    let mut handles = Vec::new();
    for _ in 0..prefs.threads {
        let id = shared.registry.register(WorkerKind::Thread);
        let worker_shared = Arc::clone(&shared);
        let iterative = prefs.iterative;
        let bounces = prefs.bounces;
        let spawned = std::thread::Builder::new()
            .name(format!("fray-worker-{id}"))
            .spawn(move || local_worker_loop(worker_shared, id, iterative, bounces));
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(e) => log::error!("failed to spawn render thread: {e}"),
        }
    }
    for client in clients {
        let id = shared.registry.register(WorkerKind::Remote);
        let dispatch_shared = Arc::clone(&shared);
        let spawned = std::thread::Builder::new()
            .name(format!("fray-remote-{id}"))
            .spawn(move || remote::dispatch_loop(dispatch_shared, client, id));
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(e) => log::error!("failed to spawn dispatch thread: {e}"),
        }
    }

    let start = Instant::now();
    fire_callback(&shared, CallbackKind::OnStart, start);
    supervise(&shared, prefs.iterative, start);

    // Wind down: workers exit once the state leaves active.
    shared.state.set_if_active(RunState::Exiting);
    shared.registry.wake_all();
    shared.tiles.wake_all();
    for handle in handles {
        let _ = handle.join();
    }
    shared.state.set(RunState::Idle);

    if shared.aborted.load(Ordering::SeqCst) {
        log::info!("Render stopped after {:.2}s", start.elapsed().as_secs_f64());
    } else {
        log::info!("Finished render in {:.2}s", start.elapsed().as_secs_f64());
    }
    fire_callback(&shared, CallbackKind::OnStop, start);
}

/// Watch a running render: refresh stats, fire callbacks, account passes,
/// and decide when the render is over.
fn supervise(shared: &Arc<RenderShared>, iterative: bool, start: Instant) {
    let mut pass_watermark = 0u64;
    loop {
        shared.state.wait_for_tick(STATUS_TICK);
        if iterative {
            let passes_done = shared.tiles.min_completed();
            if passes_done < pass_watermark {
                // Tile counters went backwards: a restart happened.
                pass_watermark = passes_done;
            }
            while pass_watermark < passes_done {
                pass_watermark += 1;
                shared
                    .finished_passes
                    .store(pass_watermark + 1, Ordering::SeqCst);
                fire_callback(shared, CallbackKind::PassFinished, start);
            }
        }
        fire_callback(shared, CallbackKind::Status, start);

        let state = shared.state.get();
        if state == RunState::Exiting {
            shared
                .aborted
                .store(!shared.tiles.all_finished(), Ordering::SeqCst);
            return;
        }
        if shared.tiles.all_finished() {
            return;
        }
    }
}

/// One local render thread: claim, render, blit, report, repeat.
fn local_worker_loop(shared: Arc<RenderShared>, id: usize, iterative: bool, bounces: u32) {
    let mut rng = StdRng::from_entropy();
    loop {
        if !shared.active() {
            break;
        }
        shared.registry.park_if_paused(id, || !shared.active());
        if !shared.active() {
            break;
        }
        let Some(claim) = shared.tiles.claim_next(false) else {
            if iterative {
                // Momentarily all claimed; wait for a tile to come back.
                shared.tiles.wait_for_ready(Duration::from_millis(50));
                continue;
            }
            break;
        };
        let tile = &claim.tile;

        let view = TraceView::capture(&shared.scene);
        let camera = shared.camera.lock().clone();
        let samples = if iterative {
            1
        } else {
            tile.total_samples.saturating_sub(tile.completed_samples).max(1)
        };
        let pixel_count = (tile.width * tile.height) as u64;

        let begun = Instant::now();
        let mut done = tile.completed_samples;
        for _ in 0..samples {
            let block = render_tile(&view, &camera, tile, 1, bounces, &mut rng);
            done += 1;
            let weight = 1.0 / done as f32;
            shared.fb.lock().blend_region(
                tile.start_x,
                tile.start_y,
                tile.width,
                tile.height,
                &block,
                weight,
            );
        }
        let rays = samples * pixel_count;
        shared.rays_fired.fetch_add(rays, Ordering::Relaxed);
        shared
            .trace_nanos
            .fetch_add(begun.elapsed().as_nanos() as u64, Ordering::Relaxed);
        shared.registry.add_samples(id, rays);
        shared.tiles.report_finished(&claim, samples);
    }
}

fn fire_callback(shared: &Arc<RenderShared>, kind: CallbackKind, start: Instant) {
    let cb = {
        let callbacks = shared.callbacks.lock();
        match kind {
            CallbackKind::OnStart => callbacks.on_start.clone(),
            CallbackKind::OnStop => callbacks.on_stop.clone(),
            CallbackKind::Status => callbacks.status.clone(),
            CallbackKind::StateChanged => callbacks.state_changed.clone(),
            CallbackKind::PassFinished => callbacks.pass_finished.clone(),
        }
    };
    let Some(cb) = cb else {
        return;
    };

    let tiles = shared.tiles.snapshot();
    let elapsed = start.elapsed().as_secs_f64();
    let pixel_samples = shared.registry.samples_total();
    let samples_per_sec = if elapsed > 0.0 {
        (pixel_samples as f64 / elapsed) as u64
    } else {
        0
    };
    let rays = shared.rays_fired.load(Ordering::Relaxed);
    let avg_ray_time_us = if rays > 0 {
        shared.trace_nanos.load(Ordering::Relaxed) as f64 / rays as f64 / 1000.0
    } else {
        0.0
    };
    let mut completed = 0u64;
    let mut target = 0u64;
    let mut remaining_pixel_samples = 0u64;
    for tile in &tiles {
        completed += tile.completed_samples;
        target += tile.total_samples;
        remaining_pixel_samples += tile.total_samples.saturating_sub(tile.completed_samples)
            * (tile.width * tile.height) as u64;
    }
    let completion = if target > 0 {
        completed as f64 / target as f64
    } else {
        0.0
    };
    let eta_ms = if samples_per_sec > 0 {
        remaining_pixel_samples * 1000 / samples_per_sec
    } else {
        0
    };

    let info = CallbackInfo {
        framebuffer: &shared.fb,
        tiles: &tiles,
        active_workers: shared.registry.active(),
        avg_ray_time_us,
        samples_per_sec,
        eta_ms,
        finished_passes: shared.finished_passes.load(Ordering::SeqCst),
        completion,
        paused: shared.registry.all_paused(),
        aborted: shared.aborted.load(Ordering::SeqCst),
    };
    cb(&info);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::TileState;
    use fray_core::{Face, Material, ObjectRef, VertexBuffer};
    use fray_math::Vec3;
    use std::sync::atomic::AtomicUsize;

    /// An emissive wall filling the whole view, so every primary ray reads
    /// exactly `emission * 2`.
    fn build_wall(scene: &Scene, width: u32, height: u32, emission: Vec3) {
        let mesh = scene.add_mesh("wall");
        scene.bind_vertex_buffer(
            mesh,
            VertexBuffer::new(
                vec![
                    Vec3::new(-50.0, -50.0, 5.0),
                    Vec3::new(50.0, -50.0, 5.0),
                    Vec3::new(50.0, 50.0, 5.0),
                    Vec3::new(-50.0, 50.0, 5.0),
                ],
                Vec::new(),
                Vec::new(),
            ),
        );
        scene.bind_faces(
            mesh,
            vec![Face::from_vertices(0, 1, 2), Face::from_vertices(0, 2, 3)],
        );
        let set = scene.add_material_set();
        scene.add_material(
            set,
            Material::Emissive {
                color: emission,
                strength: 2.0,
            },
        );
        let inst = scene.add_instance(ObjectRef::Mesh(mesh)).unwrap();
        scene.bind_material_set(inst, set);
        scene.finalize_mesh(mesh);
        let mut camera = Camera::new();
        camera.width = width;
        camera.height = height;
        camera.initialize();
        scene.add_camera(camera);
    }

    #[test]
    fn test_new_renderer_is_idle() {
        let renderer = Renderer::new();
        assert_eq!(renderer.state(), RunState::Idle);
        assert!(!RunState::Idle.is_active());
        assert!(RunState::Paused.is_active());
    }

    #[test]
    fn test_bounce_cap_enforced() {
        let renderer = Renderer::new();
        assert!(renderer.set_bounces(512));
        assert_eq!(renderer.prefs().bounces, 512);
        assert!(!renderer.set_bounces(513));
        assert_eq!(renderer.prefs().bounces, 512);
    }

    #[test]
    fn test_camera_selection_checks_bounds() {
        let renderer = Renderer::new();
        assert!(!renderer.select_camera(0));
        renderer.scene().add_camera(Camera::new());
        assert!(renderer.select_camera(0));
        assert!(!renderer.select_camera(1));
    }

    #[test]
    fn test_tile_order_from_pref_string() {
        let renderer = Renderer::new();
        renderer.set_tile_order("fromMiddle");
        assert_eq!(renderer.prefs().tile_order, TileOrder::FromMiddle);
        renderer.set_tile_order("garbage");
        assert_eq!(renderer.prefs().tile_order, TileOrder::Normal);
    }

    #[test]
    fn test_render_without_workers_is_a_noop() {
        let renderer = Renderer::new();
        renderer.scene().add_camera(Camera::new());
        renderer.configure(|p| p.threads = 0);
        renderer.render();
        assert_eq!(renderer.state(), RunState::Idle);
        assert_eq!(renderer.result().lock().width(), 0);
    }

    #[test]
    fn test_render_without_camera_is_a_noop() {
        let renderer = Renderer::new();
        renderer.configure(|p| p.threads = 1);
        renderer.render();
        assert_eq!(renderer.state(), RunState::Idle);
    }

    #[test]
    fn test_stop_when_idle_returns_immediately() {
        let renderer = Renderer::new();
        renderer.stop();
        assert_eq!(renderer.state(), RunState::Idle);
    }

    #[test]
    fn test_toggle_pause_outside_render_is_ignored() {
        let renderer = Renderer::new();
        renderer.toggle_pause();
        assert_eq!(renderer.state(), RunState::Idle);
    }

    #[test]
    fn test_batch_render_completes_all_tiles() {
        let renderer = Renderer::new();
        build_wall(renderer.scene(), 64, 64, Vec3::ONE);
        renderer.configure(|p| {
            p.threads = 1;
            p.samples = 2;
            p.tile_width = 32;
            p.tile_height = 32;
            p.bounces = 2;
        });

        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let all_finished = Arc::new(AtomicBool::new(false));
        let completion_full = Arc::new(AtomicBool::new(false));
        let tile_count = Arc::new(AtomicUsize::new(0));
        {
            let started = Arc::clone(&started);
            renderer.set_callback(CallbackKind::OnStart, move |_| {
                started.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let stopped = Arc::clone(&stopped);
            let all_finished = Arc::clone(&all_finished);
            let completion_full = Arc::clone(&completion_full);
            let tile_count = Arc::clone(&tile_count);
            renderer.set_callback(CallbackKind::OnStop, move |info| {
                stopped.fetch_add(1, Ordering::SeqCst);
                tile_count.store(info.tiles.len(), Ordering::SeqCst);
                all_finished.store(
                    info.tiles.iter().all(|t| t.state == TileState::Finished),
                    Ordering::SeqCst,
                );
                completion_full.store(info.completion >= 1.0, Ordering::SeqCst);
            });
        }

        renderer.render();

        assert_eq!(renderer.state(), RunState::Idle);
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert_eq!(tile_count.load(Ordering::SeqCst), 4);
        assert!(all_finished.load(Ordering::SeqCst));
        assert!(completion_full.load(Ordering::SeqCst));

        let fb = renderer.result();
        let fb = fb.lock();
        assert_eq!((fb.width(), fb.height()), (64, 64));
        for (x, y) in [(0, 0), (32, 32), (63, 63)] {
            let px = fb.get_pixel(x, y);
            assert!((px[0] - 2.0).abs() < 1e-3, "pixel ({x},{y}) read {px:?}");
            assert_eq!(px[3], 1.0);
        }
    }

    #[test]
    fn test_batch_render_with_multiple_workers_and_random_order() {
        let renderer = Renderer::new();
        build_wall(renderer.scene(), 64, 64, Vec3::new(1.0, 0.5, 0.25));
        renderer.set_tile_order("random");
        renderer.configure(|p| {
            p.threads = 2;
            p.samples = 1;
            p.tile_width = 8;
            p.tile_height = 8;
        });

        renderer.render();

        assert_eq!(renderer.state(), RunState::Idle);
        let fb = renderer.result();
        let fb = fb.lock();
        for (x, y) in [(0, 0), (5, 60), (31, 31), (63, 0)] {
            let px = fb.get_pixel(x, y);
            assert!((px[0] - 2.0).abs() < 1e-3, "pixel ({x},{y}) read {px:?}");
            assert!((px[1] - 1.0).abs() < 1e-3);
            assert!((px[2] - 0.5).abs() < 1e-3);
        }
    }

    #[test]
    fn test_interactive_render_reaches_target_and_idles() {
        let renderer = Renderer::new();
        build_wall(renderer.scene(), 64, 64, Vec3::ONE);
        renderer.configure(|p| {
            p.threads = 2;
            p.samples = 3;
            p.tile_width = 32;
            p.tile_height = 32;
        });

        let passes = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let aborted = Arc::new(AtomicBool::new(true));
        {
            let passes = Arc::clone(&passes);
            renderer.set_callback(CallbackKind::PassFinished, move |_| {
                passes.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let stopped = Arc::clone(&stopped);
            let aborted = Arc::clone(&aborted);
            renderer.set_callback(CallbackKind::OnStop, move |info| {
                stopped.fetch_add(1, Ordering::SeqCst);
                aborted.store(info.aborted, Ordering::SeqCst);
            });
        }

        renderer.start_interactive();
        let begun = Instant::now();
        while stopped.load(Ordering::SeqCst) == 0 {
            assert!(
                begun.elapsed() < Duration::from_secs(30),
                "interactive render never reached its target"
            );
            std::thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(renderer.state(), RunState::Idle);
        assert_eq!(passes.load(Ordering::SeqCst), 3);
        assert!(!aborted.load(Ordering::SeqCst));
        let fb = renderer.result();
        let fb = fb.lock();
        let px = fb.get_pixel(32, 32);
        assert!((px[0] - 2.0).abs() < 1e-3, "read {px:?}");
    }

    #[test]
    fn test_stop_aborts_interactive_render() {
        let renderer = Renderer::new();
        build_wall(renderer.scene(), 128, 128, Vec3::ONE);
        renderer.configure(|p| {
            p.threads = 2;
            p.samples = 1_000_000;
            p.tile_width = 32;
            p.tile_height = 32;
        });

        let status_seen = Arc::new(AtomicBool::new(false));
        let aborted = Arc::new(AtomicBool::new(false));
        {
            let status_seen = Arc::clone(&status_seen);
            renderer.set_callback(CallbackKind::Status, move |_| {
                status_seen.store(true, Ordering::SeqCst);
            });
        }
        {
            let aborted = Arc::clone(&aborted);
            renderer.set_callback(CallbackKind::OnStop, move |info| {
                aborted.store(info.aborted, Ordering::SeqCst);
            });
        }

        renderer.start_interactive();
        let begun = Instant::now();
        while !status_seen.load(Ordering::SeqCst) {
            assert!(begun.elapsed() < Duration::from_secs(10));
            std::thread::sleep(Duration::from_millis(5));
        }

        renderer.stop();
        assert_eq!(renderer.state(), RunState::Idle);
        assert!(aborted.load(Ordering::SeqCst));
    }

    #[test]
    fn test_restart_shows_scene_edits() {
        let renderer = Renderer::new();
        build_wall(renderer.scene(), 128, 128, Vec3::new(1.0, 0.0, 0.0));
        renderer.configure(|p| {
            p.threads = 2;
            p.samples = 1_000_000;
            p.tile_width = 32;
            p.tile_height = 32;
        });

        renderer.start_interactive();
        let begun = Instant::now();
        loop {
            {
                let fb = renderer.result();
                let fb = fb.lock();
                if fb.width() == 128 && fb.get_pixel(64, 64)[0] > 1.9 {
                    break;
                }
            }
            assert!(
                begun.elapsed() < Duration::from_secs(30),
                "initial render never converged"
            );
            std::thread::sleep(Duration::from_millis(5));
        }

        // Swap the light to green; the restarted accumulation must not keep
        // any of the red frame.
        assert!(renderer.scene().update_material(
            0,
            0,
            Material::Emissive {
                color: Vec3::new(0.0, 1.0, 0.0),
                strength: 2.0,
            }
        ));
        renderer.restart_interactive();

        let begun = Instant::now();
        loop {
            {
                let fb = renderer.result();
                let fb = fb.lock();
                let px = fb.get_pixel(64, 64);
                if px[1] > 1.9 && px[0] < 0.1 {
                    break;
                }
            }
            assert!(
                begun.elapsed() < Duration::from_secs(30),
                "restart kept stale pixels"
            );
            std::thread::sleep(Duration::from_millis(5));
        }

        renderer.stop();
        assert_eq!(renderer.state(), RunState::Idle);
    }

    #[test]
    fn test_restart_applies_new_resolution() {
        let renderer = Renderer::new();
        build_wall(renderer.scene(), 64, 64, Vec3::ONE);
        renderer.configure(|p| {
            p.threads = 2;
            p.samples = 1_000_000;
            p.tile_width = 32;
            p.tile_height = 32;
        });

        let status_seen = Arc::new(AtomicBool::new(false));
        {
            let status_seen = Arc::clone(&status_seen);
            renderer.set_callback(CallbackKind::Status, move |_| {
                status_seen.store(true, Ordering::SeqCst);
            });
        }

        renderer.start_interactive();
        let begun = Instant::now();
        while !status_seen.load(Ordering::SeqCst) {
            assert!(begun.elapsed() < Duration::from_secs(10));
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(renderer.scene().update_camera(0, |c| {
            c.width = 96;
            c.height = 64;
        }));
        renderer.restart_interactive();

        {
            let fb = renderer.result();
            let fb = fb.lock();
            assert_eq!((fb.width(), fb.height()), (96, 64));
        }
        let tiles = renderer.shared.tiles.snapshot();
        let covered: u64 = tiles.iter().map(|t| (t.width * t.height) as u64).sum();
        assert_eq!(covered, 96 * 64);

        renderer.stop();
        assert_eq!(renderer.state(), RunState::Idle);
    }

    #[test]
    fn test_restart_keeps_resolution_override() {
        let renderer = Renderer::new();
        build_wall(renderer.scene(), 64, 48, Vec3::ONE);
        renderer.configure(|p| {
            p.threads = 2;
            p.samples = 1_000_000;
            p.tile_width = 16;
            p.tile_height = 16;
            p.override_width = Some(32);
            p.override_height = Some(32);
        });

        renderer.start_interactive();
        let begun = Instant::now();
        while renderer.shared.registry.samples_total() == 0 {
            assert!(begun.elapsed() < Duration::from_secs(10));
            std::thread::sleep(Duration::from_millis(5));
        }
        {
            let fb = renderer.result();
            let fb = fb.lock();
            assert_eq!((fb.width(), fb.height()), (32, 32));
        }

        // The camera never changed, so this restart must not resize: the
        // override stays in charge of the output resolution.
        renderer.restart_interactive();
        {
            let fb = renderer.result();
            let fb = fb.lock();
            assert_eq!((fb.width(), fb.height()), (32, 32));
        }
        let covered: u64 = renderer
            .shared
            .tiles
            .snapshot()
            .iter()
            .map(|t| (t.width * t.height) as u64)
            .sum();
        assert_eq!(covered, 32 * 32);
        assert_eq!(renderer.shared.camera.lock().width, 32);

        renderer.stop();
        assert_eq!(renderer.state(), RunState::Idle);
    }

    #[test]
    fn test_restart_same_resolution_resets_accumulation() {
        let renderer = Renderer::new();
        build_wall(renderer.scene(), 64, 64, Vec3::ONE);
        renderer.configure(|p| {
            p.threads = 2;
            p.samples = 1_000_000;
            p.tile_width = 32;
            p.tile_height = 32;
        });

        renderer.start_interactive();
        let begun = Instant::now();
        while renderer.shared.registry.samples_total() == 0 {
            assert!(begun.elapsed() < Duration::from_secs(10));
            std::thread::sleep(Duration::from_millis(5));
        }

        // Park all workers so the post-restart state can be read at a quiet
        // point, the way a resize would.
        renderer.toggle_pause();
        assert!(renderer.shared.registry.wait_all_parked(|| false));
        let rects_before: Vec<_> = renderer
            .shared
            .tiles
            .snapshot()
            .iter()
            .map(|t| (t.start_x, t.start_y, t.width, t.height))
            .collect();

        renderer.restart_interactive();

        assert_eq!(renderer.shared.finished_passes.load(Ordering::SeqCst), 1);
        assert_eq!(renderer.shared.registry.samples_total(), 0);
        let tiles = renderer.shared.tiles.snapshot();
        let rects_after: Vec<_> = tiles
            .iter()
            .map(|t| (t.start_x, t.start_y, t.width, t.height))
            .collect();
        assert_eq!(rects_before, rects_after);
        assert!(tiles.iter().all(|t| t.completed_samples == 0));
        {
            let fb = renderer.result();
            let fb = fb.lock();
            for (x, y) in [(0, 0), (32, 32), (63, 63)] {
                assert_eq!(fb.get_pixel(x, y), [0.0; 4]);
            }
        }

        renderer.toggle_pause();
        renderer.stop();
        assert_eq!(renderer.state(), RunState::Idle);
    }

    #[test]
    fn test_pause_parks_workers_and_resume_continues() {
        let renderer = Renderer::new();
        build_wall(renderer.scene(), 64, 64, Vec3::ONE);
        renderer.configure(|p| {
            p.threads = 2;
            p.samples = 1_000_000;
            p.tile_width = 32;
            p.tile_height = 32;
        });

        let paused_seen = Arc::new(AtomicBool::new(false));
        let status_seen = Arc::new(AtomicBool::new(false));
        {
            let paused_seen = Arc::clone(&paused_seen);
            let status_seen = Arc::clone(&status_seen);
            renderer.set_callback(CallbackKind::Status, move |info| {
                status_seen.store(true, Ordering::SeqCst);
                if info.paused {
                    paused_seen.store(true, Ordering::SeqCst);
                }
            });
        }

        renderer.start_interactive();
        let begun = Instant::now();
        while !status_seen.load(Ordering::SeqCst) {
            assert!(begun.elapsed() < Duration::from_secs(10));
            std::thread::sleep(Duration::from_millis(5));
        }

        renderer.toggle_pause();
        assert_eq!(renderer.state(), RunState::Paused);
        let begun = Instant::now();
        while !paused_seen.load(Ordering::SeqCst) {
            assert!(begun.elapsed() < Duration::from_secs(10));
            std::thread::sleep(Duration::from_millis(5));
        }

        renderer.toggle_pause();
        assert_eq!(renderer.state(), RunState::Rendering);
        renderer.stop();
        assert_eq!(renderer.state(), RunState::Idle);
    }

    #[test]
    fn test_stop_while_paused_unparks_and_tears_down() {
        let renderer = Renderer::new();
        build_wall(renderer.scene(), 64, 64, Vec3::ONE);
        renderer.configure(|p| {
            p.threads = 2;
            p.samples = 1_000_000;
            p.tile_width = 32;
            p.tile_height = 32;
        });

        let aborted = Arc::new(AtomicBool::new(false));
        {
            let aborted = Arc::clone(&aborted);
            renderer.set_callback(CallbackKind::OnStop, move |info| {
                aborted.store(info.aborted, Ordering::SeqCst);
            });
        }

        renderer.start_interactive();
        let begun = Instant::now();
        while renderer.shared.registry.samples_total() == 0 {
            assert!(begun.elapsed() < Duration::from_secs(10));
            std::thread::sleep(Duration::from_millis(5));
        }

        renderer.toggle_pause();
        assert!(renderer.shared.registry.wait_all_parked(|| false));

        // Stop without resuming first: parked workers have to wake up and
        // leave through the teardown path.
        renderer.stop();
        assert_eq!(renderer.state(), RunState::Idle);
        assert!(aborted.load(Ordering::SeqCst));
    }
}
