//! Render orchestration: tile scheduling, worker threads, the interactive
//! state machine and network render dispatch.
//!
//! [`Renderer`] is the entry point. Feed its [`fray_core::Scene`], set
//! preferences, then either [`Renderer::render`] for a blocking batch render
//! or [`Renderer::start_interactive`] for a progressive one that refines
//! until stopped. Render nodes run [`worker_node::serve`] and take tiles
//! over TCP.

mod remote;

pub mod renderer;
pub mod tile;
pub mod trace;
pub mod worker;
pub mod worker_node;

pub use renderer::{CallbackInfo, CallbackKind, Prefs, Renderer, RunState, MAX_BOUNCES};
pub use tile::{quantize, Tile, TileClaim, TileOrder, TileSet, TileState};
pub use trace::TraceView;
pub use worker::{WorkerKind, WorkerRegistry};
pub use worker_node::{serve, serve_listener, SessionEnd};
