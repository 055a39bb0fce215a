//! Command line front end: batch renders to PNG, render node mode, and
//! node control.

use anyhow::{bail, Context, Result};
use fray_core::{
    Background, Camera, EulerAngles, Face, Framebuffer, Material, ObjectRef, Scene, VertexBuffer,
};
use fray_math::{Mat4, Vec3};
use fray_proto::{parse_node_list, shutdown_nodes, DEFAULT_PORT};
use fray_renderer::{CallbackKind, Renderer};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args: Vec<String> = env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("render") => cmd_render(&args[2..]),
        Some("worker") => cmd_worker(&args[2..]),
        Some("shutdown") => cmd_shutdown(&args[2..]),
        None | Some("help") | Some("-h") | Some("--help") => {
            print_usage(&args[0]);
            Ok(())
        }
        Some(other) => {
            print_usage(&args[0]);
            bail!("unknown command: {other}");
        }
    }
}

fn print_usage(prog: &str) {
    println!("Usage: {prog} <command> [options]");
    println!();
    println!("Commands:");
    println!("  render      Render the demo scene to a PNG");
    println!("    --width N       output width (default 1280)");
    println!("    --height N      output height (default 800)");
    println!("    --samples N     samples per pixel (default 25)");
    println!("    --bounces N     path depth limit (default 20)");
    println!("    --threads N     local render threads (default: all cores)");
    println!("    --tile N        tile edge length (default 64)");
    println!("    --order NAME    tile order: normal, random, topToBottom,");
    println!("                    fromMiddle, toMiddle");
    println!("    --nodes LIST    comma separated render nodes (host[:port])");
    println!("    -o FILE         output path (default render.png)");
    println!("  worker      Run as a render node");
    println!("    --port N        listen port (default {DEFAULT_PORT})");
    println!("    --threads N     render threads (default: all cores)");
    println!("  shutdown    Ask render nodes to exit");
    println!("    <LIST>          the nodes to shut down");
}

struct RenderOpts {
    width: u32,
    height: u32,
    samples: u64,
    bounces: u32,
    threads: Option<usize>,
    tile: u32,
    order: Option<String>,
    nodes: Option<String>,
    output: PathBuf,
}

impl Default for RenderOpts {
    fn default() -> Self {
        RenderOpts {
            width: 1280,
            height: 800,
            samples: 25,
            bounces: 20,
            threads: None,
            tile: 64,
            order: None,
            nodes: None,
            output: PathBuf::from("render.png"),
        }
    }
}

fn take_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .with_context(|| format!("{flag} needs a value"))
}

fn parse_render_opts(args: &[String]) -> Result<RenderOpts> {
    let mut opts = RenderOpts::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--width" => opts.width = take_value(args, &mut i, "--width")?.parse()?,
            "--height" => opts.height = take_value(args, &mut i, "--height")?.parse()?,
            "--samples" => opts.samples = take_value(args, &mut i, "--samples")?.parse()?,
            "--bounces" => opts.bounces = take_value(args, &mut i, "--bounces")?.parse()?,
            "--threads" => opts.threads = Some(take_value(args, &mut i, "--threads")?.parse()?),
            "--tile" => opts.tile = take_value(args, &mut i, "--tile")?.parse()?,
            "--order" => opts.order = Some(take_value(args, &mut i, "--order")?.to_string()),
            "--nodes" => opts.nodes = Some(take_value(args, &mut i, "--nodes")?.to_string()),
            "-o" | "--output" => opts.output = PathBuf::from(take_value(args, &mut i, "-o")?),
            other => bail!("unknown render option: {other}"),
        }
        i += 1;
    }
    Ok(opts)
}

fn cmd_render(args: &[String]) -> Result<()> {
    let opts = parse_render_opts(args)?;
    let renderer = Renderer::new();
    build_demo_scene(renderer.scene());

    if !renderer.set_bounces(opts.bounces) {
        bail!("bounce limit {} is too high", opts.bounces);
    }
    if let Some(order) = &opts.order {
        renderer.set_tile_order(order);
    }
    renderer.configure(|p| {
        p.samples = opts.samples;
        p.tile_width = opts.tile;
        p.tile_height = opts.tile;
        p.override_width = Some(opts.width);
        p.override_height = Some(opts.height);
        if let Some(threads) = opts.threads {
            p.threads = threads;
        }
        p.node_list = opts.nodes.clone();
    });

    // Progress line at every ten percent.
    let last_pct = Arc::new(AtomicU64::new(0));
    renderer.set_callback(CallbackKind::Status, move |info| {
        let pct = (info.completion * 100.0) as u64;
        let prev = last_pct.swap(pct, Ordering::SeqCst);
        if pct / 10 > prev / 10 {
            log::info!(
                "{pct}% done, {} samples/s, eta {}s",
                info.samples_per_sec,
                info.eta_ms / 1000
            );
        }
    });

    renderer.render();
    let fb = renderer.result().snapshot();
    if fb.width() == 0 {
        bail!("render produced no image");
    }
    save_png(&fb, &opts.output)?;
    log::info!("Wrote {}", opts.output.display());
    Ok(())
}

fn cmd_worker(args: &[String]) -> Result<()> {
    let mut port = DEFAULT_PORT;
    let mut threads = 0;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--port" => port = take_value(args, &mut i, "--port")?.parse()?,
            "--threads" => threads = take_value(args, &mut i, "--threads")?.parse()?,
            other => bail!("unknown worker option: {other}"),
        }
        i += 1;
    }
    fray_renderer::serve(port, threads)?;
    Ok(())
}

fn cmd_shutdown(args: &[String]) -> Result<()> {
    if args.is_empty() {
        bail!("shutdown needs a node list");
    }
    let list = args.join(" ");
    let nodes = parse_node_list(&list);
    if nodes.is_empty() {
        bail!("no valid nodes in {list:?}");
    }
    shutdown_nodes(&nodes);
    Ok(())
}

fn save_png(fb: &Framebuffer, path: &Path) -> Result<()> {
    let data = fb.to_rgba8();
    let image = image::RgbaImage::from_raw(fb.width(), fb.height(), data)
        .context("framebuffer did not match its dimensions")?;
    image
        .save(path)
        .with_context(|| format!("saving {}", path.display()))?;
    Ok(())
}

/// Three spheres under an area light, over a gray floor.
fn build_demo_scene(scene: &Scene) {
    let floor_set = scene.add_material_set();
    scene.add_material(
        floor_set,
        Material::Diffuse {
            color: Vec3::splat(0.55),
        },
    );
    let floor = scene.add_mesh("floor");
    scene.bind_vertex_buffer(
        floor,
        VertexBuffer::new(
            vec![
                Vec3::new(-12.0, 0.0, -12.0),
                Vec3::new(12.0, 0.0, -12.0),
                Vec3::new(12.0, 0.0, 12.0),
                Vec3::new(-12.0, 0.0, 12.0),
            ],
            Vec::new(),
            Vec::new(),
        ),
    );
    scene.bind_faces(
        floor,
        vec![Face::from_vertices(0, 1, 2), Face::from_vertices(0, 2, 3)],
    );
    scene.finalize_mesh(floor);
    let floor_inst = scene
        .add_instance(ObjectRef::Mesh(floor))
        .expect("Failed to instance the floor mesh");
    scene.bind_material_set(floor_inst, floor_set);

    let light_set = scene.add_material_set();
    scene.add_material(
        light_set,
        Material::Emissive {
            color: Vec3::ONE,
            strength: 10.0,
        },
    );
    let light = scene.add_mesh("light");
    scene.bind_vertex_buffer(
        light,
        VertexBuffer::new(
            vec![
                Vec3::new(-1.5, 4.0, 0.5),
                Vec3::new(1.5, 4.0, 0.5),
                Vec3::new(1.5, 4.0, 3.0),
                Vec3::new(-1.5, 4.0, 3.0),
            ],
            Vec::new(),
            Vec::new(),
        ),
    );
    scene.bind_faces(
        light,
        vec![Face::from_vertices(0, 1, 2), Face::from_vertices(0, 2, 3)],
    );
    scene.finalize_mesh(light);
    let light_inst = scene
        .add_instance(ObjectRef::Mesh(light))
        .expect("Failed to instance the light mesh");
    scene.bind_material_set(light_inst, light_set);

    let materials = [
        Material::Diffuse {
            color: Vec3::new(0.8, 0.25, 0.2),
        },
        Material::Glass {
            color: Vec3::ONE,
            ior: 1.45,
        },
        Material::Metal {
            color: Vec3::new(0.85, 0.85, 0.9),
            roughness: 0.05,
        },
    ];
    let positions = [
        Vec3::new(-2.2, 1.0, 1.8),
        Vec3::new(0.0, 1.0, 2.2),
        Vec3::new(2.2, 1.0, 1.8),
    ];
    for (material, position) in materials.into_iter().zip(positions) {
        let set = scene.add_material_set();
        scene.add_material(set, material);
        let sphere = scene.add_sphere(1.0);
        let inst = scene
            .add_instance(ObjectRef::Sphere(sphere))
            .expect("Failed to instance a sphere");
        scene.set_transform(inst, Mat4::from_translation(position));
        scene.bind_material_set(inst, set);
    }

    scene.set_background(Background::SkyGradient);

    let mut camera = Camera::new();
    camera.fov = 55.0;
    camera.position = Vec3::new(0.0, 1.6, -5.5);
    camera.orientation = EulerAngles::new(0.0, 0.08, 0.0);
    camera.initialize();
    scene.add_camera(camera);
}
