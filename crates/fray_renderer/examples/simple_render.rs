//! Minimal batch render.
//!
//! Builds a three-sphere scene, renders it on four threads and writes the
//! result to a PPM file.

use fray_core::{Background, Camera, EulerAngles, Material, ObjectRef, Scene};
use fray_math::{Mat4, Vec3};
use fray_renderer::{CallbackKind, Renderer};
use std::fs::File;
use std::io::{BufWriter, Write};

fn main() {
    println!("fray - simple render");

    let renderer = Renderer::new();
    build_scene(renderer.scene());
    renderer.configure(|p| {
        p.threads = 4;
        p.samples = 16;
        p.override_width = Some(640);
        p.override_height = Some(360);
    });
    renderer.set_callback(CallbackKind::Status, |info| {
        print!("\r{:3.0}% complete", info.completion * 100.0);
        let _ = std::io::stdout().flush();
    });

    let start = std::time::Instant::now();
    renderer.render();
    println!("\nRendered in {:?}", start.elapsed());

    let fb = renderer.result().snapshot();
    save_ppm(&fb, "simple_render.ppm").expect("failed to save image");
    println!("Saved to simple_render.ppm");
}

fn build_scene(scene: &Scene) {
    let materials = [
        Material::Diffuse {
            color: Vec3::new(0.6, 0.6, 0.6),
        },
        Material::Diffuse {
            color: Vec3::new(0.7, 0.3, 0.25),
        },
        Material::Metal {
            color: Vec3::new(0.9, 0.9, 0.95),
            roughness: 0.1,
        },
        Material::Glass {
            color: Vec3::ONE,
            ior: 1.5,
        },
    ];
    let placements = [
        // Ground is just a very large sphere.
        (100.0, Vec3::new(0.0, -100.0, 0.0)),
        (1.0, Vec3::new(-2.2, 1.0, 0.5)),
        (1.0, Vec3::new(0.0, 1.0, 1.0)),
        (1.0, Vec3::new(2.2, 1.0, 0.5)),
    ];
    for (material, (radius, position)) in materials.into_iter().zip(placements) {
        let set = scene.add_material_set();
        scene.add_material(set, material);
        let sphere = scene.add_sphere(radius);
        let inst = scene.add_instance(ObjectRef::Sphere(sphere)).unwrap();
        scene.set_transform(inst, Mat4::from_translation(position));
        scene.bind_material_set(inst, set);
    }
    scene.set_background(Background::SkyGradient);

    let mut camera = Camera::new();
    camera.fov = 50.0;
    camera.position = Vec3::new(0.0, 1.8, -6.0);
    camera.orientation = EulerAngles::new(0.0, 0.1, 0.0);
    camera.initialize();
    scene.add_camera(camera);
}

fn save_ppm(fb: &fray_core::Framebuffer, path: &str) -> std::io::Result<()> {
    let data = fb.to_rgba8();
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);
    writeln!(out, "P3")?;
    writeln!(out, "{} {}", fb.width(), fb.height())?;
    writeln!(out, "255")?;
    for px in data.chunks_exact(4) {
        writeln!(out, "{} {} {}", px[0], px[1], px[2])?;
    }
    Ok(())
}
