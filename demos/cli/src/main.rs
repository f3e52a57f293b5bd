use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::info;
use nalgebra::Point3;

use hexpave::{
    config::MeshDict,
    geom::{Aabb, TriSurface},
    mesh::PolyMesh,
    pipeline::MeshGenerator,
};

/// Hex-dominant Cartesian volume mesher
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    cmd: Command,

    /// Output directory for the mesh files
    #[clap(short, long, default_value = "mesh")]
    out: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Mesh a triangulated surface from a Wavefront OBJ file
    Mesh {
        /// Input `.obj` file; `usemtl` / `g` groups become patches
        #[clap(short, long)]
        input: PathBuf,

        /// JSON meshing dictionary; defaults apply if omitted
        #[clap(short, long)]
        dict: Option<PathBuf>,
    },

    /// Mesh a built-in unit cube (no input files needed)
    Demo {
        /// Background cell size
        #[clap(short, long, default_value_t = 0.2)]
        size: f64,
    },
}

/// Reads the subset of Wavefront OBJ the mesher cares about
///
/// `v` lines become points, `f` lines become triangles (polygons are
/// fanned), and the active `usemtl` or `g` name tags each triangle's
/// patch.  Normals and texture coordinates are ignored.
fn load_obj(path: &Path) -> Result<TriSurface> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("could not open {path:?}"))?;

    let mut points = vec![];
    let mut tris: Vec<([usize; 3], usize)> = vec![];
    let mut patch_names: Vec<String> = vec![];
    let mut patch = 0;
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let mut words = line.split_whitespace();
        match words.next() {
            Some("v") => {
                let coord = |w: Option<&str>| -> Result<f64> {
                    Ok(w.context("truncated vertex")?.parse()?)
                };
                points.push(Point3::new(
                    coord(words.next())?,
                    coord(words.next())?,
                    coord(words.next())?,
                ));
            }
            Some("f") => {
                let verts = words
                    .map(|w| {
                        let i: usize = w
                            .split('/')
                            .next()
                            .unwrap_or(w)
                            .parse()
                            .with_context(|| {
                                format!("bad face index on line {}", n + 1)
                            })?;
                        Ok(i - 1)
                    })
                    .collect::<Result<Vec<usize>>>()?;
                if verts.len() < 3 {
                    bail!("face with fewer than 3 vertices on line {}", n + 1);
                }
                for i in 1..verts.len() - 1 {
                    tris.push(([verts[0], verts[i], verts[i + 1]], patch));
                }
            }
            Some("usemtl") | Some("g") => {
                let name = words.next().unwrap_or("surface").to_owned();
                patch = patch_names
                    .iter()
                    .position(|p| p == &name)
                    .unwrap_or_else(|| {
                        patch_names.push(name);
                        patch_names.len() - 1
                    });
            }
            _ => (),
        }
    }
    if patch_names.is_empty() {
        patch_names.push("surface".to_owned());
    }

    let mut surface = TriSurface::new(points, vec![]);
    surface.patch_names = patch_names;
    for (verts, patch) in tris {
        surface.triangles.push(hexpave::geom::Triangle { verts, patch });
    }
    info!(
        "Loaded {} triangles in {} patches from {path:?}",
        surface.triangles.len(),
        surface.patch_names.len()
    );
    Ok(surface)
}

/// Writes the mesh as plain text files (points, faces, owner, neighbour,
/// boundary) into `dir`
fn write_mesh(mesh: &mut PolyMesh, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let open = |name: &str| -> Result<std::io::BufWriter<std::fs::File>> {
        Ok(std::io::BufWriter::new(std::fs::File::create(
            dir.join(name),
        )?))
    };

    let mut f = open("points")?;
    writeln!(f, "{}", mesh.points.len())?;
    for p in &mesh.points {
        writeln!(f, "{} {} {}", p.x, p.y, p.z)?;
    }

    let mut f = open("faces")?;
    writeln!(f, "{}", mesh.faces.len())?;
    for loop_ in &mesh.faces {
        write!(f, "{}", loop_.len())?;
        for p in loop_ {
            write!(f, " {p}")?;
        }
        writeln!(f)?;
    }

    let addressing = mesh.addressing().clone();
    let mut f = open("owner")?;
    writeln!(f, "{}", addressing.owner.len())?;
    for c in &addressing.owner {
        writeln!(f, "{c}")?;
    }

    let n_internal = mesh.n_internal_faces();
    let mut f = open("neighbour")?;
    writeln!(f, "{n_internal}")?;
    for n in addressing.neighbour.iter().take(n_internal) {
        writeln!(f, "{}", n.context("internal face without neighbour")?)?;
    }

    let mut f = open("boundary")?;
    writeln!(f, "{}", mesh.boundaries.len())?;
    for b in &mesh.boundaries {
        writeln!(f, "{} {} {} {}", b.name, b.patch_type, b.start, b.size)?;
    }
    Ok(())
}

fn run(surface: TriSurface, dict: MeshDict, out: &Path) -> Result<()> {
    let now = Instant::now();
    let mut generator = MeshGenerator::new(surface, dict)?;
    generator.generate()?;
    info!("Generated the mesh in {:?}", now.elapsed());

    let defects = generator.defects();
    if !defects.is_empty() {
        for entry in defects.entries() {
            log::warn!("defect: {entry}");
        }
    }

    let mut mesh = generator.mesh().clone();
    info!(
        "{} points, {} faces, {} cells, {} patches",
        mesh.points.len(),
        mesh.faces.len(),
        mesh.cells.len(),
        mesh.boundaries.len()
    );
    write_mesh(&mut mesh, out)?;
    info!("Wrote the mesh to {out:?}");
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Mesh { input, dict } => {
            let surface = load_obj(&input)?;
            let dict: MeshDict = match dict {
                Some(path) => serde_json::from_str(
                    &std::fs::read_to_string(&path)
                        .with_context(|| format!("could not read {path:?}"))?,
                )?,
                None => MeshDict::default(),
            };
            run(surface, dict, &args.out)
        }
        Command::Demo { size } => {
            let surface = TriSurface::hexahedron(&Aabb::new(
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 1.0, 1.0),
            ));
            let dict: MeshDict = serde_json::from_str(&format!(
                r#"{{ "maxCellSize": {size} }}"#
            ))?;
            run(surface, dict, &args.out)
        }
    }
}
