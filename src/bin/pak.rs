//! `pak` - the CLI surface over `racpak`.
//!
//! A thin driver: argument parsing and progress/error printing live here,
//! not in the library. Subcommands: `unpack`, `pack`, `test`, `decompress`,
//! `compress`.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use racpak::bank::schema::Schema;
use racpak::bank::value::{AttributeType, Value};
use racpak::bank::{Bank, Forest};
use racpak::compression;
use racpak::error::context;
use racpak::game::{Game, Region};
use racpak::level::core::{Assembler, ClassAsset};
use racpak::level::mesh::{Face, Material, Mesh, MeshFlags, SubMesh, Vertex};
use racpak::level::tfrag::Tfrag;
use racpak::Error;

#[derive(Parser)]
#[command(name = "pak")]
#[command(about = "Asset packing/unpacking engine for a PS2 action-adventure level format")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Unpack a level-core file into a loose asset bank directory.
    Unpack {
        input: PathBuf,
        #[arg(short = 'o')]
        output: PathBuf,
        #[arg(short = 'g')]
        game: Option<Game>,
        #[arg(short = 'r')]
        region: Option<Region>,
        /// Create a per-level subdirectory under `-o` named after the input file stem.
        #[arg(short = 's')]
        auto_subdir: bool,
    },
    /// Pack one or more asset banks into a level-core file.
    Pack {
        banks: Vec<PathBuf>,
        #[arg(short = 'a')]
        asset_link: String,
        #[arg(short = 'o')]
        output: PathBuf,
        #[arg(short = 'g')]
        game: Option<Game>,
        #[arg(short = 'r')]
        region: Option<Region>,
        /// Freeform hint for which format variant to emit.
        #[arg(short = 'h', long = "hint")]
        hint: Option<String>,
    },
    /// Load a bank (and resolve an optional asset link) to check it parses.
    Test {
        bank: PathBuf,
        #[arg(short = 'a')]
        asset_link: Option<String>,
        #[arg(short = 'f')]
        filter: Option<String>,
    },
    /// Strip the WAD envelope off a compressed blob.
    Decompress {
        input: PathBuf,
        #[arg(short = 'o')]
        output: PathBuf,
        #[arg(short = 'x')]
        offset: Option<u64>,
    },
    /// Wrap a blob in the WAD envelope.
    Compress {
        input: PathBuf,
        #[arg(short = 'o')]
        output: PathBuf,
    },
}

/// The application-level asset-bank schema. Not part of the library: the
/// schema is something each game/tool defines for itself, governing which
/// attribute and child types each asset tag allows.
///
/// `positions`/`indices`/`color` are the bare-bones geometry a bank needs
/// to carry for `pak pack` to rebuild a `Mesh` (§2's C5 -> C8..C11 data
/// flow): a flat vertex list, a flat triangle index list, and a single
/// flat material color. `data` is kept alongside for round-tripping
/// `pak unpack`'s raw dump, even though `pak pack` doesn't read it back.
fn level_schema() -> Schema {
    let geometry_attrs = |with_o_class: bool| -> Vec<(&'static str, AttributeType)> {
        let mut attrs = vec![
            ("data", AttributeType::FileReference),
            ("positions", AttributeType::Array(Box::new(AttributeType::Vec3))),
            ("indices", AttributeType::Array(Box::new(AttributeType::Int))),
            ("color", AttributeType::Color),
        ];
        if with_o_class {
            attrs.insert(0, ("o_class", AttributeType::Int));
        }
        attrs
    };

    let mut schema = Schema::new();
    schema
        .register("World", vec![("name", AttributeType::String)], vec!["Moby", "Tie", "Shrub", "Tfrag"])
        .expect("built-in schema is well-formed");
    schema.register("Moby", geometry_attrs(true), vec![]).expect("built-in schema is well-formed");
    schema.register("Tie", geometry_attrs(true), vec![]).expect("built-in schema is well-formed");
    schema.register("Shrub", geometry_attrs(true), vec![]).expect("built-in schema is well-formed");
    schema.register("Tfrag", geometry_attrs(false), vec![]).expect("built-in schema is well-formed");
    schema
}

/// The presence-bitfield index of `attr` on `type_name`, as declared by
/// [`level_schema`].
fn attr_index(schema: &Schema, type_name: &str, attr: &str) -> racpak::Result<usize> {
    schema.type_by_name(type_name)?.attribute_index(attr).ok_or_else(|| {
        Error::SchemaViolation(format!("{type_name} has no attribute {attr}"))
    })
}

/// Read `link`'s `positions`/`indices`/`color` attributes out of the
/// forest and build the single-submesh [`Mesh`]/[`Material`] pair every
/// geometry codec's `pack` constructor takes. Every class is imported
/// flat (one material, one untextured surface): there is no authoring
/// pipeline upstream of this bank format for per-face materials or UVs
/// yet.
fn mesh_from_node(forest: &Forest, schema: &Schema, type_name: &str, link: &str) -> racpak::Result<(Mesh, Vec<Material>)> {
    let positions_idx = attr_index(schema, type_name, "positions")?;
    let indices_idx = attr_index(schema, type_name, "indices")?;
    let color_idx = attr_index(schema, type_name, "color")?;

    let vertices: Vec<Vertex> = match forest.attribute(link, positions_idx) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::Vec3(p) => Ok(Vertex::new(*p)),
                other => Err(Error::SchemaViolation(format!(
                    "{link}: positions element is {:?}, expected Vec3",
                    other.type_of()
                ))),
            })
            .collect::<racpak::Result<Vec<_>>>()?,
        _ => return Err(Error::NotFound(format!("{link}: no positions attribute set"))),
    };

    let index_values: Vec<i64> = match forest.attribute(link, indices_idx) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_int()
                    .ok_or_else(|| Error::SchemaViolation(format!("{link}: indices element is not an Int")))
            })
            .collect::<racpak::Result<Vec<_>>>()?,
        _ => return Err(Error::NotFound(format!("{link}: no indices attribute set"))),
    };
    if index_values.len() % 3 != 0 {
        return Err(Error::FileFormatError(format!(
            "{link}: indices length {} is not a multiple of 3",
            index_values.len()
        )));
    }
    let faces: Vec<Face> = index_values
        .chunks_exact(3)
        .map(|c| Face::Tri([c[0] as u32, c[1] as u32, c[2] as u32]))
        .collect();

    let color = match forest.attribute(link, color_idx) {
        Some(Value::Color(rgba)) => *rgba,
        _ => [255, 255, 255, 255],
    };

    let mesh = Mesh {
        vertices,
        submeshes: vec![SubMesh { material: 0, faces }],
        flags: MeshFlags::empty(),
        joints: None,
    };
    Ok((mesh, vec![Material::flat_color(link, color)]))
}

/// Read `o_class` off `link`, defaulting to 0 if absent (tfrag has no
/// `o_class` attribute - it never gets a `ClassEntry` of its own).
fn o_class_of(forest: &Forest, schema: &Schema, type_name: &str, link: &str) -> i32 {
    attr_index(schema, type_name, "o_class")
        .ok()
        .and_then(|idx| forest.attribute(link, idx))
        .and_then(Value::as_int)
        .unwrap_or(0) as i32
}

/// Walk `asset_link`'s logical children by type and convert each one into
/// a [`ClassAsset`], populating the assembler's class list from the
/// resolved bank tree instead of leaving it empty.
fn collect_classes(forest: &Forest, schema: &Schema, asset_link: &str) -> racpak::Result<Vec<ClassAsset>> {
    let base = asset_link.trim_end_matches('/');
    let mut classes = Vec::new();

    for tag in forest.logical_children(asset_link, "Moby") {
        let link = format!("{base}/{tag}");
        let o_class = o_class_of(forest, schema, "Moby", &link);
        let (mesh, materials) = mesh_from_node(forest, schema, "Moby", &link)?;
        classes.push(ClassAsset::Moby { o_class, mesh, materials });
    }
    for tag in forest.logical_children(asset_link, "Tie") {
        let link = format!("{base}/{tag}");
        let o_class = o_class_of(forest, schema, "Tie", &link);
        let (mesh, materials) = mesh_from_node(forest, schema, "Tie", &link)?;
        classes.push(ClassAsset::Tie { o_class, mesh, materials });
    }
    for tag in forest.logical_children(asset_link, "Shrub") {
        let link = format!("{base}/{tag}");
        let o_class = o_class_of(forest, schema, "Shrub", &link);
        let (mesh, materials) = mesh_from_node(forest, schema, "Shrub", &link)?;
        classes.push(ClassAsset::Shrub { o_class, mesh, materials });
    }
    for tag in forest.logical_children(asset_link, "Tfrag") {
        let link = format!("{base}/{tag}");
        let (mesh, materials) = mesh_from_node(forest, schema, "Tfrag", &link)?;
        let tfrag = Tfrag::from_mesh(&mesh, materials, [0.0, 0.0, 0.0, 10.0])?;
        classes.push(ClassAsset::Tfrag { o_class: 0, tfrag });
    }

    Ok(classes)
}

fn run_unpack(input: PathBuf, output: PathBuf, game: Option<Game>, region: Option<Region>, auto_subdir: bool) -> racpak::Result<()> {
    let _ctx = context::push(format!("unpacking {}", input.display()));
    let game = game.unwrap_or(Game::Uya);
    let region = region.unwrap_or(Region::Us);
    log::info!("[0%] reading {} (game={game}, region={region})", input.display());

    let raw = fs::read(&input)?;
    let unpacked = compression::decompress(&raw)?;

    let out_dir = if auto_subdir {
        let stem = input.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_else(|| "level".to_string());
        output.join(stem)
    } else {
        output.clone()
    };
    fs::create_dir_all(&out_dir)?;
    fs::write(out_dir.join("assets.bin"), &unpacked)?;

    let schema = level_schema();
    let mut bank = Bank::new("World", game.to_string(), 1);
    bank.set_attribute(bank.root(), 0, Value::String(input.display().to_string()))?;
    let text = racpak::bank::text::write_bank_text(&schema, &bank.tree, bank.root(), 0)?;
    fs::write(out_dir.join("main.txt"), text)?;

    log::info!("[100%] Done!");
    Ok(())
}

fn run_pack(banks: Vec<PathBuf>, asset_link: String, output: PathBuf, game: Option<Game>, _region: Option<Region>, hint: Option<String>) -> racpak::Result<()> {
    let _ctx = context::push(format!("packing {asset_link}"));
    let game = game.unwrap_or(Game::Uya);
    if let Some(hint) = &hint {
        log::info!("using format hint '{hint}'");
    }
    log::info!("[0%] loading {} bank(s)", banks.len());

    let schema = level_schema();
    let mut forest = Forest::new();
    for path in &banks {
        let source = fs::read_to_string(path)?;
        let tree = racpak::bank::text::parse_bank_text(&schema, &source)?;
        let mut bank = Bank::new("World", game.to_string(), 1);
        bank.tree = tree;
        forest.push(bank);
    }

    if forest.lookup(&asset_link).is_none() {
        return Err(Error::NotFound(asset_link));
    }

    let mut assembler = Assembler::new();
    assembler.classes = collect_classes(&forest, &schema, &asset_link)?;
    log::info!("[50%] assembling {} class(es)", assembler.classes.len());
    let assembled = assembler.pack(game)?;
    fs::write(&output, assembled.into_bytes())?;

    log::info!("[100%] Done!");
    Ok(())
}

fn run_test(bank: PathBuf, asset_link: Option<String>, filter: Option<String>) -> racpak::Result<()> {
    let _ctx = context::push(format!("testing {}", bank.display()));
    let schema = level_schema();
    let source = fs::read_to_string(&bank)?;
    let tree = racpak::bank::text::parse_bank_text(&schema, &source)?;
    let mut b = Bank::new("World", "test", 1);
    b.tree = tree;
    let mut forest = Forest::new();
    forest.push(b);

    if let Some(link) = &asset_link {
        match forest.lookup(link) {
            Some(_) => log::info!("resolved {link}"),
            None => return Err(Error::NotFound(link.clone())),
        }
    }

    let children = forest.logical_children("/", "Moby");
    let matched: Vec<&String> = match &filter {
        Some(f) => children.iter().filter(|tag| tag.contains(f.as_str())).collect(),
        None => children.iter().collect(),
    };
    log::info!("[100%] Done! {} moby tag(s) matched", matched.len());
    Ok(())
}

fn run_decompress(input: PathBuf, output: PathBuf, offset: Option<u64>) -> racpak::Result<()> {
    let raw = fs::read(&input)?;
    let start = offset.unwrap_or(0) as usize;
    let slice = raw.get(start..).ok_or(Error::OutOfBounds)?;
    let unpacked = compression::decompress(slice)?;
    fs::write(&output, unpacked)?;
    log::info!("[100%] Done!");
    Ok(())
}

fn run_compress(input: PathBuf, output: PathBuf) -> racpak::Result<()> {
    let raw = fs::read(&input)?;
    let packed = compression::compress(&raw);
    fs::write(&output, packed)?;
    log::info!("[100%] Done!");
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Unpack { input, output, game, region, auto_subdir } => run_unpack(input, output, game, region, auto_subdir),
        Commands::Pack { banks, asset_link, output, game, region, hint } => run_pack(banks, asset_link, output, game, region, hint),
        Commands::Test { bank, asset_link, filter } => run_test(bank, asset_link, filter),
        Commands::Decompress { input, output, offset } => run_decompress(input, output, offset),
        Commands::Compress { input, output } => run_compress(input, output),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.with_context());
            ExitCode::FAILURE
        }
    }
}
