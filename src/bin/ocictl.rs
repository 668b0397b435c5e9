use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tar::EntryType;

use ocistore::{
    archive::Compression,
    config::{Exclusions, ImageOptions, DEFAULT_EXCLUSIONS},
    digest::{parse_digest, Algorithm},
    image::history,
    layer::LayerReader,
    repository::Repository,
};

/// ocictl
#[derive(Debug, Parser)]
#[clap(name = "ocictl", version)]
pub struct App {
    /// the repository holding the image layouts
    #[clap(long)]
    repo: PathBuf,

    /// digest algorithm for new blobs (unknown names fall back to sha256)
    #[clap(long, default_value = "sha256")]
    algorithm: String,

    /// layer compression: none, gzip or zstd
    #[clap(long, default_value = "gzip")]
    compression: String,

    /// additional archive paths to leave out of layers (regular expression)
    #[clap(long)]
    exclude: Vec<String>,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Creates an empty repository
    Init,
    /// Creates an empty image layout in the repository
    Layout { name: String },
    /// Builds an image from a directory tree, as a single layer
    AddTree {
        layout: String,
        reference: String,
        path: PathBuf,
    },
    /// Builds an image holding the changes from one tree to another
    AddDiff {
        layout: String,
        reference: String,
        lower: PathBuf,
        upper: PathBuf,
    },
    /// Applies all layers of an image to a directory
    Extract {
        layout: String,
        reference: String,
        target: PathBuf,
    },
    /// Lists the entries of every layer of an image
    Ls { layout: String, reference: String },
    /// Writes a blob to stdout
    CatBlob { layout: String, digest: String },
}

impl App {
    fn options(&self) -> Result<ImageOptions> {
        let compression: Compression = self.compression.parse()?;
        let exclusions = Exclusions::new(
            DEFAULT_EXCLUSIONS
                .iter()
                .copied()
                .chain(self.exclude.iter().map(String::as_str)),
        )?;
        Ok(ImageOptions::default()
            .with_algorithm(Algorithm::from_name_or_canonical(&self.algorithm))
            .with_compression(compression)
            .with_exclusions(exclusions))
    }
}

fn open_repo(path: &Path) -> Result<Repository> {
    Repository::open(path).with_context(|| format!("Opening repository {}", path.display()))
}

fn ls_layer(reader: &mut LayerReader, out: &mut impl Write) -> Result<()> {
    for entry in reader.entries()? {
        let entry = entry?;
        let header = entry.header();
        let path = entry.path()?;
        let kind = match header.entry_type() {
            EntryType::Directory => 'd',
            EntryType::Symlink => 'l',
            EntryType::Link => 'h',
            EntryType::Char => 'c',
            EntryType::Block => 'b',
            _ => '-',
        };
        write!(
            out,
            "{kind} {:04o} {}:{} {:>10} {}",
            header.mode()?,
            header.uid()?,
            header.gid()?,
            header.size()?,
            path.display()
        )?;
        match entry.link_name()? {
            Some(target) => writeln!(out, " -> {}", target.display())?,
            None => writeln!(out)?,
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();
    let options = args.options()?;

    match &args.cmd {
        Command::Init => {
            Repository::create(&args.repo)
                .with_context(|| format!("Creating repository {}", args.repo.display()))?;
        }
        Command::Layout { name } => {
            let repo = open_repo(&args.repo)?;
            repo.create_image_layout(name)
                .with_context(|| format!("Creating image layout {name}"))?
                .close()?;
        }
        Command::AddTree {
            layout,
            reference,
            path,
        } => {
            let repo = open_repo(&args.repo)?;
            let mut layout = repo.open_image_layout(layout)?;
            let mut image = layout.create_image(reference, options)?;
            let created_by = format!("ocictl add-tree {}", path.display());
            let layer = image
                .add_tree(path, history(&created_by)?)
                .with_context(|| format!("Archiving {}", path.display()))?;
            eprintln!("layer {}", layer.digest());
            let manifest = layout.save_image(image)?;
            layout.close()?;
            println!("{}", manifest.digest());
        }
        Command::AddDiff {
            layout,
            reference,
            lower,
            upper,
        } => {
            let repo = open_repo(&args.repo)?;
            let mut layout = repo.open_image_layout(layout)?;
            let mut image = layout.create_image(reference, options)?;
            let created_by = format!("ocictl add-diff {} {}", lower.display(), upper.display());
            let (layer, stats) = image
                .add_diff(lower, upper, history(&created_by)?)
                .with_context(|| format!("Comparing {} to {}", lower.display(), upper.display()))?;
            eprintln!(
                "layer {}: {} added, {} replaced, {} whiteouts",
                layer.digest(),
                stats.added,
                stats.replaced,
                stats.whiteouts
            );
            let manifest = layout.save_image(image)?;
            layout.close()?;
            println!("{}", manifest.digest());
        }
        Command::Extract {
            layout,
            reference,
            target,
        } => {
            let repo = open_repo(&args.repo)?;
            let layout = repo.open_image_layout(layout)?;
            let image = layout.open_image(reference, options)?;
            fs::create_dir_all(target)?;
            image
                .extract_into(target)
                .with_context(|| format!("Extracting {reference} into {}", target.display()))?;
        }
        Command::Ls { layout, reference } => {
            let repo = open_repo(&args.repo)?;
            let layout = repo.open_image_layout(layout)?;
            let image = layout.open_image(reference, options)?;
            let mut out = io::stdout().lock();
            for descriptor in image.layers() {
                writeln!(out, "# {}", descriptor.digest())?;
                let mut reader = LayerReader::open(layout.store(), descriptor)?;
                ls_layer(&mut reader, &mut out)?;
            }
        }
        Command::CatBlob { layout, digest } => {
            let repo = open_repo(&args.repo)?;
            let layout = repo.open_image_layout(layout)?;
            let mut blob = layout.store().open(&parse_digest(digest)?)?;
            io::copy(&mut blob, &mut io::stdout().lock())?;
        }
    }
    Ok(())
}
