//! A small command-line front-end over the two archive translators,
//! grounded on `rc-zip-cli`'s subcommand layout (`ls`, extraction) but
//! widened to also drive IMG archives through the same
//! [`rafs::ArchiveTranslator`] surface.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use humansize::{format_size, BINARY};

use rafs::presence::RamBudget;
use rafs::stream::OpenMode;
use rafs::translator::img::ImgTranslator;
use rafs::translator::zip::ZipTranslator;
use rafs::ArchiveTranslator;

/// Default in-memory budget for file contents materialized from an
/// archive; entries beyond this spill to a temp file (see
/// `rafs::presence`).
const DEFAULT_RAM_BUDGET: u64 = 64 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "rafs", about = "Inspect and edit ZIP and IMG archives")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List entries under a directory in the archive (defaults to root).
    Ls {
        archive: PathBuf,
        #[arg(default_value = "/")]
        path: String,
        #[arg(short, long)]
        verbose: bool,
    },
    /// Print a file's contents to stdout.
    Cat { archive: PathBuf, path: String },
    /// Extract a single file to the host filesystem.
    Extract {
        archive: PathBuf,
        path: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Print metadata for a single entry.
    Stat { archive: PathBuf, path: String },
    /// Add or overwrite a file in the archive from a host file, then save.
    Add {
        archive: PathBuf,
        path: String,
        #[arg(long)]
        from: PathBuf,
    },
}

fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    if let Err(e) = do_main(cli) {
        eprintln!("rafs: {e}");
        std::process::exit(1);
    }
}

/// Picks a translator implementation by file extension: `.img`/`.dir` for
/// Rockstar IMG archives (v1 needs the paired `.dir` sibling, v2 is
/// self-contained), anything else is treated as a ZIP file.
fn open_translator(path: &Path) -> rafs::Result<Box<dyn ArchiveTranslator>> {
    let budget = RamBudget::new(DEFAULT_RAM_BUDGET);
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if ext == "img" {
        let dir_sibling = path.with_extension("dir");
        if dir_sibling.exists() {
            return Ok(Box::new(ImgTranslator::open_v1(
                dir_sibling,
                path,
                budget,
            )?));
        }
        return Ok(Box::new(ImgTranslator::open_v2(path, budget)?));
    }

    Ok(Box::new(ZipTranslator::open(path, budget)?))
}

fn do_main(cli: Cli) -> rafs::Result<()> {
    match cli.command {
        Commands::Ls {
            archive,
            path,
            verbose,
        } => ls(&archive, &path, verbose),
        Commands::Cat { archive, path } => cat(&archive, &path),
        Commands::Extract { archive, path, out } => extract(&archive, &path, out.as_deref()),
        Commands::Stat { archive, path } => stat(&archive, &path),
        Commands::Add {
            archive,
            path,
            from,
        } => add(&archive, &path, &from),
    }
}

fn ls(archive: &Path, path: &str, verbose: bool) -> rafs::Result<()> {
    let t = open_translator(archive)?;
    let mut names: Vec<String> = t.begin_directory_listing(path)?.collect();
    names.sort();

    for name in names {
        let full = if path == "/" {
            format!("/{name}")
        } else {
            format!("{}/{}", path.trim_end_matches('/'), name)
        };
        if verbose {
            let stats = t.query_stats(&full)?;
            println!(
                "{:>10} {} {}",
                format_size(stats.size, BINARY),
                if stats.is_directory { "d" } else { "-" },
                full,
            );
        } else {
            println!("{full}");
        }
    }
    Ok(())
}

fn cat(archive: &Path, path: &str) -> rafs::Result<()> {
    let t = open_translator(archive)?;
    let mut stream = t.open(path, OpenMode::READ)?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf)?;
    io::stdout().write_all(&buf)?;
    Ok(())
}

fn extract(archive: &Path, path: &str, out: Option<&Path>) -> rafs::Result<()> {
    let t = open_translator(archive)?;
    let mut stream = t.open(path, OpenMode::READ)?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf)?;

    let out = out
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(path.rsplit('/').next().unwrap_or(path)));
    if let Some(parent) = out.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(&out, &buf)?;
    println!(
        "extracted {path} -> {} ({})",
        out.display(),
        format_size(buf.len() as u64, BINARY)
    );
    Ok(())
}

fn stat(archive: &Path, path: &str) -> rafs::Result<()> {
    let t = open_translator(archive)?;
    let stats = t.query_stats(path)?;
    println!("path:        {path}");
    println!("size:        {} ({})", stats.size, format_size(stats.size, BINARY));
    println!("directory:   {}", stats.is_directory);
    println!("compressed:  {}", stats.is_compressed);
    println!("mtime:       {}", stats.mtime);
    Ok(())
}

fn add(archive: &Path, path: &str, from: &Path) -> rafs::Result<()> {
    let t = open_translator(archive)?;
    let data = fs::read(from)?;

    let mode = OpenMode::WRITE | OpenMode::CREATE | OpenMode::TRUNCATE;
    let mut stream = t.open(path, mode)?;
    stream.write_all(&data)?;
    drop(stream);

    t.save()?;
    println!(
        "added {} -> {path} ({})",
        from.display(),
        format_size(data.len() as u64, BINARY)
    );
    Ok(())
}
