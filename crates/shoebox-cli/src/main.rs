use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use shoebox_core::{is_reserved_name, ConflictResolver, Depot, HashRecord, Resolution};

/// Extensions treated as library media during traversal.
const MEDIA_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "tif", "tiff", "bmp", "webp", "heic", "heif", "avif", "dng",
    "cr2", "cr3", "nef", "arw", "orf", "raf", "rw2", "mp4", "m4v", "m4a", "mov", "avi", "mts",
    "m2ts", "mkv", "webm", "3gp",
];

#[derive(Parser)]
#[command(name = "shoebox", version, about = "Maintain per-directory content-hash depots for a photo/video library")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compute and store hashes for media files under the given paths
    Hash {
        /// Files or directories to process
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Recompute every hash, bypassing all cache tiers
        #[arg(long)]
        force: bool,

        /// Only add missing records; accept existing ones without staleness checks
        #[arg(long)]
        add_only: bool,
    },

    /// Recompute hashes and report files whose stored hashes no longer match
    Verify {
        /// Files or directories to check
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// List stored depot records under the given paths
    List {
        /// Directories to list
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Hash { paths, force, add_only } => cmd_hash(&paths, force, add_only),
        Command::Verify { paths } => cmd_verify(&paths),
        Command::List { paths } => cmd_list(&paths),
    }
}

fn cmd_hash(paths: &[PathBuf], force: bool, add_only: bool) -> anyhow::Result<()> {
    let mut depot = Depot::new();
    let mut prompt = ConsolePrompt;
    let mut hashed = 0u64;
    let mut skipped = 0u64;
    let mut failed = 0u64;

    for path in collect_media_files(paths)? {
        match depot.resolve(&path, add_only, force, None, &mut prompt) {
            Ok(Some(record)) => {
                hashed += 1;
                println!("{}  {}", record.md5, path.display());
            }
            Ok(None) => skipped += 1,
            Err(shoebox_core::Error::Aborted) => anyhow::bail!("aborted"),
            Err(err @ shoebox_core::Error::Inconsistent { .. }) => {
                // Logic-error signal; never swallowed.
                return Err(err).context("hash consistency check failed");
            }
            Err(err) => {
                failed += 1;
                tracing::error!(path = %path.display(), error = %err, "hashing failed");
            }
        }
    }

    eprintln!("{hashed} hashed, {skipped} skipped, {failed} failed");
    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_verify(paths: &[PathBuf]) -> anyhow::Result<()> {
    let mut depot = Depot::new();
    let mut report = ReportOnly::default();
    let mut checked = 0u64;
    let mut failed = 0u64;

    for path in collect_media_files(paths)? {
        match depot.resolve(&path, false, true, None, &mut report) {
            Ok(_) => checked += 1,
            Err(err @ shoebox_core::Error::Inconsistent { .. }) => {
                return Err(err).context("hash consistency check failed");
            }
            Err(err) => {
                failed += 1;
                tracing::error!(path = %path.display(), error = %err, "verification failed");
            }
        }
    }

    for path in &report.mismatches {
        println!("MISMATCH  {}", path.display());
    }
    eprintln!("{checked} checked, {} mismatched, {failed} failed", report.mismatches.len());
    if failed > 0 || !report.mismatches.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_list(paths: &[PathBuf]) -> anyhow::Result<()> {
    let mut depot = Depot::new();
    let mut depot_files = Vec::new();
    for root in paths {
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.with_context(|| format!("walking {}", root.display()))?;
            if entry.file_type().is_file() && is_depot_file(entry.path()) {
                depot_files.push(entry.path().to_path_buf());
            }
        }
    }

    depot.find(depot_files, &|p| p.is_file(), &mut |path, record| {
        println!(
            "{}  v{}  {:>12}  {}",
            record.md5,
            record.version,
            record.size,
            path.display()
        );
    })?;
    Ok(())
}

/// Walk the given paths and collect media files in a sorted depth-first
/// order, so consecutive lookups usually share a directory and hit the
/// depot's single-slot memory cache.
fn collect_media_files(paths: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for root in paths {
        if root.is_file() {
            if is_media_file(root) {
                files.push(root.clone());
            }
            continue;
        }
        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let entry = entry.with_context(|| format!("walking {}", root.display()))?;
            if entry.file_type().is_file() && is_media_file(entry.path()) {
                files.push(entry.path().to_path_buf());
            }
        }
    }
    Ok(files)
}

fn is_depot_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(is_reserved_name)
}

fn is_media_file(path: &Path) -> bool {
    if is_depot_file(path) {
        return false;
    }
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    MEDIA_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
}

/// Interactive conflict prompt: keep the old record, keep the new one,
/// skip the file, or abort the run.
struct ConsolePrompt;

impl ConflictResolver for ConsolePrompt {
    fn resolve(&mut self, path: &Path, old: &HashRecord, new: &HashRecord) -> Resolution {
        eprintln!("hash mismatch: {}", path.display());
        eprintln!("  stored:   full {}  content {}", old.full_md5, old.md5);
        eprintln!("  computed: full {}  content {}", new.full_md5, new.md5);
        loop {
            eprint!("keep [o]ld, keep [n]ew, [s]kip, [a]bort? ");
            let _ = std::io::stderr().flush();
            let mut line = String::new();
            if std::io::stdin().lock().read_line(&mut line).is_err() {
                return Resolution::Abort;
            }
            match line.trim().to_ascii_lowercase().as_str() {
                "o" => return Resolution::KeepOld,
                "n" => return Resolution::KeepNew,
                "s" => return Resolution::Skip,
                "a" | "" => return Resolution::Abort,
                _ => {}
            }
        }
    }
}

/// Non-interactive resolver for `verify`: records the mismatch and leaves
/// the stored record untouched.
#[derive(Default)]
struct ReportOnly {
    mismatches: Vec<PathBuf>,
}

impl ConflictResolver for ReportOnly {
    fn resolve(&mut self, path: &Path, _old: &HashRecord, _new: &HashRecord) -> Resolution {
        self.mismatches.push(path.to_path_buf());
        Resolution::Skip
    }
}
