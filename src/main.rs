use anyhow::bail;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use treedelta::{
    CompressionKind, FileSource, PatchReader, PatchWriter, Report, Summary, TracingLogger,
};

#[derive(Parser)]
#[command(name = "treedelta", about = "Binary delta containers for directory trees")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Compression {
    Gzip,
    Bzip2,
    Zstd,
}

impl From<Compression> for CompressionKind {
    fn from(value: Compression) -> Self {
        match value {
            Compression::Gzip => CompressionKind::Gzip,
            Compression::Bzip2 => CompressionKind::Bzip2,
            Compression::Zstd => CompressionKind::Zstd,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a patch by comparing old and new directories
    Create {
        /// Path to the old (original) directory
        #[arg(long)]
        old: PathBuf,
        /// Path to the new (updated) directory
        #[arg(long)]
        new: PathBuf,
        /// Output path for the patch file
        #[arg(long, short)]
        output: PathBuf,
        /// Compression used for every payload in the patch
        #[arg(long, value_enum, default_value = "gzip")]
        compression: Compression,
    },
    /// Apply one or more patches, in order, to a target directory
    Apply {
        /// Path to the target directory to patch
        #[arg(long)]
        target: PathBuf,
        /// Path to a patch file; repeat to chain patches
        #[arg(long, short, required = true, num_args = 1..)]
        patch: Vec<PathBuf>,
    },
    /// List the blocks of a patch without applying it
    Inspect {
        /// Path to the patch file
        #[arg(long, short)]
        patch: PathBuf,
        /// Print the block list as JSON
        #[arg(long)]
        json: bool,
    },
}

fn print_summary(summary: &Summary) {
    println!("  Directories created: {}", summary.dirs_created);
    println!("  Files added: {}", summary.files_added);
    println!("  Files modified: {}", summary.files_modified);
    println!("  Files deleted: {}", summary.files_deleted);
    println!("  Directories deleted: {}", summary.dirs_deleted);
}

fn check(report: &Report, what: &str) -> anyhow::Result<()> {
    if report.has_error() {
        for message in report.errors() {
            eprintln!("error: {message}");
        }
        bail!("{what} failed with {} error(s)", report.errors().len());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Create { old, new, output, compression } => {
            println!("Creating patch...");
            println!("  Old: {}", old.display());
            println!("  New: {}", new.display());
            println!("  Output: {}", output.display());

            let start = Instant::now();
            let report = PatchWriter::new(&old, &new, compression.into())
                .with_logger(Arc::new(TracingLogger))
                .run(&output)
                .await;
            check(&report, "Patch creation")?;
            let elapsed = start.elapsed();

            println!("\nPatch created successfully!");
            print_summary(&report.summary());
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Apply { target, patch } => {
            for patch in patch {
                println!("Applying patch...");
                println!("  Target: {}", target.display());
                println!("  Patch: {}", patch.display());

                let start = Instant::now();
                let report = PatchReader::new(Arc::new(FileSource::new(&patch)))
                    .with_target(&target)
                    .with_logger(Arc::new(TracingLogger))
                    .run()
                    .await;
                check(&report, "Patch application")?;
                let elapsed = start.elapsed();

                println!("\nPatch applied successfully!");
                print_summary(&report.summary());
                println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
            }
        }
        Commands::Inspect { patch, json } => {
            let report = PatchReader::new(Arc::new(FileSource::new(&patch))).read().await;
            check(&report, "Patch inspection")?;
            let Some(info) = report.info else {
                bail!("Patch inspection produced no block list");
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("Patch: {}", patch.display());
                println!("  Version: {}", info.version);
                println!("  Compression: {}", info.compression);
                println!("  Checksum: {}", treedelta::patch_format::to_hex(&info.checksum));
                println!("  Blocks: {}", info.block_count);
                for block in &info.blocks {
                    println!("    {:<13} {:>10}  {}", block.kind, block.data_size, block.path);
                }
                print_summary(&info.summary());
            }
        }
    }

    Ok(())
}
