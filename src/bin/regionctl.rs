//! regionctl
//!
//! Inspect region files and read/write individual chunks of a storage
//! directory.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use bytes::Bytes;
use clap::{Args as ClapArgs, Parser, Subcommand};
use regionkv::region::{RegionFile, RegionFileOptions};
use regionkv::{ChunkPos, Compression, PrefixProbe, RegionPos, StorageConfig, StorageWorker};
use tracing_subscriber::{fmt, EnvFilter};

/// Region storage tool
#[derive(Parser, Debug)]
#[command(name = "regionctl")]
#[command(about = "Inspect and edit region-file chunk storage")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the chunks present in one region file
    Info {
        /// Region file (r.<x>.<z>.<ext>)
        file: PathBuf,
    },

    /// Print a chunk's decoded payload
    Get {
        #[command(flatten)]
        chunk: ChunkArgs,

        /// Write the payload here instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Store a file as a chunk's payload
    Put {
        #[command(flatten)]
        chunk: ChunkArgs,

        /// Payload file
        input: PathBuf,

        /// Codec: gzip, deflate or none
        #[arg(short, long, default_value = "deflate")]
        compression: String,
    },

    /// Delete a chunk
    Delete {
        #[command(flatten)]
        chunk: ChunkArgs,
    },

    /// Print the first bytes of a chunk's payload as hex
    Probe {
        #[command(flatten)]
        chunk: ChunkArgs,

        /// Number of bytes to read
        #[arg(short, long, default_value = "16")]
        bytes: usize,
    },
}

#[derive(ClapArgs, Debug)]
struct ChunkArgs {
    /// Storage directory
    #[arg(short, long, default_value = "./region")]
    dir: PathBuf,

    /// Chunk x coordinate
    #[arg(allow_negative_numbers = true)]
    x: i32,

    /// Chunk z coordinate
    #[arg(allow_negative_numbers = true)]
    z: i32,
}

impl ChunkArgs {
    fn pos(&self) -> ChunkPos {
        ChunkPos::new(self.x, self.z)
    }
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,regionkv=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    if let Err(e) = run(args.command) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Info { file } => info(file),
        Commands::Get { chunk, out } => {
            let worker = open_worker(&chunk, Compression::default())?;
            let payload = worker.load(chunk.pos()).wait()?;
            worker.close()?;

            let Some(payload) = payload else {
                return Err(format!("chunk {} not found", chunk.pos()).into());
            };
            match out {
                Some(path) => fs::write(path, &payload)?,
                None => io::stdout().write_all(&payload)?,
            }
            Ok(())
        }
        Commands::Put {
            chunk,
            input,
            compression,
        } => {
            let compression = Compression::from_name(&compression)
                .ok_or_else(|| format!("unknown compression: {compression}"))?;
            let payload = Bytes::from(fs::read(&input)?);
            let worker = open_worker(&chunk, compression)?;
            worker.store(chunk.pos(), Some(payload)).wait()?;
            worker.synchronize(true).wait()?;
            worker.close()?;
            Ok(())
        }
        Commands::Delete { chunk } => {
            let worker = open_worker(&chunk, Compression::default())?;
            worker.store(chunk.pos(), None).wait()?;
            worker.synchronize(true).wait()?;
            worker.close()?;
            Ok(())
        }
        Commands::Probe { chunk, bytes } => {
            let worker = open_worker(&chunk, Compression::default())?;
            let prefix = worker.scan(chunk.pos(), PrefixProbe::new(bytes)).wait()?;
            worker.close()?;

            let prefix = prefix.ok_or_else(|| format!("chunk {} not found", chunk.pos()))?;
            let hex: Vec<String> = prefix.bytes().iter().map(|b| format!("{b:02x}")).collect();
            println!("{}", hex.join(" "));
            Ok(())
        }
    }
}

fn open_worker(
    chunk: &ChunkArgs,
    compression: Compression,
) -> Result<StorageWorker, Box<dyn std::error::Error>> {
    let config = StorageConfig::builder()
        .dir(&chunk.dir)
        .compression(compression)
        .thread_name("regionctl-storage")
        .build();
    Ok(StorageWorker::open(config)?)
}

fn info(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    if !path.is_file() {
        return Err(format!("{} is not a file", path.display()).into());
    }
    let region = path
        .file_name()
        .and_then(|name| RegionPos::parse_file_name(&name.to_string_lossy()));

    let mut file = RegionFile::open(&path, RegionFileOptions::default())?;
    let entries = file.entries();

    println!("{}: {} chunk(s)", path.display(), entries.len());
    println!("{:>6}  {:>14}  {:>8}  {:>6}  {:>10}  external", "index", "chunk", "sector", "count", "timestamp");
    for entry in entries {
        let (chunk, external) = match region {
            Some(region) => {
                let pos = region.chunk_at(entry.local_index);
                (pos.to_string(), file.is_external(pos))
            }
            None => ("?".to_string(), false),
        };
        println!(
            "{:>6}  {:>14}  {:>8}  {:>6}  {:>10}  {}",
            entry.local_index, chunk, entry.sector, entry.sector_count, entry.timestamp, external
        );
    }

    file.close()?;
    Ok(())
}
