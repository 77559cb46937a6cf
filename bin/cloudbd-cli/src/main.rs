//! cloudbd CLI - Block device command line tool
//!
//! Initializes, inspects and performs block I/O against a device whose
//! blocks live in a directory-backed object store.

use anyhow::{Context, Result, bail};
use bytes::{Bytes, BytesMut};
use clap::{Parser, Subcommand};
use cloudbd_block::{BlockDevice, BlockError, BlockResult, GeometryPrompt};
use cloudbd_client::DirAuthenticator;
use cloudbd_common::{BlockNo, DeviceConfig, Priority};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "cloudbd")]
#[command(about = "Block device backed by an object store")]
#[command(version)]
struct Args {
    /// Root directory of the object store
    #[arg(short, long, env = "CLOUDBD_ROOT")]
    root: PathBuf,

    /// Container holding the device
    #[arg(short, long)]
    container: Option<String>,

    /// Configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of worker threads
    #[arg(short, long)]
    workers: Option<usize>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the container and device metadata
    Init {
        /// Block size (e.g. 4096, 64K, 1M)
        #[arg(short, long)]
        block_size: Option<String>,
        /// Device size (e.g. 100M, 10G)
        #[arg(short, long)]
        total_size: Option<String>,
    },
    /// Show device geometry
    Info,
    /// Read one block
    Read {
        /// Block index
        index: BlockNo,
        /// Write the block to this file instead of dumping it
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Write one block from a file, zero-padded to the block size
    Write {
        /// Block index
        index: BlockNo,
        /// Input file
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Fill a range of blocks with one byte value
    Fill {
        /// First block
        #[arg(short, long, default_value_t = 0)]
        start: BlockNo,
        /// Number of blocks (default: to the end of the device)
        #[arg(short = 'n', long)]
        count: Option<u64>,
        /// Fill byte
        #[arg(short, long, default_value_t = 0)]
        byte: u8,
    },
}

/// Asks for missing geometry on stdin
struct StdinPrompt;

impl GeometryPrompt for StdinPrompt {
    fn ask(&self, question: &str) -> BlockResult<u64> {
        eprint!("{question}: ");
        std::io::stderr().flush().map_err(cloudbd_common::Error::from)?;

        let mut line = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut line)
            .map_err(cloudbd_common::Error::from)?;
        parse_size(&line).map_err(|e| BlockError::Configuration(e.to_string()))
    }
}

/// Parse a size such as `4096`, `64K`, `10G`
fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let (num, multiplier) = if let Some(n) = s.strip_suffix('T') {
        (n, 1024 * 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('G') {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('K') {
        (n, 1024)
    } else {
        (s, 1)
    };
    let value: u64 = num
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid size: '{s}'"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow::anyhow!("Size too large: '{s}'"))
}

/// Format bytes as a human-readable size string
fn format_size(bytes: u64) -> String {
    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;
    const KIB: u64 = 1024;

    if bytes >= GIB && bytes.is_multiple_of(GIB) {
        format!("{} GiB", bytes / GIB)
    } else if bytes >= MIB && bytes.is_multiple_of(MIB) {
        format!("{} MiB", bytes / MIB)
    } else if bytes >= KIB && bytes.is_multiple_of(KIB) {
        format!("{} KiB", bytes / KIB)
    } else {
        format!("{bytes} B")
    }
}

/// Hex dump, 16 bytes per line
fn hex_dump(data: &[u8]) -> String {
    data.chunks(16)
        .enumerate()
        .map(|(line, chunk)| format!("{:08x}  {}\n", line * 16, hex::encode(chunk)))
        .collect()
}

/// Zero-pad `input` to exactly one block
fn pad_block(input: &[u8], block_size: u64) -> Result<Bytes> {
    let block_size = usize::try_from(block_size).context("block size exceeds address space")?;
    if input.len() > block_size {
        bail!(
            "input is {} bytes, larger than the {block_size} byte block",
            input.len()
        );
    }
    let mut block = BytesMut::zeroed(block_size);
    block[..input.len()].copy_from_slice(input);
    Ok(block.freeze())
}

fn device_config(args: &Args, create: bool) -> Result<DeviceConfig> {
    let mut config = DeviceConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(container) = &args.container {
        config.container_name.clone_from(container);
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    config.create = config.create || create;
    Ok(config)
}

fn open_device(args: &Args, config: &DeviceConfig) -> Result<BlockDevice> {
    let auth = DirAuthenticator::new(&args.root);
    BlockDevice::open_with_prompt(config, &auth, &StdinPrompt)
        .with_context(|| format!("opening device in container '{}'", config.container_name))
}

fn print_info(device: &BlockDevice) {
    let meta = device.metadata();
    println!("UUID:        {}", device.uuid());
    println!("Version:     {}", meta.version);
    println!("Block size:  {}", format_size(meta.block_size));
    println!("Block count: {}", meta.block_count);
    println!("Total size:  {}", format_size(device.total_size()));
}

fn fill(device: &BlockDevice, start: BlockNo, count: Option<u64>, byte: u8) -> Result<()> {
    let count = count.unwrap_or_else(|| device.block_count().saturating_sub(start));
    let block_len = usize::try_from(device.block_size()).context("block size exceeds address space")?;
    let block = Bytes::from(vec![byte; block_len]);
    let failed = Arc::new(AtomicU64::new(0));

    info!("Filling {count} blocks from {start} with {byte:#04x}");
    for index in start..start.saturating_add(count) {
        let failed = Arc::clone(&failed);
        device
            .write_with(index, block.clone(), Priority::Normal, move |result| {
                if let Err(e) = result {
                    eprintln!("block {index}: {e}");
                    failed.fetch_add(1, Ordering::Relaxed);
                }
            })
            .with_context(|| format!("queueing block {index}"))?;
    }
    device.flush();

    let stats = device.stats();
    println!("Written:     {} ({} new, {} updated)", stats.writes, stats.allocations, stats.updates);
    println!("Bytes:       {}", stats.bytes_written);
    println!("Retries:     {}", stats.retries);
    println!("Failures:    {}", stats.failures);

    let failed = failed.load(Ordering::Relaxed);
    if failed > 0 {
        bail!("{failed} of {count} writes failed");
    }
    Ok(())
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match &args.command {
        Commands::Init {
            block_size,
            total_size,
        } => {
            let mut config = device_config(&args, true)?;
            if let Some(size) = block_size {
                config.default_block_size = Some(parse_size(size)?);
            }
            if let Some(size) = total_size {
                config.default_total_size = Some(parse_size(size)?);
            }
            std::fs::create_dir_all(&args.root)
                .with_context(|| format!("creating store root {}", args.root.display()))?;

            let device = open_device(&args, &config)?;
            print_info(&device);
            device.close(false);
        }
        Commands::Info => {
            let device = open_device(&args, &device_config(&args, false)?)?;
            print_info(&device);
            device.close(false);
        }
        Commands::Read { index, out } => {
            let device = open_device(&args, &device_config(&args, false)?)?;
            let data = device
                .read(*index, Priority::High)
                .with_context(|| format!("reading block {index}"))?;
            match out {
                Some(path) => std::fs::write(path, &data)
                    .with_context(|| format!("writing {}", path.display()))?,
                None => print!("{}", hex_dump(&data)),
            }
            device.close(false);
        }
        Commands::Write { index, input } => {
            let device = open_device(&args, &device_config(&args, false)?)?;
            let raw = std::fs::read(input)
                .with_context(|| format!("reading {}", input.display()))?;
            let block = pad_block(&raw, device.block_size())?;
            let id = device
                .write(*index, block, Priority::High)
                .with_context(|| format!("writing block {index}"))?;
            println!("Block {index} stored as {id}");
            device.close(false);
        }
        Commands::Fill { start, count, byte } => {
            let device = open_device(&args, &device_config(&args, false)?)?;
            let result = fill(&device, *start, *count, *byte);
            device.close(false);
            result?;
        }
    }

    Ok(())
}
