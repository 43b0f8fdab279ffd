#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use pgv_device::{DeviceTuning, PagedDevice};
use pgv_store::{DirRemoteStore, PageFiles, RemoteStore};
use pgv_types::{PAGE_SIZE, page_count_for};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "pgv", about = "PageVault — virtual block device over a remote page store")]
struct Cli {
    /// Log filter, e.g. "info" or "pgv=debug".
    #[arg(long, global = true, default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile the local cache directory against the remote listing.
    Status {
        /// Root of the directory-backed remote store.
        #[arg(long)]
        remote_root: PathBuf,
        /// Local page cache directory.
        #[arg(long)]
        cache_dir: PathBuf,
        /// Virtual device size in bytes.
        #[arg(long, default_value_t = 1024 * 1024 * 1024)]
        size: u64,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Drive a random read/write workload through a device for smoke testing.
    Exercise {
        /// Root of the directory-backed remote store.
        #[arg(long)]
        remote_root: PathBuf,
        /// Local page cache directory.
        #[arg(long)]
        cache_dir: PathBuf,
        /// Virtual device size in bytes.
        #[arg(long, default_value_t = 1024 * 1024 * 1024)]
        size: u64,
        /// Number of write+verify rounds.
        #[arg(long, default_value_t = 64)]
        ops: u64,
        /// Seed for the deterministic workload.
        #[arg(long, default_value_t = 1)]
        seed: u64,
        /// Bytes per operation.
        #[arg(long, default_value_t = 4096)]
        payload: usize,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

// ── Serializable outputs ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct StatusReport {
    size: u64,
    page_count: u64,
    /// Pages with an available remote copy.
    uploaded: Vec<u64>,
    /// Subset of `uploaded` at full redundancy.
    durable: Vec<u64>,
    /// Pages with a residual local cache file.
    resident: Vec<u64>,
    /// Resident pages with no durable remote copy; their data exists only
    /// locally.
    local_only: Vec<u64>,
}

#[derive(Debug, Serialize)]
struct ExerciseReport {
    ops: u64,
    bytes_written: u64,
    bytes_read: u64,
    cache_count: usize,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&cli.log)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    if let Err(err) = run(cli) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Status {
            remote_root,
            cache_dir,
            size,
            json,
        } => status(&remote_root, &cache_dir, size, json),
        Command::Exercise {
            remote_root,
            cache_dir,
            size,
            ops,
            seed,
            payload,
            json,
        } => exercise(&remote_root, &cache_dir, size, ops, seed, payload, json),
    }
}

// ── status ──────────────────────────────────────────────────────────────────

fn status(remote_root: &Path, cache_dir: &Path, size: u64, json: bool) -> Result<()> {
    let remote = DirRemoteStore::new(remote_root).context("open remote store")?;
    let files = PageFiles::new(cache_dir).context("open cache directory")?;
    let page_count = page_count_for(size);

    let uploaded = remote.list_uploaded(false).context("list remote pages")?;
    let durable = remote
        .list_uploaded(true)
        .context("list durable remote pages")?;
    let resident = files.scan_resident(page_count).context("scan cache")?;

    let local_only: Vec<u64> = resident
        .iter()
        .copied()
        .filter(|page| !durable.contains(page))
        .map(|page| page.0)
        .collect();

    let report = StatusReport {
        size,
        page_count,
        uploaded: uploaded.iter().map(|page| page.0).collect(),
        durable: durable.iter().map(|page| page.0).collect(),
        resident: resident.iter().map(|page| page.0).collect(),
        local_only,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "device: {} bytes over {} pages of {} bytes",
            report.size, report.page_count, PAGE_SIZE
        );
        println!("uploaded: {} pages", report.uploaded.len());
        println!("durable:  {} pages", report.durable.len());
        println!("resident: {} pages", report.resident.len());
        if report.local_only.is_empty() {
            println!("all resident pages have a durable remote copy");
        } else {
            println!("local-only pages (unflushed): {:?}", report.local_only);
        }
    }
    Ok(())
}

// ── exercise ────────────────────────────────────────────────────────────────

fn exercise(
    remote_root: &Path,
    cache_dir: &Path,
    size: u64,
    ops: u64,
    seed: u64,
    payload: usize,
    json: bool,
) -> Result<()> {
    if payload == 0 {
        bail!("payload must be > 0");
    }
    if size <= payload as u64 {
        bail!("device size {size} too small for payload {payload}");
    }

    let remote = DirRemoteStore::new(remote_root).context("open remote store")?;
    let device = Arc::new(
        PagedDevice::new(size, cache_dir, remote, DeviceTuning::default())
            .context("open device")?,
    );
    let maintainer = device.start_maintainer().context("start maintainer")?;

    info!(event = "exercise_begin", ops, seed, payload);

    let mut rng = Xorshift::new(seed);
    let mut bytes_written = 0_u64;
    let mut bytes_read = 0_u64;
    let mut buf = vec![0_u8; payload];
    let mut read_back = vec![0_u8; payload];

    for op in 0..ops {
        let offset = rng.next() % (size - payload as u64);
        rng.fill(&mut buf);

        bytes_written += device.write_at(&buf, offset).context("write")? as u64;
        bytes_read += device.read_at(&mut read_back, offset).context("read")? as u64;
        if read_back != buf {
            bail!("verification failed at op {op}, offset {offset}");
        }
    }

    maintainer.shutdown();
    let cache_count = device.status().cache_count;
    device.close().context("close device")?;

    let report = ExerciseReport {
        ops,
        bytes_written,
        bytes_read,
        cache_count,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{} ops verified: {} bytes written, {} bytes read, {} pages cached at finish",
            report.ops, report.bytes_written, report.bytes_read, report.cache_count
        );
    }
    Ok(())
}

/// Deterministic xorshift64 stream for workload generation.
struct Xorshift {
    state: u64,
}

impl Xorshift {
    fn new(seed: u64) -> Self {
        Self { state: seed | 1 }
    }

    fn next(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    fn fill(&mut self, buf: &mut [u8]) {
        for chunk in buf.chunks_mut(8) {
            let word = self.next().to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }
}
