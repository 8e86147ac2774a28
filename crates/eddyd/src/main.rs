//! `eddyd`: command line for the Eddy shuffle service.
//!
//! # Usage
//!
//! ```text
//! eddyd bench                                   # in-process write/read round trip
//! eddyd -c eddy.toml bench -s 3 -m 8 -p 16      # three servers, eight map tasks
//! eddyd inspect -d ./data/eddy-0 -a app -p 3    # dump the index of a stored partition
//! ```

mod cluster;
mod config;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use eddy_client::{
    BlockDispatcher, CommitCoordinator, HashPartitioner, IdentityCodec, LengthPrefixedSerializer,
    MapOutput, MemoryPool, Record, RecordSerializer, ShuffleReadClient, ShuffleSession,
    ShuffleWriter, TaskContext, TaskMemory, WriteBufferManager,
};
use eddy_store::{LocalFileTier, ShuffleStorage};
use eddy_types::{PartitionKey, PartitionRange};
use tracing::{error, info};

use cluster::LocalCluster;
use config::EddyConfig;

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "eddyd", version, about = "Eddy remote shuffle service")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true, env = "EDDY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a shuffle through an in-process cluster and read it back.
    Bench {
        /// Number of shuffle servers.
        #[arg(short, long, default_value = "3")]
        servers: u16,

        /// Number of map tasks writing the shuffle.
        #[arg(short, long, default_value = "4")]
        maps: u32,

        /// Number of reduce partitions.
        #[arg(short, long, default_value = "8")]
        partitions: u32,

        /// Records written by each map task.
        #[arg(short = 'n', long, default_value = "100000")]
        records: u64,

        /// Size of each record value in bytes.
        #[arg(long, default_value = "100")]
        value_size: usize,

        /// Override `client.replica`.
        #[arg(short, long)]
        replica: Option<usize>,

        /// Override `storage.tiers`.
        #[arg(short, long)]
        tiers: Option<String>,

        /// Keep local files under `storage.local_dir` instead of a temporary directory.
        #[arg(long)]
        keep: bool,
    },

    /// Print the index entries of one partition stored by a local file tier.
    Inspect {
        /// Base directory of the tier (one server's directory).
        #[arg(short, long)]
        dir: PathBuf,

        #[arg(short, long)]
        app: String,

        #[arg(long, default_value = "0")]
        shuffle: u32,

        #[arg(short, long)]
        partition: u32,
    },
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = EddyConfig::load(cli.config.as_deref()).context("failed to load config")?;

    setup_tracing(&config.log.level);

    match cli.command {
        Commands::Bench {
            servers,
            maps,
            partitions,
            records,
            value_size,
            replica,
            tiers,
            keep,
        } => {
            // CLI args override config file values.
            if let Some(replica) = replica {
                config.client.replica = replica;
            }
            if let Some(tiers) = tiers {
                config.storage.tiers = tiers;
            }
            let bench = Bench {
                servers,
                maps,
                partitions,
                records,
                value_size,
                keep,
            };
            cmd_bench(&config, bench).await
        }
        Commands::Inspect {
            dir,
            app,
            shuffle,
            partition,
        } => cmd_inspect(&config, dir, &app, shuffle, partition).await,
    }
}

/// Initialize the `tracing` subscriber with the given level filter.
///
/// Respects `RUST_LOG` env var if set, otherwise uses the config value.
fn setup_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

// -----------------------------------------------------------------------
// eddyd bench
// -----------------------------------------------------------------------

struct Bench {
    servers: u16,
    maps: u32,
    partitions: u32,
    records: u64,
    value_size: usize,
    keep: bool,
}

const BENCH_APP: &str = "eddy-bench";

async fn cmd_bench(config: &EddyConfig, bench: Bench) -> Result<()> {
    if bench.servers == 0 || bench.partitions == 0 {
        bail!("bench needs at least one server and one partition");
    }
    let replica = config.client.replica.clamp(1, bench.servers as usize);

    println!("Eddy Benchmark");
    println!("  servers:    {}", bench.servers);
    println!("  tiers:      {}", config.storage.tiers);
    println!("  maps:       {}", bench.maps);
    println!("  partitions: {}", bench.partitions);
    println!("  records:    {} per map, {} bytes each", bench.records, bench.value_size);
    println!("  replica:    {replica}");
    println!();

    let temp = tempfile::tempdir()?;
    let local_root = if bench.keep {
        config.storage.local_dir.clone()
    } else {
        temp.path().to_path_buf()
    };
    let cluster = LocalCluster::start(config, bench.servers, &local_root).await?;

    let shuffle_id = 0;
    let assignment = Arc::new(cluster.assign(shuffle_id, bench.partitions, replica));
    let session = Arc::new(ShuffleSession::new(BENCH_APP, shuffle_id));
    let pool = Arc::new(MemoryPool::new(config.client.memory_capacity));
    let buffer_options = config.buffer_options()?;
    let dispatcher = Arc::new(BlockDispatcher::new(
        cluster.client().clone(),
        Arc::clone(&session),
        config.dispatch_options(),
        0,
        buffer_options.send_size_limit,
    ));
    let coordinator = Arc::new(CommitCoordinator::new(
        cluster.client().clone(),
        None,
        Arc::clone(&session),
        config.commit_options(),
        0,
        0,
    ));
    let partitioner = Arc::new(HashPartitioner::new(bench.partitions));
    let value = Bytes::from(generate_bench_data(bench.value_size));
    let total_bytes = bench.maps as u64 * bench.records * bench.value_size as u64;

    // --- Write ---
    print!("Writing {} map outputs... ", bench.maps);
    let start = Instant::now();
    let mut outputs: Vec<MapOutput> = Vec::with_capacity(bench.maps as usize);
    for map in 0..bench.maps {
        let task_id = format!("map-{map}");
        let memory = Arc::new(TaskMemory::new(
            task_id.clone(),
            Arc::clone(&pool),
            buffer_options.memory_acquire_retries,
            buffer_options.memory_acquire_interval,
        ));
        let manager = WriteBufferManager::new(
            shuffle_id,
            map as u64,
            buffer_options.clone(),
            Arc::clone(&assignment),
            Arc::new(LengthPrefixedSerializer),
            Arc::new(IdentityCodec),
            memory,
        );
        let mut writer = ShuffleWriter::new(
            TaskContext {
                task_id,
                task_attempt_id: map as u64,
                shuffle_id,
                expected_task_count: bench.maps,
            },
            manager,
            Arc::clone(&dispatcher),
            Arc::clone(&coordinator),
            partitioner.clone(),
            assignment.servers(),
        );
        let records = (0..bench.records)
            .map(|i| Record::new(format!("key-{map}-{i}"), value.clone()));
        if let Err(e) = writer.write(records).await {
            error!(map, error = %e, "map task failed");
            writer.stop(false).await?;
            return Err(e.into());
        }
        if let Some(output) = writer.stop(true).await? {
            outputs.push(output);
        }
    }
    let write_dur = start.elapsed();
    let write_mbs = total_bytes as f64 / write_dur.as_secs_f64() / 1_048_576.0;
    println!("{:.2}s ({write_mbs:.1} MB/s)", write_dur.as_secs_f64());

    let mut blocks_per_partition: BTreeMap<u32, usize> = BTreeMap::new();
    for output in &outputs {
        for (partition, ids) in &output.partition_to_block_ids {
            *blocks_per_partition.entry(*partition).or_default() += ids.len();
        }
    }

    // --- Read ---
    print!("Reading {} partitions... ", bench.partitions);
    let serializer = LengthPrefixedSerializer;
    let start = Instant::now();
    let mut records_read = 0u64;
    let mut blocks_read = 0usize;
    for (partition, replicas) in assignment.partitions() {
        let reader = ShuffleReadClient::new(
            cluster.client().clone(),
            Arc::new(IdentityCodec),
            config.read_options(),
            PartitionKey::new(BENCH_APP, shuffle_id, partition),
            cluster.replica_sources(replicas),
        );
        let blocks = reader.read().await?;
        let expected = blocks_per_partition.get(&partition).copied().unwrap_or(0);
        if blocks.len() != expected {
            bail!("partition {partition}: read {} blocks, wrote {expected}", blocks.len());
        }
        blocks_read += blocks.len();
        for block in blocks {
            records_read += serializer.deserialize(block.data)?.len() as u64;
        }
    }
    let read_dur = start.elapsed();
    let read_mbs = total_bytes as f64 / read_dur.as_secs_f64() / 1_048_576.0;
    println!("{:.2}s ({read_mbs:.1} MB/s)", read_dur.as_secs_f64());

    let written = bench.maps as u64 * bench.records;
    if records_read != written {
        bail!("read {records_read} records, wrote {written}");
    }
    info!(blocks = blocks_read, records = records_read, "bench round trip verified");

    println!();
    println!("Summary:");
    println!("  Write throughput: {write_mbs:.1} MB/s");
    println!("  Read throughput:  {read_mbs:.1} MB/s");
    println!("  Blocks:           {blocks_read}");
    println!("  Records:          {records_read}");
    println!(
        "  Total data:       {:.1} MB",
        total_bytes as f64 / 1_048_576.0
    );
    for server in cluster.servers() {
        println!(
            "  {}: {} bytes still buffered",
            server.info(),
            server.store().used_bytes()
        );
    }

    Ok(())
}

/// Generate deterministic test data for benchmarking.
fn generate_bench_data(size: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(size);
    let mut state: u32 = 0x5EED_CAFE;
    for _ in 0..size {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        data.push((state >> 16) as u8);
    }
    data
}

// -----------------------------------------------------------------------
// eddyd inspect
// -----------------------------------------------------------------------

async fn cmd_inspect(
    config: &EddyConfig,
    dir: PathBuf,
    app: &str,
    shuffle: u32,
    partition: u32,
) -> Result<()> {
    let tier = LocalFileTier::new(&dir, u64::MAX)
        .with_context(|| format!("failed to open {}", dir.display()))?;
    let range = PartitionRange::containing(partition, config.server.partition_range_width);
    let files = tier.list_files(app, shuffle, range).await?;
    if files.is_empty() {
        println!("no files for {app}/{shuffle}/{range} under {}", dir.display());
        return Ok(());
    }

    for file in files {
        let index = tier.read_index(&file).await?;
        println!(
            "{file}: {} entries, {} data bytes",
            index.entries.len(),
            index.data_len
        );
        println!(
            "  {:>12} {:>10} {:>12} {:>10} {:>20} {:>10}",
            "offset", "length", "uncompressed", "crc", "block_id", "attempt"
        );
        for entry in &index.entries {
            let marker = if entry.end().is_none_or(|end| end > index.data_len) { " (beyond data)" } else { "" };
            println!(
                "  {:>12} {:>10} {:>12} {:>10x} {:>20} {:>10}{marker}",
                entry.offset,
                entry.length,
                entry.uncompressed_length,
                entry.crc,
                entry.block_id,
                entry.task_attempt_id
            );
        }
    }
    Ok(())
}
