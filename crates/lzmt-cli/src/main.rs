use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand, ValueEnum};
use lzmt_core::options::{PRESET_DEFAULT, PRESET_MAX};
use lzmt_core::parallel::auto_block_size;
use lzmt_core::telemetry::{self, profile};
use lzmt_core::{
    BufferPool, DefaultBlockTelemetry, DictMode, ExecutorRuntimeSnapshot, Lzma2Options,
    Lzma2Parallel, Lzma2Writer, Mode, ParallelConfig, StreamStats, TaskExecutor,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "lzmt",
    version,
    about = "Multithreaded LZMA2 compressor",
    long_about = "Compress files into raw LZMA2 streams, sequentially or in parallel blocks."
)]
struct Cli {
    /// Restrict profiling events to these tags (comma separated; needs the
    /// `profiling` feature).
    #[arg(long, global = true, value_delimiter = ',')]
    profile_tags: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compress a file into a raw LZMA2 stream.
    Compress {
        /// File to compress.
        input: PathBuf,

        /// Destination path (defaults to <input>.lzma2).
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        codec: CodecArgs,

        #[command(flatten)]
        parallel: ParallelArgs,

        /// Print the run summary as JSON, telemetry included.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Show the resolved settings and memory estimates for the given flags.
    Info {
        #[command(flatten)]
        codec: CodecArgs,

        #[command(flatten)]
        parallel: ParallelArgs,

        /// Print as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[derive(Args, Clone)]
struct CodecArgs {
    /// Compression preset, 0 (fastest) to 9.
    #[arg(long, default_value_t = PRESET_DEFAULT, value_parser = clap::value_parser!(u32).range(0..=PRESET_MAX as i64))]
    preset: u32,

    /// Dictionary size (supports suffixes K/M/G, e.g. 64K, 8M).
    #[arg(long, value_parser = parse_size)]
    dict_size: Option<usize>,

    /// Literal context bits.
    #[arg(long)]
    lc: Option<u32>,

    /// Literal position bits.
    #[arg(long)]
    lp: Option<u32>,

    /// Position bits.
    #[arg(long)]
    pb: Option<u32>,

    /// Parsing mode (defaults to the preset's).
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,
}

#[derive(Args, Clone)]
struct ParallelArgs {
    /// Uncompressed bytes per parallel block (supports suffixes K/M/G).
    #[arg(long, value_parser = parse_size)]
    block_size: Option<usize>,

    /// How dictionary history crosses block boundaries.
    #[arg(long, value_enum, default_value_t = DictModeArg::Auto)]
    dict_mode: DictModeArg,

    /// Most blocks alive at once.
    #[arg(long, default_value_t = num_cpus::get().clamp(1, 255))]
    affinity: usize,

    /// Number of worker threads; 0 compresses on the calling thread.
    #[arg(long, default_value_t = num_cpus::get())]
    workers: usize,

    /// Cap on bytes held by live pooled buffers (supports suffixes K/M/G).
    #[arg(long, value_parser = parse_size)]
    pool_limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Store,
    Fast,
    Normal,
}

impl From<ModeArg> for Mode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Store => Mode::Uncompressed,
            ModeArg::Fast => Mode::Fast,
            ModeArg::Normal => Mode::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DictModeArg {
    None,
    Set,
    AsyncSet,
    Auto,
}

impl From<DictModeArg> for DictMode {
    fn from(value: DictModeArg) -> Self {
        match value {
            DictModeArg::None => DictMode::None,
            DictModeArg::Set => DictMode::Set,
            DictModeArg::AsyncSet => DictMode::AsyncSet,
            DictModeArg::Auto => DictMode::Auto,
        }
    }
}

impl CodecArgs {
    fn options(&self) -> Result<Lzma2Options, Box<dyn std::error::Error>> {
        let mut options = Lzma2Options::preset(self.preset)?;
        if let Some(dict_size) = self.dict_size {
            let dict_size = u32::try_from(dict_size)
                .map_err(|_| format!("dictionary size too large: {dict_size}"))?;
            options.set_dict_size(dict_size)?;
        }
        if self.lc.is_some() || self.lp.is_some() {
            let lc = self.lc.unwrap_or(options.lc());
            let lp = self.lp.unwrap_or(options.lp());
            options.set_lc_lp(lc, lp)?;
        }
        if let Some(pb) = self.pb {
            options.set_pb(pb)?;
        }
        if let Some(mode) = self.mode {
            options.set_mode(mode.into());
        }
        Ok(options)
    }
}

impl ParallelArgs {
    fn config(&self) -> ParallelConfig {
        ParallelConfig {
            block_size: self.block_size.unwrap_or(0),
            dict_mode: self.dict_mode.into(),
            affinity: self.affinity,
            allow_small_blocks: false,
        }
    }

    /// Builds a coordinator backed by its own executor and pool.
    fn coordinator(
        &self,
        options: &Lzma2Options,
    ) -> Result<(Arc<Lzma2Parallel>, Arc<TaskExecutor>), Box<dyn std::error::Error>> {
        let config = self.config();
        let executor = Arc::new(TaskExecutor::new(self.workers.max(1))?);
        let idle_buffers = config.affinity.saturating_mul(3).saturating_add(2);
        let pool = Arc::new(match self.pool_limit {
            Some(limit) => BufferPool::with_limit(limit, idle_buffers),
            None => BufferPool::new(idle_buffers),
        });
        let coordinator = Lzma2Parallel::with_resources(
            options.clone(),
            config,
            Arc::clone(&executor),
            pool,
            Arc::new(DefaultBlockTelemetry),
        )?;
        Ok((Arc::new(coordinator), executor))
    }
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    if !cli.profile_tags.is_empty() {
        let tags: Vec<&str> = cli.profile_tags.iter().map(String::as_str).collect();
        profile::set_enabled_tags(&tags);
    }

    match cli.command {
        Commands::Compress {
            input,
            output,
            codec,
            parallel,
            json,
        } => compress_command(input, output, &codec, &parallel, json)?,
        Commands::Info {
            codec,
            parallel,
            json,
        } => info_command(&codec, &parallel, json)?,
    }

    Ok(())
}

struct RunSummary {
    stats: StreamStats,
    elapsed: Duration,
    block_size: Option<usize>,
    dict_mode: Option<DictMode>,
    extra_memory: usize,
    runtime: Option<ExecutorRuntimeSnapshot>,
}

fn compress_command(
    input: PathBuf,
    output: Option<PathBuf>,
    codec: &CodecArgs,
    parallel: &ParallelArgs,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let options = codec.options()?;
    let output_path = output.unwrap_or_else(|| default_output_path(&input));
    if output_path == input {
        return Err(format!("output would overwrite input: {}", input.display()).into());
    }
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut reader = BufReader::new(File::open(&input)?);
    let sink = BufWriter::new(File::create(&output_path)?);
    tracing::info!(
        input = %input.display(),
        output = %output_path.display(),
        options = %options,
        workers = parallel.workers,
        "compressing"
    );

    let started_at = Instant::now();
    let summary = if parallel.workers == 0 {
        let mut writer = Lzma2Writer::new(sink, &options)?;
        io::copy(&mut reader, &mut writer)?;
        writer.finish()?;
        let stats = writer.stats();
        writer.close()?;
        RunSummary {
            stats,
            elapsed: started_at.elapsed(),
            block_size: None,
            dict_mode: None,
            extra_memory: 0,
            runtime: None,
        }
    } else {
        let (coordinator, executor) = parallel.coordinator(&options)?;
        let mut writer = coordinator.writer(sink)?;
        io::copy(&mut reader, &mut writer)?;
        writer.finish()?;
        let stats = writer.stats();
        writer.close()?;
        let elapsed = started_at.elapsed();
        let runtime = executor.runtime_snapshot();
        executor.shutdown()?;
        RunSummary {
            stats,
            elapsed,
            block_size: Some(coordinator.block_size()),
            dict_mode: Some(coordinator.dict_mode()),
            extra_memory: coordinator.extra_memory_usage_bytes(),
            runtime: Some(runtime),
        }
    };

    if json {
        let value = json!({
            "input": input.display().to_string(),
            "output": output_path.display().to_string(),
            "options": options.to_string(),
            "props_byte": options.props_byte(),
            "dict_size_byte": options.dict_size_byte(),
            "elapsed_ms": summary.elapsed.as_millis() as u64,
            "stats": summary.stats,
            "block_size": summary.block_size,
            "dict_mode": summary.dict_mode,
            "encoder_memory_bytes": options.encoder_memory_usage() + summary.extra_memory,
            "telemetry": telemetry::snapshot(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        print_summary(&input, &output_path, &options, &summary);
    }
    Ok(())
}

fn info_command(
    codec: &CodecArgs,
    parallel: &ParallelArgs,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let options = codec.options()?;
    let config = parallel.config();
    config.validate()?;

    let dict_size = options.dict_size() as usize;
    let block_size = match config.block_size {
        0 => auto_block_size(dict_size),
        size => size,
    };
    let dict_mode = config.dict_mode.resolve(block_size, dict_size);
    let extra_memory = if parallel.workers == 0 {
        0
    } else {
        let (coordinator, executor) = parallel.coordinator(&options)?;
        let extra = coordinator.extra_memory_usage_bytes();
        executor.shutdown()?;
        extra
    };

    if json {
        let value = json!({
            "options": options.to_string(),
            "dict_size": options.dict_size(),
            "lc": options.lc(),
            "lp": options.lp(),
            "pb": options.pb(),
            "mode": options.mode(),
            "nice_len": options.nice_len(),
            "depth_limit": options.effective_depth_limit(),
            "props_byte": options.props_byte(),
            "dict_size_byte": options.dict_size_byte(),
            "encoder_memory_bytes": options.encoder_memory_usage(),
            "decoder_memory_bytes": options.decoder_memory_usage(),
            "parallel": {
                "workers": parallel.workers,
                "block_size": block_size,
                "dict_mode": dict_mode,
                "affinity": config.affinity,
                "pool_limit": parallel.pool_limit,
                "extra_memory_bytes": extra_memory,
            },
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("options: {options}");
    println!(
        "  dictionary: {} (filter byte {:#04x})",
        format_bytes(u64::from(options.dict_size())),
        options.dict_size_byte()
    );
    println!(
        "  lc/lp/pb: {}/{}/{} (props byte {:#04x})",
        options.lc(),
        options.lp(),
        options.pb(),
        options.props_byte()
    );
    println!(
        "  mode: {:?} | nice length {} | depth {}",
        options.mode(),
        options.nice_len(),
        options.effective_depth_limit()
    );
    println!(
        "  memory: encoder {} | decoder {}",
        format_bytes(options.encoder_memory_usage() as u64),
        format_bytes(options.decoder_memory_usage() as u64)
    );
    if parallel.workers == 0 {
        println!("parallel: off (sequential writer)");
    } else {
        println!(
            "parallel: {} workers | affinity {} | block {} | dict mode {dict_mode:?}",
            parallel.workers,
            config.affinity,
            format_bytes(block_size as u64)
        );
        println!("  extra memory: {}", format_bytes(extra_memory as u64));
        if let Some(limit) = parallel.pool_limit {
            println!("  pool limit: {}", format_bytes(limit as u64));
        }
    }
    Ok(())
}

fn print_summary(input: &Path, output: &Path, options: &Lzma2Options, summary: &RunSummary) {
    let stats = &summary.stats;
    let elapsed_secs = summary.elapsed.as_secs_f64().max(1e-6);
    let read_bps = stats.uncompressed_bytes as f64 / elapsed_secs;
    let write_bps = stats.compressed_bytes as f64 / elapsed_secs;

    println!("compress complete");
    println!("  source: {}", input.display());
    println!("  output: {}", output.display());
    println!(
        "  options: {options} (props {:#04x}, dict byte {:#04x})",
        options.props_byte(),
        options.dict_size_byte()
    );
    println!("  elapsed: {}", format_duration(summary.elapsed));
    println!("  input bytes: {}", format_bytes(stats.uncompressed_bytes));
    println!("  output bytes: {}", format_bytes(stats.compressed_bytes));
    println!("  ratio: {:.3}", stats.ratio());
    println!("  throughput: {}/s", format_rate(read_bps));
    println!("  write throughput: {}/s", format_rate(write_bps));
    println!(
        "  chunks: {} lzma | {} uncompressed",
        stats.lzma_chunks, stats.raw_chunks
    );
    println!(
        "  memory estimate: {}",
        format_bytes((options.encoder_memory_usage() + summary.extra_memory) as u64)
    );

    let (Some(block_size), Some(dict_mode), Some(runtime)) =
        (summary.block_size, summary.dict_mode, summary.runtime.as_ref())
    else {
        return;
    };

    println!(
        "  blocks: {} of {} | dict mode {dict_mode:?}",
        stats.blocks,
        format_bytes(block_size as u64)
    );
    let total_tasks: usize = runtime
        .workers
        .iter()
        .map(|worker| worker.tasks_completed)
        .sum();
    let max_tasks = runtime
        .workers
        .iter()
        .map(|worker| worker.tasks_completed)
        .max()
        .unwrap_or(0);
    let min_tasks = runtime
        .workers
        .iter()
        .map(|worker| worker.tasks_completed)
        .min()
        .unwrap_or(0);
    println!(
        "  scheduler: {} workers | task balance min/max {min_tasks}/{max_tasks} | total tasks {total_tasks}",
        runtime.workers.len()
    );
    for worker in &runtime.workers {
        println!(
            "    w{:02} tasks {:>6} | busy {:>8} | idle {:>8} | util {:>6.2}%",
            worker.worker_id,
            worker.tasks_completed,
            format_duration(worker.busy),
            format_duration(worker.idle),
            worker.utilization * 100.0,
        );
    }

    let snapshot = telemetry::snapshot();
    let blocks = snapshot.blocks();
    if let Some(latency) = blocks.latency_us {
        println!(
            "  block latency: mean {} | max {} | {} failed",
            format_duration(Duration::from_micros(latency.mean as u64)),
            format_duration(Duration::from_micros(latency.max)),
            blocks.failed
        );
    }
    let buffers = snapshot.buffers();
    println!(
        "  buffers: {} created | {} recycled | {} live",
        buffers.created,
        buffers.recycled,
        format_bytes(buffers.live_bytes)
    );
}

fn default_output_path(input: &Path) -> PathBuf {
    let mut out = input.as_os_str().to_os_string();
    out.push(".lzma2");
    PathBuf::from(out)
}

fn parse_size(value: &str) -> Result<usize, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("size cannot be empty".to_string());
    }

    let split_at = trimmed
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (num_part, suffix_part) = trimmed.split_at(split_at);
    if num_part.is_empty() {
        return Err(format!("invalid size: {value}"));
    }

    let base: usize = num_part
        .parse()
        .map_err(|_| format!("invalid size number: {value}"))?;

    let multiplier = match suffix_part.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1usize,
        "k" | "kb" | "kib" => 1 << 10,
        "m" | "mb" | "mib" => 1 << 20,
        "g" | "gb" | "gib" => 1 << 30,
        other => {
            return Err(format!("invalid size suffix '{other}' in '{value}'"));
        }
    };

    base.checked_mul(multiplier)
        .ok_or_else(|| format!("size overflows: {value}"))
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0usize;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[unit])
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

fn format_rate(bytes_per_second: f64) -> String {
    if !bytes_per_second.is_finite() || bytes_per_second <= 0.0 {
        return "0 B".to_string();
    }
    format_bytes(bytes_per_second as u64)
}

fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let millis = duration.subsec_millis();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else if minutes > 0 {
        format!("{minutes:02}:{seconds:02}")
    } else {
        format!("{seconds}.{millis:03}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_accepts_suffixes() {
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("64K"), Ok(64 << 10));
        assert_eq!(parse_size("8m"), Ok(8 << 20));
        assert_eq!(parse_size("1GiB"), Ok(1 << 30));
        assert!(parse_size("").is_err());
        assert!(parse_size("M").is_err());
        assert!(parse_size("3X").is_err());
    }

    #[test]
    fn codec_flags_override_the_preset() {
        let cli = Cli::parse_from([
            "lzmt", "info", "--preset", "2", "--dict-size", "1M", "--lc", "1", "--pb", "0",
            "--mode", "normal",
        ]);
        let Commands::Info { codec, .. } = cli.command else {
            panic!("expected info");
        };
        let options = codec.options().unwrap();
        assert_eq!(options.dict_size(), 1 << 20);
        assert_eq!((options.lc(), options.lp(), options.pb()), (1, 0, 0));
        assert_eq!(options.mode(), Mode::Normal);
    }

    #[test]
    fn invalid_codec_flags_are_rejected() {
        let cli = Cli::parse_from(["lzmt", "info", "--lc", "4", "--lp", "1"]);
        let Commands::Info { codec, .. } = cli.command else {
            panic!("expected info");
        };
        assert!(codec.options().is_err());
    }

    #[test]
    fn default_output_appends_extension() {
        assert_eq!(
            default_output_path(Path::new("data/log.txt")),
            PathBuf::from("data/log.txt.lzma2")
        );
    }
}
