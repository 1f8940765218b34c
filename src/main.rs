mod cache;
mod config;
mod histogram;
mod metrics;
mod pipeline;
mod schema;
mod writer;

use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use cache::HistogramCache;
use config::ConvertConfig;
use metrics::ConvertMetrics;
use pipeline::reader::RecordReader;
use pipeline::rewriter::rewrite_histograms;
use schema::DimensionSchema;
use writer::RecordWriter;

/// Poll interval while waiting for a listed input file to appear.
const FILE_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(
    name = "telemetry-convert",
    version,
    about = "Batch telemetry conversion pipeline"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a list of framed telemetry files into partitioned upload data
    Convert {
        /// Path to the JSON configuration file
        config: PathBuf,

        /// File containing one input path per line; missing files are
        /// polled until they appear
        file_list: PathBuf,
    },

    /// Read a framed telemetry file and report record counts (dev/validation tool)
    Inspect {
        /// Path to a framed telemetry file
        path: PathBuf,

        /// Print each parsed record as `path<TAB>timestamp<TAB>json`
        #[arg(long)]
        dump: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("telemetry_convert=info".parse()?),
        )
        .init();

    match cli.command {
        Commands::Convert { config, file_list } => cmd_convert(&config, &file_list),
        Commands::Inspect { path, dump } => cmd_inspect(&path, dump),
    }
}

// ---------------------------------------------------------------------------
// convert subcommand
// ---------------------------------------------------------------------------

fn cmd_convert(config_path: &Path, file_list: &Path) -> Result<()> {
    let config = ConvertConfig::load(config_path)?;
    // counter snapshots are logged here; the heka collector consumes
    // them out-of-process
    tracing::debug!(heka_server = %config.heka_server, "metrics collector configured");
    let mut schema = DimensionSchema::from_file(&config.telemetry_schema)?;
    let mut cache = HistogramCache::new(&config.histogram_server, std::env::temp_dir())?;
    let mut writer = RecordWriter::new(
        &config.storage_path,
        &config.upload_path,
        config.max_uncompressed,
        config.memory_constraint,
        config.compression_preset,
    );
    let mut reader = RecordReader::new();

    let list = std::fs::read_to_string(file_list)
        .with_context(|| format!("file open failed: {}", file_list.display()))?;

    let mut exceptions = 0u64;
    for line in list.lines() {
        let name = line.trim();
        if name.is_empty() {
            continue;
        }
        let path = Path::new(name);
        while !path.exists() {
            std::thread::sleep(FILE_POLL_INTERVAL);
        }

        let mut file_metrics = ConvertMetrics::default();
        match process_file(
            path,
            &mut reader,
            &mut schema,
            &mut cache,
            &mut writer,
            &mut file_metrics,
        ) {
            Ok(()) => {
                if let Err(e) = std::fs::remove_file(path) {
                    tracing::warn!(file = name, error = %e, "failed to remove processed file");
                }
            }
            Err(e) => {
                // the file is left in place for the next invocation
                tracing::error!(file = name, error = %e, "file processing failed");
                file_metrics.exceptions += 1;
                exceptions += 1;
            }
        }

        metrics::emit("cache", name, &cache.metrics.drain());
        metrics::emit("record", name, &reader.metrics.drain());
        metrics::emit("schema", name, &schema.metrics.drain());
        metrics::emit("converter", name, &file_metrics.drain());
    }

    let clean = writer.finalize();
    anyhow::ensure!(
        exceptions == 0 && clean,
        "conversion finished with failures"
    );
    Ok(())
}

/// Process one framed input file: read, rewrite, route, write.
///
/// Per-record failures are counted and skipped; an `Err` here is
/// file-level fatal and leaves the input file on disk.
fn process_file(
    path: &Path,
    reader: &mut RecordReader,
    schema: &mut DimensionSchema,
    cache: &mut HistogramCache,
    writer: &mut RecordWriter,
    file_metrics: &mut ConvertMetrics,
) -> Result<()> {
    tracing::info!(file = %path.display(), "processing file");
    let start = Instant::now();

    let file = std::fs::File::open(path)
        .with_context(|| format!("file open failed: {}", path.display()))?;
    let data_in = file.metadata()?.len();
    let mut input = BufReader::new(file);

    let mut out_buf: Vec<u8> = Vec::new();
    while let Some(mut record) = reader.read(&mut input)? {
        file_metrics.records_processed += 1;

        if !rewrite_histograms(cache, &mut record.doc) {
            file_metrics.records_discarded += 1;
            continue;
        }

        // output record: document UUID (path prefix), tab, converted JSON
        out_buf.clear();
        let uuid = record.path.split('/').next().unwrap_or("");
        out_buf.extend_from_slice(uuid.as_bytes());
        out_buf.push(b'\t');
        serde_json::to_writer(&mut out_buf, &record.doc)?;
        out_buf.push(b'\n');

        let partition = schema.dimension_path(&record.doc["info"], record.timestamp);
        if writer.write(&partition, &out_buf) {
            file_metrics.data_out += out_buf.len() as u64;
        } else {
            file_metrics.records_discarded += 1;
        }
    }

    let elapsed = start.elapsed().as_secs_f64();
    file_metrics.processing_time = elapsed;
    file_metrics.data_in = data_in;
    if elapsed > 0.0 {
        file_metrics.throughput = data_in as f64 / 1024.0 / 1024.0 / elapsed;
    }

    tracing::info!(
        file = %path.display(),
        processed = file_metrics.records_processed,
        discarded = file_metrics.records_discarded,
        time_s = file_metrics.processing_time,
        throughput_mib_s = file_metrics.throughput,
        data_in = file_metrics.data_in,
        data_out = file_metrics.data_out,
        "done processing file"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// inspect subcommand
// ---------------------------------------------------------------------------

fn cmd_inspect(path: &Path, dump: bool) -> Result<()> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("file open failed: {}", path.display()))?;
    let mut input = BufReader::new(file);
    let mut reader = RecordReader::new();

    let mut records = 0u64;
    while let Some(record) = reader.read(&mut input)? {
        records += 1;
        if dump {
            println!("{}\t{}\t{}", record.path, record.timestamp, record.doc);
        }
    }

    let m = &reader.metrics;
    eprintln!("records: {}", records);
    eprintln!("corrupt bytes: {}", m.corrupt_data);
    eprintln!("invalid path lengths: {}", m.invalid_path_length);
    eprintln!("invalid data lengths: {}", m.invalid_data_length);
    eprintln!("inflate failures: {}", m.inflate_failures);
    eprintln!("parse failures: {}", m.parse_failures);
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
