//! Ferry - concurrent batch upload/download against an object store.

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ferry::display::BarView;
use ferry::download::{ApiResolver, DownloadWorker, LocationResolver};
use ferry::logger::{JsonLogger, Logger, NoopLogger, TextLogger};
use ferry::manifest;
use ferry::transport::{HttpTransport, Transport};
use ferry::upload::UploadWorker;
use ferry::{
    AggregationMode, DownloadDescriptor, DuplicatePolicy, JobReport, Metadata, NamingMode,
    Orchestrator, TransferConfig, TransferError, UploadDescriptor,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Ferry - concurrent batch transfers to and from object storage")]
struct Cli {
    /// Settings file (TOML); missing file means defaults
    #[arg(long, global = true, default_value = "ferry.toml")]
    config: PathBuf,

    /// Append a log entry per transfer event to this file
    #[arg(long = "log-file", global = true)]
    log_file: Option<PathBuf>,

    /// Write the log file as JSON lines
    #[arg(long = "json-log", global = true)]
    json_log: bool,

    /// Concurrent transfers (overrides pool_size)
    #[arg(short = 'j', long, global = true)]
    jobs: Option<usize>,

    /// What the job-wide bar counts
    #[arg(long, global = true, value_enum, default_value_t = AggregationMode::ByteSum)]
    progress: AggregationMode,

    /// Print skipped and failed files as they happen
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Extra request header, NAME:VALUE (repeatable)
    #[arg(long = "header", global = true, action = clap::ArgAction::Append)]
    headers: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file or directory tree
    Upload(UploadArgs),
    /// Download the files listed in a JSON manifest
    Download(DownloadArgs),
}

#[derive(ClapArgs, Debug)]
struct UploadArgs {
    /// File or directory to upload
    #[arg(required_unless_present = "manifest")]
    source: Option<PathBuf>,

    /// JSON list of upload descriptors (e.g. a previous --failed-out)
    #[arg(long, conflicts_with = "source")]
    manifest: Option<PathBuf>,

    /// Base URL objects are posted under
    #[arg(long)]
    endpoint: String,

    /// Key prefix for directory uploads
    #[arg(long, default_value = "")]
    prefix: String,

    /// Job metadata KEY=VALUE (repeatable, wins over per-file metadata)
    #[arg(long = "meta", action = clap::ArgAction::Append)]
    meta: Vec<String>,

    /// Treat "already exists" (HTTP 409) as a skip
    #[arg(long)]
    skip_duplicates: bool,

    /// Write descriptors of failed uploads here
    #[arg(long = "failed-out")]
    failed_out: Option<PathBuf>,
}

#[derive(ClapArgs, Debug)]
struct DownloadArgs {
    /// JSON list of download descriptors
    manifest: PathBuf,

    /// Directory files are written into
    #[arg(long)]
    dest: PathBuf,

    /// Base URL used to re-resolve expired download links
    #[arg(long)]
    api: Option<String>,

    #[arg(long, value_enum)]
    naming: Option<NamingMode>,

    /// What to do when the local file already exists
    #[arg(long, value_enum)]
    duplicates: Option<DuplicatePolicy>,

    /// Write descriptors of failed downloads here
    #[arg(long = "failed-out")]
    failed_out: Option<PathBuf>,
}

fn parse_pairs(items: &[String], sep: char, what: &str) -> Result<Vec<(String, String)>> {
    items
        .iter()
        .map(|item| match item.split_once(sep) {
            Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.trim().to_string())),
            _ => bail!("invalid {what} {item:?}, expected KEY{sep}VALUE"),
        })
        .collect()
}

fn make_logger(cli: &Cli) -> Result<Arc<dyn Logger>> {
    Ok(match &cli.log_file {
        Some(p) if cli.json_log => Arc::new(JsonLogger::new(p)?),
        Some(p) => Arc::new(TextLogger::new(p)?),
        None => Arc::new(NoopLogger),
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = TransferConfig::load(&cli.config)?;
    if let Some(jobs) = cli.jobs {
        config.pool_size = jobs;
    }
    config.validate()?;

    let logger = make_logger(&cli)?;
    let headers = parse_pairs(&cli.headers, ':', "header")?;
    let transport: Arc<dyn Transport> =
        Arc::new(HttpTransport::new(&headers).context("Failed to set up HTTP client")?);

    let orchestrator = Orchestrator::from_config(&config, cli.progress, Arc::clone(&logger));

    // First Ctrl-C stops new transfers; a second one exits immediately.
    let cancel = orchestrator.cancel_handle();
    let interrupted = AtomicBool::new(false);
    ctrlc::set_handler(move || {
        if interrupted.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        eprintln!("\nInterrupted. Finishing in-flight transfers (Ctrl-C again to abort)...");
        cancel.cancel();
    })
    .context("Error setting Ctrl-C handler")?;

    let report = match &cli.command {
        Command::Upload(args) => run_upload(&cli, &config, args, transport, logger, &orchestrator)?,
        Command::Download(args) => run_download(&cli, &config, args, transport, logger, &orchestrator)?,
    };

    if !report.is_clean() {
        std::process::exit(1);
    }
    Ok(())
}

fn expected_total(mode: AggregationMode, items: usize, bytes: u64) -> u64 {
    match mode {
        AggregationMode::ByteSum => bytes,
        AggregationMode::ItemCount => items as u64,
    }
}

fn run_upload(
    cli: &Cli,
    config: &TransferConfig,
    args: &UploadArgs,
    transport: Arc<dyn Transport>,
    logger: Arc<dyn Logger>,
    orchestrator: &Orchestrator,
) -> Result<JobReport> {
    let items: Vec<UploadDescriptor> = match (&args.manifest, &args.source) {
        (Some(path), _) => manifest::read_manifest(path)?,
        (None, Some(source)) => manifest::enumerate_uploads(source, &args.prefix)?,
        (None, None) => bail!("nothing to upload"),
    };
    let job_metadata: Metadata = parse_pairs(&args.meta, '=', "metadata")?.into_iter().collect();

    let worker = UploadWorker::new(transport, args.endpoint.clone(), logger)
        .job_metadata(job_metadata)
        .skip_duplicates(args.skip_duplicates || config.skip_duplicates)
        .chunk_size(config.chunk_size);

    let expected = expected_total(cli.progress, items.len(), manifest::total_upload_bytes(&items));
    let mut view = BarView::new(orchestrator.pool_size(), cli.progress, expected, cli.verbose);
    let report = orchestrator.run(items.clone(), Arc::new(worker), &mut view)?;

    if let Some(out) = &args.failed_out {
        let failed = manifest::failed_subset(&items, &report.failure, |d| {
            d.source_path.display().to_string()
        });
        write_failed(out, &failed)?;
    }
    Ok(report)
}

fn run_download(
    cli: &Cli,
    config: &TransferConfig,
    args: &DownloadArgs,
    transport: Arc<dyn Transport>,
    logger: Arc<dyn Logger>,
    orchestrator: &Orchestrator,
) -> Result<JobReport> {
    let items: Vec<DownloadDescriptor> = manifest::read_manifest(&args.manifest)?;
    std::fs::create_dir_all(&args.dest)
        .with_context(|| format!("Failed to create {}", args.dest.display()))?;

    let resolver: Arc<dyn LocationResolver> = match &args.api {
        Some(api) => Arc::new(ApiResolver::new(Arc::clone(&transport), api.clone())),
        None => Arc::new(|remote_id: &str| -> Result<String, TransferError> {
            Err(TransferError::Resolve(format!(
                "no --api given to refresh the link for {remote_id}"
            )))
        }),
    };

    let worker = DownloadWorker::new(transport, resolver, &args.dest, logger)
        .naming(args.naming.unwrap_or(config.naming))
        .duplicates(args.duplicates.unwrap_or(config.duplicates))
        .retry(config.retry_policy())
        .chunk_size(config.chunk_size);

    // Sizes are unknown until the responses arrive.
    let expected = expected_total(cli.progress, items.len(), 0);
    let mut view = BarView::new(orchestrator.pool_size(), cli.progress, expected, cli.verbose);
    let report = orchestrator.run(items.clone(), Arc::new(worker), &mut view)?;

    if let Some(out) = &args.failed_out {
        let failed = manifest::failed_subset(&items, &report.failure, |d| d.remote_id.clone());
        write_failed(out, &failed)?;
    }
    Ok(report)
}

fn write_failed<T: serde::Serialize>(out: &Path, failed: &[T]) -> Result<()> {
    manifest::write_manifest(out, failed)?;
    if !failed.is_empty() {
        eprintln!("{} failed item(s) written to {}", failed.len(), out.display());
    }
    Ok(())
}
