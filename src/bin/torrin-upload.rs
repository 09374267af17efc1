use clap::Parser;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use torrin::client::{FsResumeStore, Upload, UploadOptions, UploadSource};
use torrin::driver::StorageLocation;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_URL: &str = "http://127.0.0.1:3000/torrin/uploads";

#[derive(Parser, Debug)]
#[command(name = "torrin-upload")]
#[command(about = "Upload a file to a torrin server, resuming where a previous run stopped", long_about = None)]
#[command(version = VERSION)]
struct Args {
    /// Path to the file to upload
    file: PathBuf,

    /// Upload endpoint (also respects the TORRIN_URL env var)
    #[arg(long)]
    url: Option<String>,

    /// Requested chunk size in bytes; the server's clamped value wins
    #[arg(long)]
    chunk_size: Option<u64>,

    /// Number of chunk uploads in flight
    #[arg(long, default_value_t = torrin::client::DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Send a SHA-256 hash header with every chunk
    #[arg(long)]
    hash_chunks: bool,

    /// Disable resume-state persistence
    #[arg(long)]
    no_resume: bool,

    /// Directory for resume state (defaults to the platform state dir)
    #[arg(long)]
    state_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "torrin_upload=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    if let Err(e) = run(args).await {
        tracing::error!("{e}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    if !args.file.exists() {
        return Err(format!("File '{}' does not exist", args.file.display()).into());
    }

    let url = args
        .url
        .or_else(|| std::env::var("TORRIN_URL").ok())
        .unwrap_or_else(|| DEFAULT_URL.to_string());

    let source = UploadSource::from_path(&args.file).await?;
    let file_size = source.size();

    let mut options = UploadOptions::new(url.clone());
    options.chunk_size = args.chunk_size;
    options.max_concurrency = args.concurrency;
    options.chunk_hashes = args.hash_chunks;

    let mut upload = Upload::new(source, options);

    if !args.no_resume {
        match resume_dir(args.state_dir) {
            Some(dir) => match FsResumeStore::new(&dir) {
                Ok(store) => upload = upload.with_resume_store(Arc::new(store)),
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "Resume store unavailable");
                }
            },
            None => tracing::warn!("No state directory available, resume disabled"),
        }
    }

    tracing::info!(
        "Uploading {} ({} bytes) to {}",
        args.file.display(),
        file_size,
        url
    );

    let progress = ProgressBar::new(file_size);
    progress.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})",
            )?
            .progress_chars("#>-"),
    );

    let bar = progress.clone();
    upload.on_progress(move |p| bar.set_position(p.bytes_uploaded));

    let result = upload.start().await?;
    progress.finish_and_clear();

    println!("\n{}", "✓ Upload completed".green().bold());
    println!();
    println!(
        "  {:>10}  {}",
        "Upload ID:".cyan().bold(),
        result.upload_id
    );
    println!(
        "  {:>10}  {} bytes",
        "Size:".cyan().bold(),
        file_size.to_string().yellow()
    );
    match &result.location {
        StorageLocation::Local { path } => {
            println!("  {:>10}  {}", "Stored at:".cyan().bold(), path.display());
        }
        StorageLocation::S3 { bucket, key, etag, .. } => {
            println!(
                "  {:>10}  s3://{}/{}",
                "Stored at:".cyan().bold(),
                bucket,
                key
            );
            if let Some(etag) = etag {
                println!("  {:>10}  {}", "ETag:".cyan().bold(), etag.bright_black());
            }
        }
    }
    println!();

    Ok(())
}

fn resume_dir(explicit: Option<PathBuf>) -> Option<PathBuf> {
    explicit.or_else(|| {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .map(|dir| dir.join("torrin"))
    })
}
