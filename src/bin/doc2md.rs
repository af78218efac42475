//! CLI binary for edgequake-doc2md.
//!
//! `doc2md serve` runs the HTTP streaming surface; `doc2md convert` runs one
//! batch from the terminal with a live progress bar.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use edgequake_doc2md::server::{start_server, AppState};
use edgequake_doc2md::{
    build_extractor, run_batch, storage, BatchProgress, BatchSnapshot, BatchWorkspace,
    ConversionDriver, EnvStorageConnector, FileState, FileStatus, LayoutSettings, PdfiumBackend,
    PipelineConfig, StorageMode, StorageSettings, UnitStatus, UploadedFile, VisionConfig,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress using indicatif ─────────────────────────────────────────────

/// Terminal batch progress: one bar over files, one log line per unit.
struct CliProgress {
    bar: ProgressBar,
    unit_errors: AtomicUsize,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {pos:>3}/{len} files  \
                 ⏱ {elapsed_precise}  {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS),
        );
        bar.set_prefix("Converting");
        bar.enable_steady_tick(Duration::from_millis(80));
        Self {
            bar,
            unit_errors: AtomicUsize::new(0),
        }
    }
}

impl BatchProgress for CliProgress {
    fn on_batch_start(&self, total_files: usize) {
        self.bar.set_length(total_files as u64);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Starting batch of {total_files} file(s)…"))
        ));
    }

    fn on_file_start(&self, _file_index: usize, filename: &str) {
        self.bar.set_message(filename.to_string());
    }

    fn on_unit(&self, _file_index: usize, unit: &UnitStatus) {
        if unit.is_success() {
            self.bar.println(format!(
                "  {} {:<28} {}",
                green("✓"),
                unit.message,
                dim(unit.artifact_url.as_deref().unwrap_or_default()),
            ));
        } else {
            self.unit_errors.fetch_add(1, Ordering::Relaxed);
            self.bar
                .println(format!("  {} Unit {:>3}  {}", red("✗"), unit.unit_index, red(&unit.message)));
        }
    }

    fn on_file_complete(&self, _file_index: usize, status: &FileStatus) {
        let mark = match status.state {
            FileState::Success => green("✔"),
            _ => red("✘"),
        };
        self.bar
            .println(format!("{mark} {}  {}", bold(&status.filename), dim(&status.message)));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, snapshot: &BatchSnapshot) {
        self.bar.finish_and_clear();
        let failed = snapshot
            .files
            .iter()
            .filter(|f| f.state == FileState::Error)
            .count();
        let total = snapshot.files.len();
        let unit_errors = self.unit_errors.load(Ordering::Relaxed);
        if failed == 0 && unit_errors == 0 {
            eprintln!("{} {} file(s) converted successfully", green("✔"), bold(&total.to_string()));
        } else {
            eprintln!(
                "{} {}/{} file(s) converted  ({} unit error(s))",
                if failed == total { red("✘") } else { cyan("⚠") },
                bold(&(total - failed).to_string()),
                total,
                red(&unit_errors.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Serve the streaming API on port 8000
  doc2md serve --addr 0.0.0.0:8000

  # Convert locally, staging into ./work/storage/docs
  doc2md convert report.pdf figures.xlsx --storage local --bucket docs

  # Convert into a MinIO bucket and print the final status as JSON
  doc2md convert scan.png --storage minio --bucket my_docs --json

SUPPORTED INPUTS:
  .pdf                 one unit per page, images consolidated before extraction
  .png .jpg .jpeg      one unit, layout extraction on the whole image
  .txt .csv .docx      one unit, converted directly
  .xlsx .xls .ods      one unit per non-empty sheet

ENVIRONMENT VARIABLES:
  AZURE_AI_INTELLIGENCE_ENDPOINT   Document Intelligence endpoint (layout extraction)
  AZURE_AI_INTELLIGENCE_API_KEY    Document Intelligence key
  EDGEQUAKE_PROVIDER               Vision LLM provider when Azure is not configured
  EDGEQUAKE_MODEL                  Vision LLM model ID
  OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY           vision LLM credentials
  AWS_ACCESS_KEY / AWS_SECRET_ACCESS_KEY / REGION_NAME          s3 storage
  MINIO_ENDPOINT / MINIO_ACCESS_KEY / MINIO_SECRET_KEY / MINIO_USE_HTTPS   minio storage
  DOC2MD_STORAGE_DIR               Root of local storage (default work/storage)
  PDFIUM_LIB_PATH                  Path to libpdfium (file or directory)

  Variables are also read from a .env file in the working directory.
"#;

/// Convert documents to staged Markdown.
#[derive(Parser, Debug)]
#[command(
    name = "doc2md",
    version,
    about = "Convert PDFs, spreadsheets, Word documents, images and text to staged Markdown",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Working directory for staged parts, split pages, images and uploads.
    #[arg(long, global = true, env = "DOC2MD_WORK_DIR", default_value = "work")]
    work_dir: PathBuf,

    /// Adjacency tolerance used when grouping page images.
    #[arg(long, global = true, env = "DOC2MD_PADDING", default_value_t = 5.0)]
    padding: f32,

    /// Vision LLM provider when no Document Intelligence endpoint is set.
    #[arg(long, global = true, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Vision LLM model ID.
    #[arg(long, global = true, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// PDF user password for encrypted documents.
    #[arg(long, global = true, env = "DOC2MD_PASSWORD")]
    password: Option<String>,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "DOC2MD_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "DOC2MD_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server (POST /process-files, GET /health).
    Serve {
        /// Listen address.
        #[arg(long, env = "DOC2MD_ADDR", default_value = "0.0.0.0:8000")]
        addr: String,
    },
    /// Convert files once and report where each unit was staged.
    Convert {
        /// Files to convert, processed in the given order.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Storage target for composites and Markdown parts.
        #[arg(long, value_enum, default_value = "local")]
        storage: StorageArg,

        /// Bucket name (normalised to lower case, `_` becomes `-`).
        #[arg(long, env = "DOC2MD_BUCKET", default_value = "doc2md")]
        bucket: String,

        /// Print the final batch snapshot as JSON on stdout.
        #[arg(long)]
        json: bool,

        /// Disable progress bar.
        #[arg(long, env = "DOC2MD_NO_PROGRESS")]
        no_progress: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StorageArg {
    Local,
    S3,
    Minio,
}

impl From<StorageArg> for StorageMode {
    fn from(v: StorageArg) -> Self {
        match v {
            StorageArg::Local => StorageMode::Local,
            StorageArg::S3 => StorageMode::S3,
            StorageArg::Minio => StorageMode::Minio,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs during a terminal conversion.
    let show_progress = match &cli.command {
        Command::Convert {
            json, no_progress, ..
        } => !cli.quiet && !no_progress && !json,
        Command::Serve { .. } => false,
    };
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Shared pipeline pieces ───────────────────────────────────────────
    let config = PipelineConfig::builder()
        .work_dir(&cli.work_dir)
        .padding(cli.padding);
    let config = match &cli.password {
        Some(pwd) => config.password(pwd.clone()),
        None => config,
    };
    let config = Arc::new(config.build().context("Invalid configuration")?);
    config.ensure_roots().context("Failed to prepare working directories")?;

    let documents = Arc::new(PdfiumBackend::from_env(cli.password.clone()));
    documents.check().context("PDF engine unavailable")?;

    let vision = VisionConfig {
        provider_name: cli.provider.clone(),
        model: cli.model.clone(),
        ..VisionConfig::default()
    };
    let layout = LayoutSettings::from_env(vision);
    let extractor =
        build_extractor(&layout, documents.clone()).context("Layout extraction unavailable")?;

    match cli.command {
        Command::Serve { addr } => {
            let state = AppState {
                config,
                extractor,
                documents,
                connector: Arc::new(EnvStorageConnector),
            };
            start_server(&addr, state)
                .await
                .with_context(|| format!("Server on {addr} failed"))?;
        }
        Command::Convert {
            files,
            storage: mode,
            bucket,
            json,
            ..
        } => {
            let settings = StorageSettings::from_env(mode.into(), &bucket)
                .context("Storage is not configured")?;
            let backend = storage::connect(&settings)
                .await
                .context("Failed to connect to storage")?;

            let workspace =
                BatchWorkspace::create(&config).context("Failed to prepare batch directories")?;
            let uploads = stage_inputs(workspace.upload_dir(), &files).await?;
            let driver = ConversionDriver::new(workspace.config(), backend, extractor, documents);

            let done = if show_progress {
                run_batch(&driver, &uploads, &CliProgress::new()).await
            } else {
                run_batch(&driver, &uploads, &QuietProgress { quiet: cli.quiet }).await
            };

            if json {
                let out = serde_json::to_string_pretty(&done).context("Failed to serialise status")?;
                println!("{out}");
            } else if !cli.quiet {
                print_summary(&done);
            }

            if done.files.iter().all(|f| f.state == FileState::Error) {
                bail!("No file could be converted");
            }
        }
    }
    Ok(())
}

/// Progress sink used with `--no-progress` or `--json`: one line per file on stderr.
struct QuietProgress {
    quiet: bool,
}

impl BatchProgress for QuietProgress {
    fn on_file_complete(&self, _file_index: usize, status: &FileStatus) {
        if !self.quiet {
            eprintln!("{}: {:?} - {}", status.filename, status.state, status.message);
        }
    }
}

/// Copy inputs into the batch upload directory; the batch deletes its copies when done.
async fn stage_inputs(upload_dir: &Path, files: &[PathBuf]) -> Result<Vec<UploadedFile>> {
    let mut uploads = Vec::with_capacity(files.len());
    for src in files {
        let filename = src
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("Not a file: {}", src.display()))?;
        let dest = upload_dir.join(&filename);
        tokio::fs::copy(src, &dest)
            .await
            .with_context(|| format!("Failed to read {}", src.display()))?;
        uploads.push(UploadedFile::new(filename, dest));
    }
    Ok(uploads)
}

fn print_summary(done: &BatchSnapshot) {
    for file in &done.files {
        println!("{}", bold(&file.filename));
        for url in &file.urls {
            println!("  {url}");
        }
    }
}
