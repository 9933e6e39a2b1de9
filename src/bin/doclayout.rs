//! CLI binary for doclayout.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, runs one job with live stage bars and prints where the
//! results landed.

use anyhow::{bail, Context, Result};
use clap::Parser;
use doclayout::{
    list_jobs, BBox, DocumentJob, InputSource, JobProgress, Orchestrator, PageScope,
    PdfiumRasterizer, PipelineConfig, PromptMode, RetryPolicy, Stage, WorkerPool,
};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
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

// ── Stage bars driven by the progress snapshot ──────────────────────────────

/// One bar per stage, refreshed by polling the job's snapshot.
struct StageBars {
    _multi: MultiProgress,
    bars: [(Stage, ProgressBar); 3],
}

impl StageBars {
    fn new() -> Self {
        let multi = MultiProgress::new();
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:<10.bold} [{bar:36.green/238}] {pos:>3}%  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        let bar = |stage: Stage| {
            let bar = multi.add(ProgressBar::new(100));
            bar.set_style(style.clone());
            bar.set_prefix(stage.to_string());
            bar.enable_steady_tick(Duration::from_millis(80));
            (stage, bar)
        };
        let bars = [bar(Stage::Extract), bar(Stage::Recognize), bar(Stage::Assemble)];
        Self {
            _multi: multi,
            bars,
        }
    }

    fn refresh(&self, snap: &JobProgress) {
        for (stage, bar) in &self.bars {
            let s = snap.stage(*stage);
            bar.set_position(s.progress.round() as u64);
            bar.set_message(s.status.clone());
        }
    }

    fn finish(&self) {
        for (_, bar) in &self.bars {
            bar.finish_and_clear();
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Full layout + text for every page
  doclayout report.pdf

  # Quick preview of the first page only
  doclayout --first-page report.pdf

  # Plain OCR of a scanned page
  doclayout --mode ocr scan.png

  # Text inside one region (original-image pixels)
  doclayout --mode grounding-ocr --region 100,200,900,400 scan.png

  # From a URL, JSON job record on stdout
  doclayout --json https://arxiv.org/pdf/1706.03762

  # List previous jobs in the output directory
  doclayout --list

OUTPUT (per job, under <OUTPUT_DIR>/<name>_<hash>/):
  <name>_page_<n>.json / .md / .jpg   cells, text and annotated page
  <name>_<hash>_combined.json / .md   whole document
  <name>_<hash>.docx / .zip           rendered document and bundle
  <name>.jsonl                        one page record per line

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY            OpenAI API key
  EDGEQUAKE_LLM_PROVIDER    Override provider (openai, anthropic, gemini, ollama, …)
  EDGEQUAKE_MODEL           Override model ID
  PDFIUM_DYNAMIC_LIB_PATH   Path to an existing libpdfium
"#;

/// Extract document layout with a vision-language model.
#[derive(Parser, Debug)]
#[command(
    name = "doclayout",
    version,
    about = "Extract document layout, Markdown and DOCX from PDFs and page images",
    long_about = "Send every page of a PDF or image to a vision-language model, parse the \
returned layout cells, and assemble annotated pages, combined JSON, Markdown, DOCX and a ZIP \
bundle. Works with any provider supported by edgequake-llm.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF / image path or HTTP/HTTPS URL.
    #[arg(required_unless_present = "list")]
    input: Option<String>,

    /// List jobs found in the output directory and exit.
    #[arg(long)]
    list: bool,

    /// Root directory for job outputs.
    #[arg(short, long, env = "DOCLAYOUT_OUTPUT_DIR", default_value = "output")]
    output_dir: PathBuf,

    /// LLM model ID.
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure, …
    #[arg(long, env = "EDGEQUAKE_LLM_PROVIDER")]
    provider: Option<String>,

    /// Prompt mode.
    #[arg(long, env = "DOCLAYOUT_MODE", value_enum, default_value = "layout-all")]
    mode: ModeArg,

    /// Region `x1,y1,x2,y2` for grounding OCR, in original-image pixels.
    #[arg(long, value_parser = parse_region)]
    region: Option<BBox>,

    /// Recognise only the first page.
    #[arg(long, env = "DOCLAYOUT_FIRST_PAGE")]
    first_page: bool,

    /// Rendering DPI (72–400).
    #[arg(long, env = "DOCLAYOUT_DPI", default_value_t = 200,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Scale image inputs by DPI/72 before recognition, like rendered pages.
    #[arg(long, env = "DOCLAYOUT_UPSCALE_IMAGES")]
    upscale_images: bool,

    /// Process again even when results for the same content exist.
    #[arg(long, env = "DOCLAYOUT_FORCE")]
    force: bool,

    /// Upper bound on concurrent page workers.
    #[arg(short = 'w', long, env = "DOCLAYOUT_MAX_WORKERS", default_value_t = 64)]
    max_workers: usize,

    /// Run page workers as spawned tasks instead of futures on one task.
    #[arg(long, env = "DOCLAYOUT_THREADS")]
    threads: bool,

    /// Per-page inference timeout in seconds.
    #[arg(long, env = "DOCLAYOUT_API_TIMEOUT", default_value_t = 600)]
    api_timeout: u64,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "DOCLAYOUT_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Retries per page on inference failure.
    #[arg(long, env = "DOCLAYOUT_MAX_RETRIES", default_value_t = 0)]
    max_retries: u32,

    /// Base backoff between retries in milliseconds.
    #[arg(long, env = "DOCLAYOUT_RETRY_BACKOFF_MS", default_value_t = 500)]
    retry_backoff_ms: u64,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "DOCLAYOUT_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Max LLM output tokens per page.
    #[arg(long, env = "DOCLAYOUT_MAX_TOKENS", default_value_t = 16_384)]
    max_tokens: usize,

    /// Leave page headers and footers out of the Markdown.
    #[arg(long, env = "DOCLAYOUT_SKIP_HEADER_FOOTER")]
    skip_header_footer: bool,

    /// Skip DOCX rendering and the ZIP bundle.
    #[arg(long, env = "DOCLAYOUT_NO_DOCX")]
    no_docx: bool,

    /// TTF/OTF font for cell labels on annotated pages.
    #[arg(long, env = "DOCLAYOUT_LABEL_FONT")]
    label_font: Option<PathBuf>,

    /// Path to the pdfium shared library.
    #[arg(long, env = "DOCLAYOUT_PDFIUM_LIB")]
    pdfium_lib: Option<PathBuf>,

    /// Print the job record (or job list) as JSON.
    #[arg(long, env = "DOCLAYOUT_JSON")]
    json: bool,

    /// Disable progress bars.
    #[arg(long, env = "DOCLAYOUT_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DOCLAYOUT_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "DOCLAYOUT_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    LayoutAll,
    LayoutOnly,
    Ocr,
    GroundingOcr,
}

impl From<ModeArg> for PromptMode {
    fn from(v: ModeArg) -> Self {
        match v {
            ModeArg::LayoutAll => PromptMode::LayoutAll,
            ModeArg::LayoutOnly => PromptMode::LayoutOnly,
            ModeArg::Ocr => PromptMode::Ocr,
            ModeArg::GroundingOcr => PromptMode::GroundingOcr,
        }
    }
}

fn parse_region(s: &str) -> Result<BBox, String> {
    let coords: Vec<i64> = s
        .split(',')
        .map(|part| part.trim().parse::<i64>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("invalid coordinate: {e}"))?;
    match coords.as_slice() {
        [x1, y1, x2, y2] if x1 < x2 && y1 < y2 => Ok(BBox::new(*x1, *y1, *x2, *y2)),
        [_, _, _, _] => Err("expected x1 < x2 and y1 < y2".into()),
        _ => Err("expected four comma-separated integers".into()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Library INFO logs would interleave with the bars; keep errors only.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.list;
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

    // ── Job listing ──────────────────────────────────────────────────────
    if cli.list {
        let jobs = list_jobs(&cli.output_dir)
            .with_context(|| format!("Failed to list {}", cli.output_dir.display()))?;
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&jobs).context("Failed to serialise job list")?
            );
        } else if jobs.is_empty() {
            eprintln!("No jobs in {}", cli.output_dir.display());
        } else {
            for job in jobs {
                println!("{:<40} {}  {:>4} pages", job.name, dim(&job.hash_id), job.pages);
            }
        }
        return Ok(());
    }

    let Some(input) = cli.input.as_deref() else {
        bail!("An input path or URL is required");
    };
    let mode = PromptMode::from(cli.mode);
    if cli.region.is_some() && mode != PromptMode::GroundingOcr {
        bail!("--region only applies to --mode grounding-ocr");
    }

    // ── Build orchestrator ───────────────────────────────────────────────
    let config = build_config(&cli)?;
    let max_side = config.max_render_side;
    let mut orchestrator =
        Orchestrator::from_config(config).context("Failed to configure the vision model")?;
    if let Some(ref lib) = cli.pdfium_lib {
        orchestrator = orchestrator
            .with_rasterizer(Arc::new(PdfiumRasterizer::new(max_side).with_library_path(lib)));
    }
    let orchestrator = Arc::new(orchestrator);
    let registry = orchestrator.registry().clone();

    // ── Run ──────────────────────────────────────────────────────────────
    let source = InputSource::parse(input).context("Invalid input")?;
    let (hash_id, handle) = Arc::clone(&orchestrator)
        .submit(source, cli.region)
        .await
        .context("Failed to start job")?;

    let bars = show_progress.then(StageBars::new);
    while !handle.is_finished() {
        if let Some(ref bars) = bars {
            bars.refresh(&registry.snapshot(&hash_id));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if let Some(ref bars) = bars {
        bars.refresh(&registry.snapshot(&hash_id));
        bars.finish();
    }

    let outcome = handle.await.context("Job task panicked")?;
    let job = match outcome {
        Ok(job) => job,
        Err(e) => {
            if !cli.quiet {
                eprintln!("{} {}", red("✘"), bold(&e.to_string()));
            }
            return Err(e).context("Job failed");
        }
    };

    if cli.json {
        let json = serde_json::to_string_pretty(&job).context("Failed to serialise job")?;
        println!("{json}");
    } else if !cli.quiet {
        print_summary(&job);
    }
    Ok(())
}

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .dpi(cli.dpi)
        .upscale_images(cli.upscale_images)
        .reuse_results(!cli.force)
        .max_workers(cli.max_workers)
        .worker_pool(if cli.threads {
            WorkerPool::Threads
        } else {
            WorkerPool::Tasks
        })
        .prompt_mode(cli.mode.into())
        .page_scope(if cli.first_page {
            PageScope::FirstPage
        } else {
            PageScope::All
        })
        .api_timeout_secs(cli.api_timeout)
        .download_timeout_secs(cli.download_timeout)
        .retry(RetryPolicy {
            max_retries: cli.max_retries,
            backoff_ms: cli.retry_backoff_ms,
        })
        .temperature(cli.temperature)
        .max_tokens(cli.max_tokens)
        .output_dir(&cli.output_dir)
        .skip_page_header_footer(cli.skip_header_footer)
        .render_document(!cli.no_docx);

    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(ref font) = cli.label_font {
        builder = builder.label_font(font);
    }

    builder.build().context("Invalid configuration")
}

fn print_summary(job: &DocumentJob) {
    if job.cached {
        eprintln!(
            "{}  {} pages already processed  {}",
            green("✔"),
            job.total_pages,
            dim("(use --force to process again)"),
        );
        eprintln!("   {}", bold(&job.work_dir.display().to_string()));
        return;
    }
    let degraded = job.degraded_pages();
    let recognised = job.pages.len();
    eprintln!(
        "{}  {}/{} pages recognised  {}  {:.1}s",
        if degraded == 0 { green("✔") } else { red("⚠") },
        recognised - degraded,
        recognised,
        dim(&format!("({degraded} degraded)")),
        job.processing_time_secs,
    );
    eprintln!("   {}", bold(&job.work_dir.display().to_string()));
    eprintln!("   {}", dim(&job.combined_md.display().to_string()));
    if let Some(ref bundle) = job.bundle {
        eprintln!("   {}", dim(&bundle.display().to_string()));
    }
}
