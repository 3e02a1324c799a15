//! CLI binary for pagewise.
//!
//! A thin shim over the library crate: load a document, open a session, run
//! the requested pages through the model and print the results.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use pagewise::pipeline::input::resolve_input;
use pagewise::{
    Engine, EngineConfig, PageContent, PageError, ProgressCallback, PromptLibrary,
    RunProgressCallback,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
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

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar plus one log line per page. Each batch or range run
/// grows the bar by the number of pages it will attempt.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        let bar = ProgressBar::new(0);
        bar.set_style(style);
        bar.set_prefix("Transforming");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn finish(&self, transformed: usize) {
        self.bar.finish_and_clear();
        let failed = self.errors.load(Ordering::SeqCst);
        if failed == 0 {
            eprintln!(
                "{} {} pages transformed",
                green("✔"),
                bold(&transformed.to_string())
            );
        } else {
            eprintln!(
                "{} {} pages transformed  ({} failed)",
                cyan("⚠"),
                bold(&transformed.to_string()),
                red(&failed.to_string()),
            );
        }
    }

    fn elapsed_secs(&self, page_num: usize) -> f64 {
        self.start_times
            .lock()
            .remove(&page_num)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl RunProgressCallback for CliProgressCallback {
    fn on_run_start(&self, _session_id: &str, pages: usize) {
        self.bar.inc_length(pages as u64);
    }

    fn on_page_start(&self, page_num: usize, _total_pages: usize) {
        self.start_times.lock().insert(page_num, Instant::now());
        self.bar.set_message(format!("page {page_num}"));
    }

    fn on_page_complete(&self, page_num: usize, total_pages: usize, content_len: usize) {
        let secs = self.elapsed_secs(page_num);
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<8}  {}",
            green("✓"),
            page_num,
            total_pages,
            dim(&format!("{content_len:>5} chars")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page_num: usize, total_pages: usize, error: &str) {
        let secs = self.elapsed_secs(page_num);
        self.errors.fetch_add(1, Ordering::SeqCst);

        let msg: String = if error.chars().count() > 80 {
            error.chars().take(79).chain(std::iter::once('…')).collect()
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}  {}",
            red("✗"),
            page_num,
            total_pages,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Transform every page with the default note-taking instruction
  pagewise book.pdf > notes.md

  # Pages 3 to 7 with a built-in preset
  pagewise --pages 3-7 --preset summary book.pdf

  # A single page with a custom instruction, JSON output
  pagewise --pages 12 --prompt "List every definition." --json book.pdf

  # Paged plain text (pages separated by form feeds)
  pdftotext book.pdf - | pagewise /dev/stdin

  # Any OpenAI-compatible server
  pagewise --api-base http://localhost:11434/v1 --model llama3.1 book.pdf

  # Ask a question, keep the conversation
  pagewise --chat "What is a vector space?" --chat "Give an example." --save-chat

  # Manage instruction presets
  pagewise --list-presets
  pagewise --add-preset glossary --prompt "Build a glossary of the terms."

ENVIRONMENT VARIABLES:
  PAGEWISE_API_KEY        API key (falls back to OPENAI_API_KEY)
  PAGEWISE_MODEL          Model ID
  PAGEWISE_API_BASE       Base URL of the chat-completions API
  PAGEWISE_OUTPUT_DIR     Where page records are written
  PDFIUM_LIB_PATH         Path to libpdfium when it is not installed system-wide
  RUST_LOG                Log filter, overrides --verbose/--quiet
"#;

/// Transform a document page by page with a chat model.
#[derive(Parser, Debug)]
#[command(
    name = "pagewise",
    version,
    about = "Transform a document page by page with a chat model",
    long_about = "Open a PDF or form-feed paged text file, walk its pages and send each \
page's text to an OpenAI-compatible chat model under an instruction. Every transformed \
page is written to the output directory as a JSON record and a Markdown file.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local file path or HTTP/HTTPS URL (PDF or paged UTF-8 text).
    #[arg(required_unless_present_any = ["list_presets", "add_preset", "chat"])]
    input: Option<String>,

    /// Pages to transform: all, 5, or 3-15.
    #[arg(long, env = "PAGEWISE_PAGES", default_value = "all")]
    pages: String,

    /// Instruction text sent as the system message.
    #[arg(long, conflicts_with = "preset")]
    prompt: Option<String>,

    /// Built-in or user preset, by name or id.
    #[arg(long, env = "PAGEWISE_PRESET")]
    preset: Option<String>,

    /// JSON file holding user presets.
    #[arg(long, env = "PAGEWISE_PROMPTS_FILE", default_value = "user_prompts.json")]
    prompts_file: PathBuf,

    /// Print every preset and exit.
    #[arg(long)]
    list_presets: bool,

    /// Save --prompt as a user preset under this name and exit.
    #[arg(long, requires = "prompt")]
    add_preset: Option<String>,

    /// Description stored with --add-preset.
    #[arg(long, default_value = "")]
    description: String,

    /// Send a chat message instead of processing a document. Repeat for a
    /// multi-turn conversation.
    #[arg(long, value_name = "MESSAGE", conflicts_with = "input")]
    chat: Vec<String>,

    /// Save the conversation to the output directory after --chat.
    #[arg(long, requires = "chat")]
    save_chat: bool,

    /// Chat model ID.
    #[arg(long, env = "PAGEWISE_MODEL")]
    model: Option<String>,

    /// Base URL of the OpenAI-compatible API.
    #[arg(long, env = "PAGEWISE_API_BASE")]
    api_base: Option<String>,

    /// API key. Falls back to OPENAI_API_KEY.
    #[arg(long, env = "PAGEWISE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Sampling temperature (0.0–2.0).
    #[arg(long, env = "PAGEWISE_TEMPERATURE", default_value_t = 0.7)]
    temperature: f32,

    /// Max completion tokens per page.
    #[arg(long, env = "PAGEWISE_MAX_TOKENS")]
    max_tokens: Option<usize>,

    /// Total attempts per page on timeout or connection failure.
    #[arg(long, env = "PAGEWISE_MAX_ATTEMPTS", default_value_t = 5)]
    max_attempts: u32,

    /// Delay between attempts in milliseconds.
    #[arg(long, env = "PAGEWISE_RETRY_DELAY_MS", default_value_t = 1500)]
    retry_delay_ms: u64,

    /// Double the delay after every retry.
    #[arg(long, env = "PAGEWISE_EXPONENTIAL_BACKOFF")]
    exponential_backoff: bool,

    /// Token budget reported by the usage summary.
    #[arg(long, env = "PAGEWISE_TOKEN_QUOTA", default_value_t = 1_000_000)]
    token_quota: u64,

    /// Directory for per-page records and consolidated documents.
    #[arg(long, env = "PAGEWISE_OUTPUT_DIR", default_value = "outputs")]
    output_dir: PathBuf,

    /// Keep model output exactly as returned.
    #[arg(long, env = "PAGEWISE_NO_CLEAN")]
    no_clean: bool,

    /// Print results as JSON instead of Markdown.
    #[arg(long, env = "PAGEWISE_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "PAGEWISE_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PAGEWISE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PAGEWISE_QUIET")]
    quiet: bool,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "PAGEWISE_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Per-request model timeout in seconds.
    #[arg(long, env = "PAGEWISE_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,
}

/// Pages selected with `--pages`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageSelection {
    All,
    Range(usize, usize),
}

#[derive(Serialize)]
struct RunReport<'a> {
    session_id: &'a str,
    total_pages: usize,
    results: &'a [PageContent],
    failures: &'a [PageError],
    tokens: pagewise::TokenStatus,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level logs unless --verbose is set.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
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

    // ── Preset management ────────────────────────────────────────────────
    let library = PromptLibrary::new(&cli.prompts_file);

    if cli.list_presets {
        for preset in library.all().await.context("Failed to load presets")? {
            println!(
                "{:>4}  {:<12} {}",
                preset.id,
                bold(&preset.name),
                dim(&preset.description)
            );
        }
        return Ok(());
    }

    if let Some(ref name) = cli.add_preset {
        let prompt = cli.prompt.clone().unwrap_or_default();
        let preset = library
            .add(name.clone(), cli.description.clone(), prompt)
            .await
            .context("Failed to save preset")?;
        eprintln!(
            "{} Saved preset {} (id {})",
            green("✔"),
            bold(&preset.name),
            preset.id
        );
        return Ok(());
    }

    if !cli.chat.is_empty() {
        return run_chat(&cli).await;
    }

    let input = cli
        .input
        .clone()
        .context("An input document is required")?;
    let selection = parse_pages(&cli.pages)?;
    let instruction = resolve_instruction(&cli, &library).await?;

    // ── Build engine ─────────────────────────────────────────────────────
    let config = build_config(&cli)?;
    let mut engine = Engine::new(config).context("Failed to start engine")?;
    let progress = show_progress.then(CliProgressCallback::new);
    if let Some(ref cb) = progress {
        engine = engine.with_progress(Arc::clone(cb) as ProgressCallback);
    }

    // ── Open session ─────────────────────────────────────────────────────
    let loaded = resolve_input(&input, cli.download_timeout)
        .await
        .with_context(|| format!("Failed to load '{input}'"))?;
    let created = engine
        .create_session(loaded.bytes)
        .await
        .with_context(|| format!("Failed to open '{}'", loaded.name))?;
    let session_id = created.session_id;
    let total_pages = created.page_info.total_pages;
    if !cli.quiet && !cli.json {
        eprintln!(
            "{} {}  {} pages  {}",
            cyan("◆"),
            bold(&loaded.name),
            total_pages,
            dim(&format!("session {session_id}"))
        );
    }

    if let Some(ref text) = instruction {
        engine.set_instruction(&session_id, text.clone()).await?;
    }

    // ── Run ──────────────────────────────────────────────────────────────
    let mut results: Vec<PageContent> = Vec::new();
    let mut failures: Vec<PageError> = Vec::new();

    match selection {
        PageSelection::All => loop {
            let batch = engine
                .process_batch(&session_id, None, None)
                .await
                .context("Batch failed")?;
            results.extend(batch.results);
            failures.extend(batch.failures);
            if batch.is_complete {
                break;
            }
        },
        PageSelection::Range(start, end) => {
            let range = engine
                .process_range(&session_id, start, end, None)
                .await
                .context("Range failed")?;
            results.extend(range.results);
            failures.extend(range.failures);
        }
    }

    if let Some(ref cb) = progress {
        cb.finish(results.len());
    }

    // ── Output ───────────────────────────────────────────────────────────
    let tokens = engine.token_status();
    if cli.json {
        let report = RunReport {
            session_id: &session_id,
            total_pages,
            results: &results,
            failures: &failures,
            tokens,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise output")?
        );
    } else {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        for page in &results {
            writeln!(handle, "## Page {}\n\n{}", page.page_number, page.content.trim_end())
                .context("Failed to write to stdout")?;
        }

        if !cli.quiet {
            if !show_progress {
                eprintln!(
                    "Transformed {}/{} pages",
                    results.len(),
                    results.len() + failures.len()
                );
                for failure in &failures {
                    eprintln!("  {}", red(&failure.to_string()));
                }
            }
            eprintln!(
                "   {} tokens remaining of {}  ({}% used, {} in recent calls)",
                dim(&tokens.remaining.to_string()),
                tokens.max,
                tokens.usage_percentage,
                tokens.recent_usage,
            );
        }
    }

    engine.close_session(&session_id)?;
    if !failures.is_empty() && results.is_empty() {
        anyhow::bail!("All {} pages failed", failures.len());
    }
    Ok(())
}

/// Send each `--chat` message in order and print the replies.
async fn run_chat(cli: &Cli) -> Result<()> {
    let engine = Engine::new(build_config(cli)?).context("Failed to start engine")?;

    for message in &cli.chat {
        let reply = engine.chat(message).await.context("Chat failed")?;
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&reply).context("Failed to serialise output")?
            );
        } else {
            println!("{}", reply.response.trim_end());
        }
    }

    if cli.save_chat {
        let path = engine.save_chat().await.context("Failed to save chat")?;
        if !cli.quiet {
            eprintln!("{} Saved chat to {}", green("✔"), path.display());
        }
    }
    if !cli.quiet && !cli.json {
        eprintln!(
            "   {} tokens remaining",
            dim(&engine.token_status().remaining.to_string())
        );
    }
    Ok(())
}

/// Map CLI args to `EngineConfig`.
fn build_config(cli: &Cli) -> Result<EngineConfig> {
    let mut builder = EngineConfig::builder()
        .temperature(cli.temperature)
        .max_attempts(cli.max_attempts)
        .retry_delay_ms(cli.retry_delay_ms)
        .exponential_backoff(cli.exponential_backoff)
        .token_quota(cli.token_quota)
        .output_dir(cli.output_dir.clone())
        .clean_output(!cli.no_clean)
        .download_timeout_secs(cli.download_timeout)
        .request_timeout_secs(cli.api_timeout);

    if let Some(ref model) = cli.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref base) = cli.api_base {
        builder = builder.api_base_url(base.clone());
    }
    if let Some(n) = cli.max_tokens {
        builder = builder.max_tokens(n);
    }
    let api_key = cli
        .api_key
        .clone()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .filter(|k| !k.is_empty());
    if let Some(key) = api_key {
        builder = builder.api_key(key);
    }

    builder.build().context("Invalid configuration")
}

/// `--prompt` text, or the prompt of `--preset`, or `None` for the default.
async fn resolve_instruction(cli: &Cli, library: &PromptLibrary) -> Result<Option<String>> {
    if let Some(ref prompt) = cli.prompt {
        return Ok(Some(prompt.clone()));
    }
    match cli.preset {
        Some(ref key) => {
            let preset = library
                .find(key)
                .await
                .context("Failed to load presets")?
                .with_context(|| format!("Unknown preset '{key}' (see --list-presets)"))?;
            Ok(Some(preset.prompt))
        }
        None => Ok(None),
    }
}

/// Parse `--pages` into a selection.
fn parse_pages(s: &str) -> Result<PageSelection> {
    let s = s.trim().to_lowercase();

    if s == "all" {
        return Ok(PageSelection::All);
    }

    // Range: "3-15"
    if let Some((start, end)) = s.split_once('-') {
        let start: usize = start
            .trim()
            .parse()
            .context("Invalid start page in range")?;
        let end: usize = end.trim().parse().context("Invalid end page in range")?;

        if start < 1 {
            anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", start);
        }
        if start > end {
            anyhow::bail!(
                "Invalid page range '{}-{}': start must be <= end",
                start,
                end
            );
        }
        return Ok(PageSelection::Range(start, end));
    }

    // Single page: "5"
    let page: usize = s.parse().context("Invalid page number")?;
    if page < 1 {
        anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", page);
    }
    Ok(PageSelection::Range(page, page))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pages_forms() {
        assert_eq!(parse_pages("all").unwrap(), PageSelection::All);
        assert_eq!(parse_pages(" ALL ").unwrap(), PageSelection::All);
        assert_eq!(parse_pages("4").unwrap(), PageSelection::Range(4, 4));
        assert_eq!(parse_pages("2-5").unwrap(), PageSelection::Range(2, 5));
    }

    #[test]
    fn parse_pages_rejects_bad_input() {
        assert!(parse_pages("0").is_err());
        assert!(parse_pages("5-2").is_err());
        assert!(parse_pages("x").is_err());
        assert!(parse_pages("0-3").is_err());
    }
}
