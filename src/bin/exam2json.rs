//! CLI binary for edgequake-exam2json.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ExtractionConfig` and writes the results.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_exam2json::{
    convert_exam, write_output, CancelFlag, ExamOutput, ExtractionConfig,
    ExtractionProgressCallback, ImageFilterConfig, PageSelection, ProgressCallback,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
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

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: a live bar plus one log line per question.
/// Questions finish out of order, so timings are keyed by identifier.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<u32, Instant>>,
}

impl CliProgressCallback {
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Reading PDF…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} questions  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Structuring");
        self.bar.reset_eta();
    }

    fn elapsed_secs(&self, question: u32) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&question))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_run_start(&self, total_questions: usize) {
        self.activate_bar(total_questions);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Structuring {total_questions} questions…"))
        ));
    }

    fn on_question_start(&self, question: u32, _total: usize) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(question, Instant::now());
        }
        self.bar.set_message(format!("QUESTÃO {question:02}"));
    }

    fn on_question_complete(&self, question: u32, total: usize) {
        let secs = self.elapsed_secs(question);
        self.bar.println(format!(
            "  {} QUESTÃO {:02}/{:<3}  {}",
            green("✓"),
            question,
            total,
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_question_rejected(&self, question: u32, total: usize, reason: &str) {
        let secs = self.elapsed_secs(question);

        let msg: String = if reason.chars().count() > 80 {
            reason.chars().take(79).chain(std::iter::once('…')).collect()
        } else {
            reason.to_string()
        };

        self.bar.println(format!(
            "  {} QUESTÃO {:02}/{:<3}  {}  {}",
            red("✗"),
            question,
            total,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, total_questions: usize, structured: usize) {
        let failed = total_questions.saturating_sub(structured);
        self.bar.finish_and_clear();

        if failed == 0 {
            eprintln!(
                "{} {} questions structured",
                green("✔"),
                bold(&structured.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} questions structured  ({} rejected)",
                if structured == 0 { red("✘") } else { cyan("⚠") },
                bold(&structured.to_string()),
                total_questions,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Questions JSON to stdout
  exam2json prova.pdf

  # Questions + images into a directory, answers from the official key
  exam2json prova.pdf --answer-key gabarito.pdf -o out/

  # Only the first day's pages, stricter exit code
  exam2json prova.pdf --pages 2-20 --strict -o out/

  # Full output (questions, review flags, stats) as JSON
  exam2json --json prova.pdf > report.json

OUTPUT:
  Each element of questions.json is either a structured question

    {"question": "QUESTÃO 01", "image": true, "images": ["q01_p002_img01.jpeg"],
     "passage_text": "...", "sources": ["..."], "statement": "...",
     "options": {"A": "...", "B": "...", ...}, "correct_option": "C"}

  or a rejection record with "rejected": true, a reason and the raw block.

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to an existing libpdfium
"#;

/// Turn multiple-choice exam PDFs into structured JSON questions.
#[derive(Parser, Debug)]
#[command(
    name = "exam2json",
    version,
    about = "Turn multiple-choice exam PDFs into structured JSON questions",
    long_about = "Segment exam PDFs (local files or URLs) into questions, extract each \
question's images, structure every question with an LLM and check the result, using an \
optional answer-key PDF as the authority on correct options.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Exam PDF: local file path or HTTP/HTTPS URL.
    input: String,

    /// Answer-key PDF: local file path or HTTP/HTTPS URL.
    #[arg(short = 'k', long, env = "EXAM2JSON_ANSWER_KEY")]
    answer_key: Option<String>,

    /// Write questions.json and the question images into this directory.
    #[arg(short, long, env = "EXAM2JSON_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Write images here instead of the output directory.
    #[arg(long, env = "EXAM2JSON_IMAGES_DIR")]
    images_dir: Option<PathBuf>,

    /// LLM model ID (e.g. gpt-4.1-mini, gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Number of concurrent LLM calls.
    #[arg(short, long, env = "EXAM2JSON_CONCURRENCY", default_value_t = 10)]
    concurrency: usize,

    /// LLM calls started per minute, retries included (0 = no limit).
    #[arg(long, env = "EXAM2JSON_RPM", default_value_t = 50)]
    rpm: u32,

    /// Exam page selection: all, 5, 3-15, or 1,3,5,7.
    #[arg(long, env = "EXAM2JSON_PAGES", default_value = "all")]
    pages: String,

    /// Answer-key page selection: all, 5, 3-15, or 1,3,5,7.
    #[arg(long, env = "EXAM2JSON_ANSWER_KEY_PAGES", default_value = "all")]
    answer_key_pages: String,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "EXAM2JSON_PASSWORD")]
    password: Option<String>,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "EXAM2JSON_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Regex for question markers; group 1 must capture the number.
    #[arg(long, env = "EXAM2JSON_MARKER_PATTERN")]
    marker_pattern: Option<String>,

    /// Allowed option keys, in order.
    #[arg(long, env = "EXAM2JSON_OPTION_KEYS", default_value = "ABCDE")]
    option_keys: String,

    /// Minimum width and height (pixels) of a kept image.
    #[arg(long, env = "EXAM2JSON_MIN_IMAGE_SIZE", default_value_t = 300)]
    min_image_size: u32,

    /// Send each question's images to the model with its text.
    #[arg(long, env = "EXAM2JSON_ATTACH_IMAGES")]
    attach_images: bool,

    /// Retries per question on LLM failure.
    #[arg(long, env = "EXAM2JSON_MAX_RETRIES", default_value_t = 1)]
    max_retries: u32,

    /// Per-call LLM timeout in seconds.
    #[arg(long, env = "EXAM2JSON_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "EXAM2JSON_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Print the full output (questions, flags, stats) as JSON on stdout.
    #[arg(long, env = "EXAM2JSON_JSON")]
    json: bool,

    /// Exit with an error when any question was rejected.
    #[arg(long, env = "EXAM2JSON_STRICT")]
    strict: bool,

    /// Disable progress bar.
    #[arg(long, env = "EXAM2JSON_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "EXAM2JSON_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "EXAM2JSON_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs while it is visible.
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

    // ── Cancellation ─────────────────────────────────────────────────────
    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{} interrupted, finishing in-flight questions…", cyan("⚠"));
                cancel.cancel();
            }
        });
    }

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new_dynamic() as Arc<dyn ExtractionProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb, cancel).await?;

    // ── Run extraction ───────────────────────────────────────────────────
    let output = convert_exam(&cli.input, cli.answer_key.as_deref(), &config)
        .await
        .context("Extraction failed")?;

    if let Some(ref dir) = cli.output_dir {
        let json_path = dir.join(edgequake_exam2json::convert::QUESTIONS_FILE);
        let images_dir = cli.images_dir.clone().unwrap_or_else(|| dir.clone());
        write_output(&output, &json_path, &images_dir)
            .await
            .context("Failed to write output")?;
        if !cli.quiet {
            eprintln!("   →  {}", bold(&json_path.display().to_string()));
        }
    } else if let Some(ref images_dir) = cli.images_dir {
        anyhow::bail!(
            "--images-dir {} requires --output-dir",
            images_dir.display()
        );
    }

    if cli.json {
        let json = serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
        println!("{json}");
    } else if cli.output_dir.is_none() {
        println!("{}", output.questions_json()?);
    }

    if !cli.quiet {
        print_summary(&output, show_progress);
    }

    if cli.strict {
        output.into_result().context("Strict mode")?;
    }
    Ok(())
}

fn print_summary(output: &ExamOutput, progress_shown: bool) {
    let stats = &output.stats;
    if !progress_shown {
        eprintln!(
            "{}  {}/{} questions  {}ms",
            if stats.rejected == 0 { green("✔") } else { cyan("⚠") },
            stats.structured,
            stats.total_questions,
            stats.total_duration_ms,
        );
    }
    eprintln!(
        "   {} images kept of {}  /  {} review flags",
        dim(&stats.images_retained.to_string()),
        dim(&stats.images_extracted.to_string()),
        dim(&output.flags.len().to_string()),
    );
    eprintln!(
        "   {} tokens in  /  {} tokens out",
        dim(&stats.total_input_tokens.to_string()),
        dim(&stats.total_output_tokens.to_string()),
    );
}

/// Map CLI args to `ExtractionConfig`.
async fn build_config(
    cli: &Cli,
    progress: Option<ProgressCallback>,
    cancel: CancelFlag,
) -> Result<ExtractionConfig> {
    let mut builder = ExtractionConfig::builder()
        .concurrency(cli.concurrency)
        .requests_per_minute(cli.rpm)
        .max_retries(cli.max_retries)
        .api_timeout_secs(cli.api_timeout)
        .download_timeout_secs(cli.download_timeout)
        .exam_pages(parse_pages(&cli.pages)?)
        .answer_key_pages(parse_pages(&cli.answer_key_pages)?)
        .option_keys(cli.option_keys.chars().filter(|c| !c.is_whitespace() && *c != ','))
        .attach_images(cli.attach_images)
        .image_filter(ImageFilterConfig {
            min_width: cli.min_image_size,
            min_height: cli.min_image_size,
            ..ImageFilterConfig::default()
        })
        .cancel_flag(cancel);

    if let Some(ref path) = cli.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(ref pattern) = cli.marker_pattern {
        builder = builder.marker_pattern(pattern.clone());
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.clone());
    }
    if let Some(ref password) = cli.password {
        builder = builder.password(password.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Parse `--pages` string into `PageSelection`.
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
            anyhow::bail!("Invalid page range '{}-{}': start must be <= end", start, end);
        }
        return Ok(PageSelection::Range(start, end));
    }

    // Set: "1,3,5,7"
    if s.contains(',') {
        let pages: Vec<usize> = s
            .split(',')
            .map(|p| {
                p.trim()
                    .parse::<usize>()
                    .with_context(|| format!("Invalid page number: '{}'", p.trim()))
            })
            .collect::<Result<Vec<_>>>()?;
        if let Some(p) = pages.iter().find(|p| **p < 1) {
            anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", p);
        }
        return Ok(PageSelection::Set(pages));
    }

    // Single page: "5"
    let page: usize = s.parse().context("Invalid page number")?;
    if page < 1 {
        anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", page);
    }
    Ok(PageSelection::Single(page))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_selections_parse() {
        assert_eq!(parse_pages("all").unwrap(), PageSelection::All);
        assert_eq!(parse_pages("3-15").unwrap(), PageSelection::Range(3, 15));
        assert_eq!(parse_pages("1, 3,5").unwrap(), PageSelection::Set(vec![1, 3, 5]));
        assert_eq!(parse_pages("7").unwrap(), PageSelection::Single(7));
        assert!(parse_pages("0").is_err());
        assert!(parse_pages("9-2").is_err());
    }

    #[test]
    fn cli_parses_answer_key_and_output_dir() {
        let cli = Cli::try_parse_from(["exam2json", "prova.pdf", "-k", "gab.pdf", "-o", "out"]).unwrap();
        assert_eq!(cli.answer_key.as_deref(), Some("gab.pdf"));
        assert_eq!(cli.output_dir, Some(PathBuf::from("out")));
        assert_eq!(cli.max_retries, 1);
    }

    #[tokio::test]
    async fn rpm_flag_reaches_the_config() {
        let cli = Cli::try_parse_from(["exam2json", "prova.pdf", "--rpm", "0"]).unwrap();
        let config = build_config(&cli, None, CancelFlag::new()).await.unwrap();
        assert_eq!(config.requests_per_minute, 0);
    }
}
