//! CLI binary for pdfsvc.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ServiceConfig` and runs the server until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use pdfsvc::{serve, RendererCommand, ServiceConfig, SpoolPolicy};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const AFTER_HELP: &str = r#"EXAMPLES:
  Serve on the default address with three renderers:
    pdfsvc

  Require a token and allow ten seconds per document:
    TOKEN=s3cret pdfsvc --addr 0.0.0.0:8080 -d 10s

  Convert a document:
    curl -H 'Content-Type: text/html; charset=utf-8' \
         -H 'Authorization: Bearer s3cret' \
         --data-binary @page.html -o page.pdf http://localhost:8080/

DURATIONS:
  500ms, 5s, 2m, or a bare number of seconds. 0 disables the limit.
"#;

/// Serve HTML-to-PDF conversion over HTTP.
#[derive(Parser, Debug)]
#[command(
    name = "pdfsvc",
    version,
    about = "Serve HTML-to-PDF conversion over HTTP",
    long_about = "HTTP service converting POSTed HTML documents to PDF with wkhtmltopdf. \
Request bodies are spooled to memory or anonymous temp files, renderer processes are \
bounded, time-limited and killed when their request goes away.",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "ADDR", default_value = "localhost:8080")]
    addr: String,

    /// Maximum time for a single conversion.
    #[arg(
        short = 'd',
        long,
        env = "PDFSVC_TIMEOUT",
        default_value = "5s",
        value_parser = parse_duration
    )]
    timeout: Duration,

    /// Number of renderer processes allowed to run at once.
    #[arg(short = 'n', long, default_value_t = 3)]
    procs: i64,

    /// Require `Authorization: Bearer <token>` on every request.
    #[arg(long, env = "TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Overall deadline per request, spooling included.
    #[arg(long, default_value = "60s", value_parser = parse_duration)]
    request_timeout: Duration,

    /// Largest accepted request body in bytes (0 = unlimited).
    #[arg(long, default_value_t = pdfsvc::config::DEFAULT_MAX_BODY_SIZE)]
    max_body_size: u64,

    /// Bodies up to this many bytes with a declared length are kept in memory.
    #[arg(long, default_value_t = pdfsvc::config::DEFAULT_MEMORY_THRESHOLD)]
    buffer_size: u64,

    /// Directory for spool files (default: system temp dir).
    #[arg(long)]
    spool_dir: Option<PathBuf>,

    /// Maximum number of spool files open at once (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    max_spool_files: usize,

    /// How long a request may wait for a spool slot (0 = until it gives up).
    #[arg(long, default_value = "0", value_parser = parse_duration)]
    spool_wait: Duration,

    /// Renderer program; must read HTML on stdin and write PDF on stdout.
    #[arg(long, default_value = "wkhtmltopdf")]
    renderer: String,

    /// Largest accepted renderer output in bytes (0 = unlimited).
    #[arg(long, default_value_t = pdfsvc::config::DEFAULT_MAX_OUTPUT_SIZE)]
    max_output_size: u64,

    /// Debug logging.
    #[arg(short, long)]
    verbose: bool,

    /// Warnings only; no per-conversion diagnostics.
    #[arg(short, long)]
    quiet: bool,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (num, scale) = if let Some(n) = s.strip_suffix("ms") {
        (n, 0.001)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1.0)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60.0)
    } else {
        (s, 1.0)
    };
    let value: f64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration '{s}'"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("invalid duration '{s}'"));
    }
    Ok(Duration::from_secs_f64(value * scale))
}

fn renderer_command(program: &str) -> RendererCommand {
    let default = RendererCommand::default();
    RendererCommand::new(program).args(default.args)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Config ───────────────────────────────────────────────────────────
    let mut spool = SpoolPolicy::default()
        .max_body_size(cli.max_body_size)
        .memory_threshold(cli.buffer_size)
        .file_limit(cli.max_spool_files, cli.spool_wait);
    if let Some(dir) = cli.spool_dir {
        spool = spool.spool_dir(dir);
    }

    let config = ServiceConfig::builder()
        .addr(cli.addr)
        .procs(cli.procs.max(1) as usize)
        .timeout(cli.timeout)
        .request_timeout(cli.request_timeout)
        .token(cli.token.unwrap_or_default())
        .diagnostics(!cli.quiet)
        .max_output_size(cli.max_output_size)
        .spool(spool)
        .renderer(renderer_command(&cli.renderer))
        .build()
        .context("Invalid configuration")?;

    info!(config = %config.to_redacted_json(), "starting pdfsvc");

    serve(config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    })
    .await
    .context("Server failed")?;

    Ok(())
}
