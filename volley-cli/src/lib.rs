//! Fast and flexible HTTP/1.1 fuzzer built on request pipelining
//!
//! Provides the command line surface for the fuzzing engine: flag
//! parsing, generator and matcher construction, terminal status
//! reporting and result printing.
use async_trait::async_trait;
use clap::Parser;
use inline_colorization::{color_blue, color_green, color_red, color_reset, color_yellow};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::time::MissedTickBehavior;
use tracing::info;
use tracing_subscriber::EnvFilter;

use volley::client::{PoolConfig, DEFAULT_CONN_DEADLINE_SECS};
use volley::payload::matcher::StatusCodeMatcher;
use volley::payload::renderer::{RawTemplateRenderer, UrlRenderer};
use volley::payload::{NumericGenerator, WordlistGenerator};
use volley::{
    Error, FuzzResponse, FuzzStats, Fuzzer, Generator, RequestRenderer, ResponseMatcher,
    ResultSink, Scheme,
};

mod ui;
use ui::TermStatus;

const STATUS_INTERVAL_MS: u64 = 500;

/// Command line arguments for a fuzzing run.
#[derive(Parser)]
#[command(
    name = "volley",
    version,
    about = "A fast HTTP/1.1 fuzzer built on request pipelining"
)]
pub struct Cli {
    /// Target URL, e.g. https://host:8443/dir/FUZZ
    #[arg(short = 'u', long, conflicts_with = "request")]
    pub url: Option<String>,

    /// HTTP method used with --url targets
    #[arg(short = 'X', long, default_value = "GET")]
    pub method: String,

    /// Number of pipelined client workers
    #[arg(short = 't', long, default_value_t = 25)]
    pub threads: usize,

    /// Requests accumulated per pipelined batch
    #[arg(long, default_value_t = 100)]
    pub batch_size: usize,

    /// Dial timeout in seconds
    #[arg(long, default_value_t = 10)]
    pub timeout: u64,

    /// Raw request template file, or `-` to read from standard input
    #[arg(long)]
    pub request: Option<String>,

    /// Scheme used with raw request templates
    #[arg(long, default_value = "https")]
    pub request_scheme: String,

    /// Numeric payload generator `start:end:step:format`, repeatable
    #[arg(long = "gn", value_name = "SPEC")]
    pub generator_numeric: Vec<String>,

    /// Wordlist payload generator file, repeatable
    #[arg(short = 'w', long = "gw", value_name = "FILE")]
    pub generator_wordlist: Vec<PathBuf>,

    /// Status codes to report, e.g. `200,301-302` or `all`
    #[arg(long = "mc", default_value = "200,204,301,302,307,401,403")]
    pub match_codes: String,
}

/// Parse the command line and drive a fuzzing run to completion.
pub async fn run() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    execute(cli).await
}

async fn execute(cli: Cli) -> Result<(), Error> {
    let renderer = build_renderer(&cli).await?;
    let generators = build_generators(&cli).await?;
    let matchers: Vec<Box<dyn ResponseMatcher>> =
        vec![Box::new(StatusCodeMatcher::parse(&cli.match_codes)?)];

    let pool_config = PoolConfig {
        batch_size: cli.batch_size,
        pool_size: cli.threads,
        dial_timeout: Duration::from_secs(cli.timeout),
        conn_deadline: Duration::from_secs(DEFAULT_CONN_DEADLINE_SECS),
    };

    let fuzzer = Fuzzer::new(pool_config, renderer, generators, matchers)?;
    let stats = fuzzer.stats();

    let status = Arc::new(Mutex::new(TermStatus::new()));
    let reporter = tokio::spawn(report_status(stats, status.clone()));
    let mut sink = TermSink {
        status: status.clone(),
    };

    let result = fuzzer.run(&mut sink).await;

    reporter.abort();
    if let Ok(mut term) = status.lock() {
        term.clear();
    }

    let report = result?;
    info!(
        requests = report.requests,
        matched = report.matched,
        connections = report.connections,
        elapsed = ?report.elapsed,
        "run complete"
    );
    Ok(())
}

async fn build_renderer(cli: &Cli) -> Result<Arc<dyn RequestRenderer>, Error> {
    if let Some(url) = &cli.url {
        return Ok(Arc::new(UrlRenderer::parse(url, &cli.method)?));
    }
    let Some(source) = &cli.request else {
        return Err(Error::Config("either --url or --request is required".into()));
    };

    let template = if source == "-" {
        let mut template = String::new();
        let _ = tokio::io::stdin()
            .read_to_string(&mut template)
            .await
            .map_err(|e| Error::Config(format!("reading request template from stdin: {e}")))?;
        template
    } else {
        tokio::fs::read_to_string(source)
            .await
            .map_err(|e| Error::Config(format!("{source}: {e}")))?
    };

    let scheme: Scheme = cli.request_scheme.parse()?;
    Ok(Arc::new(RawTemplateRenderer::parse(&template, scheme)?))
}

async fn build_generators(cli: &Cli) -> Result<Vec<Box<dyn Generator>>, Error> {
    let mut generators: Vec<Box<dyn Generator>> = Vec::new();
    for spec in &cli.generator_numeric {
        generators.push(Box::new(NumericGenerator::parse(spec)?));
    }
    for path in &cli.generator_wordlist {
        generators.push(Box::new(WordlistGenerator::open(path).await?));
    }
    Ok(generators)
}

/// Prints matched responses above the live status line.
struct TermSink {
    status: Arc<Mutex<TermStatus>>,
}

#[async_trait]
impl ResultSink for TermSink {
    async fn deliver(&mut self, response: FuzzResponse) -> Result<(), Error> {
        let code_color = match response.status_code {
            200..=299 => color_green,
            300..=399 => color_blue,
            400..=499 => color_yellow,
            _ => color_red,
        };
        let line = format!(
            "{:<24} [Status: {code_color}{}{color_reset}, Size: {}, Words: {}, Lines: {}]",
            response.req.fuzz.join(","),
            response.status_code,
            response.size,
            response.words,
            response.lines,
        );
        if let Ok(mut term) = self.status.lock() {
            term.print_result(&line);
        }
        Ok(())
    }
}

async fn report_status(stats: Arc<FuzzStats>, status: Arc<Mutex<TermStatus>>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(STATUS_INTERVAL_MS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        let _ = ticker.tick().await;
        let snapshot = stats.snapshot();
        let line = format!(
            ":: reqs: {} | conns: {} | rate: {:.0} req/s | elapsed: {:.1}s",
            snapshot.req_count,
            snapshot.conn_count,
            snapshot.rate(),
            snapshot.elapsed.as_secs_f64(),
        );
        if let Ok(mut term) = status.lock() {
            term.update(line);
        }
    }
}
