use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use sling::config::{OutputMode, WorkSpec};
use sling::errors::Error;
use sling::executor::Work;
use sling::script::ScriptEngine;

/// Script-driven HTTP load generator.
///
/// The script defines `main(ctx)` and issues requests through the
/// predeclared `requests` module; each invocation of `main` is one unit of
/// work. With `-n` the script runs a fixed number of units; otherwise a
/// controller drives enough workers to sustain the target request rate.
#[derive(Parser)]
#[command(name = "sling", version, about)]
struct Cli {
    /// Number of script units to run; 0 selects rate mode.
    #[arg(short = 'n', default_value_t = 0)]
    n: u64,

    /// Run for this duration instead (e.g. "30s", "3m"); implies rate mode
    /// and overrides -n.
    #[arg(short = 'z')]
    duration: Option<humantime::Duration>,

    /// Target requests per second in rate mode.
    #[arg(long, default_value_t = 5)]
    rps: u64,

    /// Per-request timeout in seconds.
    #[arg(short = 't', default_value_t = 20)]
    timeout: u64,

    /// Negotiate HTTP/2 over TLS.
    #[arg(long)]
    h2: bool,

    /// HTTP proxy URL.
    #[arg(short = 'x')]
    proxy: Option<String>,

    /// Output type: summary by default, "csv" streams one row per request.
    #[arg(short = 'o', default_value = "")]
    output: String,

    /// Worker threads for the network runtime.
    #[arg(long, default_value_t = default_cpus())]
    cpus: usize,

    /// User-agent header injected into every request.
    #[arg(long)]
    user_agent: Option<String>,

    /// Do not advertise or decode gzip responses.
    #[arg(long)]
    disable_compression: bool,

    /// Do not reuse TCP connections between requests.
    #[arg(long)]
    disable_keepalive: bool,

    /// Extra header applied to every request, repeatable ("Name: value").
    #[arg(short = 'H')]
    headers: Vec<String>,

    /// Log controller adjustments without applying them.
    #[arg(long)]
    observe_only: bool,

    /// Path to the request script.
    script: PathBuf,
}

fn default_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if let Err(err) = run(cli) {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Error> {
    let proxy = match &cli.proxy {
        Some(raw) => Some(
            Url::parse(raw).map_err(|e| Error::Config(format!("invalid proxy url {raw:?}: {e}")))?,
        ),
        None => None,
    };

    let spec = WorkSpec {
        // A duration-bounded run is open-ended: rate mode plus a timer.
        n: if cli.duration.is_some() { 0 } else { cli.n },
        rps: cli.rps,
        timeout: Duration::from_secs(cli.timeout),
        h2: cli.h2,
        disable_compression: cli.disable_compression,
        disable_keepalive: cli.disable_keepalive,
        proxy,
        user_agent: cli
            .user_agent
            .unwrap_or_else(|| WorkSpec::default().user_agent),
        headers: WorkSpec::parse_headers(&cli.headers)?,
        output: OutputMode::parse(&cli.output)?,
        writer: None,
        observe_only: cli.observe_only,
    };
    spec.validate()?;

    let engine = ScriptEngine::new(&cli.script)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cli.cpus.max(1))
        .enable_all()
        .build()?;

    let work = Work::new(spec, engine, runtime.handle().clone());

    let stop = work.stop_token();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; stopping");
            stop.cancel();
        }
    });

    if let Some(duration) = cli.duration {
        let stop = work.stop_token();
        let duration: Duration = duration.into();
        runtime.spawn(async move {
            tokio::time::sleep(duration).await;
            info!("duration elapsed; stopping");
            stop.cancel();
        });
    }

    work.run();
    Ok(())
}
