#![cfg_attr(
    not(test),
    warn(clippy::print_stdout, clippy::dbg_macro),
    deny(clippy::unwrap_used, clippy::expect_used)
)]

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use rama::{
    error::{BoxError, ErrorContext as _},
    graceful,
    telemetry::tracing::{self, Instrument as _},
};

use clap::Parser;
use server_bench_lib::{
    config::{ServerKind, ServerTuning},
    server::{ConnectionHandler, RequestProcessor, ServerListener},
    utils::telemetry::{TelemetryConfig, init_tracing},
};

#[cfg(target_family = "unix")]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[cfg(target_os = "windows")]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// CLI arguments for configuring the benchmark server.
#[derive(Debug, Clone, Parser)]
#[command(name = "server")]
#[command(bin_name = "server")]
#[command(version, about, long_about = None)]
pub struct Args {
    /// request handling variant
    #[arg(long, value_enum, default_value_t = ServerKind::Vanilla)]
    pub kind: ServerKind,

    /// per request processing timeout
    #[arg(
        long,
        value_name = "SECONDS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    pub timeout: u64,

    /// address to listen on
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub ip: IpAddr,

    /// port to listen on
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    #[command(flatten)]
    pub tuning: ServerTuning,

    /// stop the server after this many seconds (runs until signalled if not set)
    #[arg(long, value_name = "SECONDS")]
    pub lifetime: Option<f64>,

    /// debug logging as default instead of Info; use RUST_LOG env for more options
    #[arg(long, short = 'v', default_value_t = false)]
    pub verbose: bool,

    /// enable pretty logging (format for humans)
    #[arg(long, default_value_t = false)]
    pub pretty: bool,

    /// write the tracing output to the provided (log) file instead of stderr
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,

    #[arg(long, value_name = "SECONDS", default_value_t = 1.)]
    /// the graceful shutdown timeout (<= 0.0 = no timeout)
    pub graceful: f64,

    #[cfg(target_family = "unix")]
    /// Set the limit of max open file descriptors for this process and its children.
    #[arg(long, value_name = "N", default_value_t = 262_144)]
    pub ulimit: server_bench_lib::utils::os::rlim_t,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();

    init_tracing(&TelemetryConfig {
        verbose: args.verbose,
        pretty: args.pretty,
        output: args.output.clone(),
    })?;

    #[cfg(target_family = "unix")]
    {
        let limit = server_bench_lib::utils::os::raise_nofile(args.ulimit)
            .context("set file descriptor limit")?;
        tracing::info!(soft = limit.soft, "max open connections bounded by file descriptor limit");
    }

    let base_shutdown_signal = graceful::default_signal();
    if let Err(err) = run_with_args(base_shutdown_signal, args).await {
        eprintln!("🚩 exit with error: {err}");
        std::process::exit(1);
    }

    Ok(())
}

async fn run_with_args<F>(base_shutdown_signal: F, args: Args) -> Result<(), BoxError>
where
    F: Future<Output: Send + 'static> + Send + 'static,
{
    let graceful_timeout = if args.graceful > 0. {
        Some(secs_to_duration("graceful", args.graceful)?)
    } else {
        None
    };
    let lifetime = match args.lifetime {
        Some(secs) if secs > 0. => Some(secs_to_duration("lifetime", secs)?),
        Some(secs) => {
            return Err(BoxError::from(format!(
                "invalid lifetime {secs}: must be a positive amount of seconds"
            )));
        }
        None => None,
    };

    let strategy = args.kind.resolve(args.tuning).context("resolve server kind")?;
    let processor = RequestProcessor::try_new(strategy, Duration::from_secs(args.timeout))
        .context("create request processor")?;

    let addr = SocketAddr::new(args.ip, args.port);
    let listener = ServerListener::bind(addr).await?;

    tracing::info!(
        kind = %args.kind,
        timeout = ?processor.timeout(),
        strategy = ?processor.strategy(),
        ?lifetime,
        "server config ready",
    );

    let graceful = graceful::Shutdown::new(new_shutdown_signal(lifetime, base_shutdown_signal));

    let handler = ConnectionHandler::new(processor);
    let span = tracing::debug_span!(
        "server lifetime",
        server.address = %listener.local_addr(),
        otel.kind = "server",
        network.protocol.name = "tcp",
    );
    graceful.spawn_task_fn(async move |guard| listener.serve(guard, handler).instrument(span).await);

    let delay = match graceful_timeout {
        Some(duration) => graceful.shutdown_with_limit(duration).await?,
        None => graceful.shutdown().await,
    };

    tracing::info!("gracefully shutdown with a delay of: {delay:?}");
    Ok(())
}

fn secs_to_duration(flag: &'static str, secs: f64) -> Result<Duration, BoxError> {
    let duration = Duration::try_from_secs_f64(secs)
        .context("seconds out of range")
        .context_field("flag", flag)
        .context_field("seconds", secs)?;
    Ok(duration)
}

fn new_shutdown_signal(
    lifetime: Option<Duration>,
    base_shutdown_signal: impl Future<Output: Send + 'static> + Send + 'static,
) -> impl Future + Send + 'static {
    async move {
        let expired = async {
            match lifetime {
                Some(lifetime) => tokio::time::sleep(lifetime).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = base_shutdown_signal => {
                tracing::debug!("default signal triggered: init graceful shutdown");
            }
            _ = expired => {
                tracing::info!("server lifetime expired: init graceful shutdown");
            }
        }
    }
}
