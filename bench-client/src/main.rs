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
    telemetry::tracing,
};

use clap::{Args as ClapArgs, Parser, Subcommand};
use server_bench_lib::{
    client::{ClientEngine, EngineConfig, transport::BackoffConfig},
    config::LoopKind,
    metrics::{
        reporter::{HumanReporter, JsonlReporter, Reporter},
        write_stats_file,
    },
    utils::telemetry::{TelemetryConfig, init_tracing},
    work::Work,
    workload::{DEFAULT_BURST_SIZE, WorkloadShape, WorkloadSpec},
};

#[cfg(target_family = "unix")]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[cfg(target_os = "windows")]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// CLI arguments for configuring the benchmark client.
#[derive(Debug, Clone, Parser)]
#[command(name = "client")]
#[command(bin_name = "client")]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    shape: ShapeCommand,

    /// loop discipline
    #[arg(long, value_enum, default_value_t = LoopKind::Closed)]
    pub kind: LoopKind,

    /// period in which new requests are issued
    #[arg(
        long,
        value_name = "SECONDS",
        default_value_t = 6,
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    pub runtime: u64,

    /// mean think time (closed loop) or inter-arrival time (open loop)
    #[arg(
        long,
        value_name = "SECONDS",
        default_value_t = 1,
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    pub delay: u64,

    /// address of the server
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub ip: IpAddr,

    /// port of the server
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// amount of virtual clients
    #[arg(long, default_value_t = 1)]
    pub num_clients: usize,

    /// per request timeout, also the grace period for in-flight requests
    #[arg(
        long,
        value_name = "SECONDS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    pub timeout: u64,

    /// seed of the workload schedules (random if not set)
    #[arg(long)]
    pub seed: Option<u64>,

    /// work requested from the server: noop, busy:<iterations> or sleep:<micros>
    #[arg(long, default_value_t = Work::Noop)]
    pub work: Work,

    /// report json instead of a human-friendly format
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// also report every sample as a json line (requires --json)
    #[arg(long, default_value_t = false, requires = "json")]
    pub events: bool,

    /// write `<DIR>/<KIND>/stats.txt` with latency percentiles and throughput
    #[arg(long, value_name = "DIR")]
    pub dir: Option<PathBuf>,

    /// debug logging as default instead of Info; use RUST_LOG env for more options
    #[arg(long, short = 'v', default_value_t = false, global = true)]
    pub verbose: bool,

    /// enable pretty logging (format for humans)
    #[arg(long, default_value_t = false, global = true)]
    pub pretty: bool,

    /// write the tracing output to the provided (log) file instead of stderr
    #[arg(long, short = 'o', global = true)]
    pub output: Option<PathBuf>,

    #[cfg(target_family = "unix")]
    /// Set the limit of max open file descriptors for this process and its children.
    #[arg(long, value_name = "N", default_value_t = 262_144, global = true)]
    pub ulimit: server_bench_lib::utils::os::rlim_t,
}

/// workload shape
#[derive(Debug, Clone, Subcommand)]
enum ShapeCommand {
    /// fixed interval
    Constant(IntervalArgs),
    /// exponentially distributed intervals
    Poisson(IntervalArgs),
    /// back-to-back bursts followed by a pause, preserving the mean interval
    Bursty {
        #[command(flatten)]
        interval: IntervalArgs,

        /// amount of requests per burst
        #[arg(long, default_value_t = DEFAULT_BURST_SIZE)]
        burst_size: u32,
    },
}

#[derive(Debug, Clone, ClapArgs)]
struct IntervalArgs {
    /// mean interval in milliseconds, overrides --delay
    #[arg(long, value_name = "MILLIS")]
    interval_ms: Option<u64>,
}

impl ShapeCommand {
    fn resolve(&self, delay: Duration) -> (WorkloadShape, Duration) {
        let (shape, interval) = match self {
            Self::Constant(interval) => (WorkloadShape::Constant, interval),
            Self::Poisson(interval) => (WorkloadShape::Poisson, interval),
            Self::Bursty {
                interval,
                burst_size,
            } => (
                WorkloadShape::Bursty {
                    burst_size: *burst_size,
                },
                interval,
            ),
        };
        let interval = interval
            .interval_ms
            .map(Duration::from_millis)
            .unwrap_or(delay);
        (shape, interval)
    }
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
        if !limit.fits(args.num_clients) {
            tracing::warn!(
                soft = limit.soft,
                hard = limit.hard,
                num_clients = args.num_clients,
                "file descriptor limit too low for one connection per client: expect connect errors"
            );
        }
    }

    if let Err(err) = run_with_args(graceful::default_signal(), args).await {
        eprintln!("🚩 exit with error: {err}");
        std::process::exit(1);
    }

    Ok(())
}

async fn run_with_args<F>(shutdown_signal: F, args: Args) -> Result<(), BoxError>
where
    F: Future + Send,
{
    let (shape, interval) = args.shape.resolve(Duration::from_secs(args.delay));
    let seed = args.seed.unwrap_or_else(rand::random);
    let workload = WorkloadSpec::try_new(shape, interval, seed).context("create workload")?;

    let cfg = EngineConfig {
        addr: SocketAddr::new(args.ip, args.port),
        discipline: args.kind,
        runtime: Duration::from_secs(args.runtime),
        timeout: Duration::from_secs(args.timeout),
        num_clients: args.num_clients,
        workload,
        work: args.work,
        backoff: BackoffConfig::default(),
    };
    let engine = ClientEngine::try_new(cfg).context("create client engine")?;

    tracing::info!(seed, "workload ready (pass --seed to reproduce)");

    let reporter: Box<dyn Reporter> = if args.json {
        Box::new(JsonlReporter::stdout(REPORT_INTERVAL, args.events))
    } else {
        Box::new(HumanReporter::stdout(REPORT_INTERVAL))
    };

    let report = engine.run(shutdown_signal, reporter).await?;

    for client in &report.clients {
        tracing::debug!(
            client.id = client.client,
            issued = client.issued,
            connects = client.connects,
            connect_failures = client.connect_failures,
            "virtual client report",
        );
    }

    if let Some(dir) = args.dir {
        let path = dir.join(args.kind.to_string()).join("stats.txt");
        write_stats_file(&report.summary, &path).await?;
        tracing::info!(path = %path.display(), "stats file written");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_script_invocation() {
        let args = Args::try_parse_from([
            "client",
            "--kind",
            "closed",
            "--runtime",
            "6",
            "--delay",
            "1",
            "--ip",
            "127.0.0.1",
            "--port",
            "8080",
            "--num-clients",
            "1",
            "constant",
        ])
        .unwrap();

        assert_eq!(args.kind, LoopKind::Closed);
        assert_eq!(args.runtime, 6);
        assert_eq!(args.num_clients, 1);
        assert_eq!(args.work, Work::Noop);
        assert_eq!(
            args.shape.resolve(Duration::from_secs(args.delay)),
            (WorkloadShape::Constant, Duration::from_secs(1))
        );
    }

    #[test]
    fn parse_bursty_with_interval() {
        let args = Args::try_parse_from([
            "client",
            "--kind",
            "open",
            "--work",
            "busy:1000",
            "bursty",
            "--interval-ms",
            "20",
            "--burst-size",
            "8",
        ])
        .unwrap();

        assert_eq!(args.kind, LoopKind::Open);
        assert_eq!(args.work, Work::Busy { iterations: 1000 });
        assert_eq!(
            args.shape.resolve(Duration::from_secs(args.delay)),
            (
                WorkloadShape::Bursty { burst_size: 8 },
                Duration::from_millis(20)
            )
        );
    }

    #[test]
    fn unknown_shape_or_kind_is_rejected() {
        assert!(Args::try_parse_from(["client", "zigzag"]).is_err());
        assert!(Args::try_parse_from(["client", "--kind", "half-open", "constant"]).is_err());
        assert!(Args::try_parse_from(["client", "--runtime", "0", "constant"]).is_err());
    }

    #[tokio::test]
    async fn zero_clients_fails_before_running() {
        let args = Args::try_parse_from(["client", "--num-clients", "0", "constant"]).unwrap();
        let result = run_with_args(std::future::pending::<()>(), args).await;
        assert!(result.is_err());
    }
}
