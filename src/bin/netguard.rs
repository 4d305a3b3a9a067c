use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use netguard::{
    AdmissionConfig, CallMeta, DEFAULT_PRIORITY, MemorySink, NetClient, NetError, ResilienceConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "netguard")]
#[command(about = "Operator tooling for the netguard resilience layer")]
struct Cli {
    /// Fallback log filter when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Push a burst of synthetic calls through the admission queue and timeout guard
    Burst {
        #[arg(long, default_value_t = 40)]
        calls: usize,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        max_concurrent: Option<usize>,
        #[arg(long)]
        queue_limit: Option<usize>,
        /// Synthetic backend latency range in milliseconds
        #[arg(long, default_value_t = 20)]
        min_latency_ms: u64,
        #[arg(long, default_value_t = 200)]
        max_latency_ms: u64,
        /// Percentage of calls the synthetic backend fails
        #[arg(long, default_value_t = 10)]
        fail_percent: u8,
        /// Per-call guard timeout in milliseconds
        #[arg(long, default_value_t = 150)]
        timeout_ms: u64,
        #[arg(long, default_value_t = 0x5eed)]
        seed: u64,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the default configuration as JSON
    Default,
    /// Load and validate a configuration file
    Check { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json)?;

    match cli.command {
        Command::Config { action } => match action {
            ConfigAction::Default => print_default_config(),
            ConfigAction::Check { path } => check_config(&path),
        },
        Command::Burst {
            calls,
            config,
            max_concurrent,
            queue_limit,
            min_latency_ms,
            max_latency_ms,
            fail_percent,
            timeout_ms,
            seed,
        } => {
            let mut resilience = match config {
                Some(path) => load_config(&path)?,
                None => ResilienceConfig::default(),
            };
            let mut admission: AdmissionConfig = resilience.admission.clone();
            if let Some(max) = max_concurrent {
                admission = admission.max_concurrent(max);
            }
            if let Some(limit) = queue_limit {
                admission = admission.queue_limit(limit);
            }
            resilience = resilience.admission(admission);

            let plan = BurstPlan {
                calls,
                min_latency_ms,
                max_latency_ms: max_latency_ms.max(min_latency_ms),
                fail_percent: fail_percent.min(100),
                timeout: Duration::from_millis(timeout_ms),
                seed,
            };
            run_burst(resilience, plan).await
        }
    }
}

fn init_tracing(fallback: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .with_context(|| format!("invalid log filter '{}'", fallback))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|err| anyhow!("failed to install tracing subscriber: {}", err))
}

fn print_default_config() -> Result<()> {
    println!("{}", ResilienceConfig::default().to_json_pretty()?);
    Ok(())
}

fn load_config(path: &Path) -> Result<ResilienceConfig> {
    let config = ResilienceConfig::from_file(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    Ok(config)
}

fn check_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    println!("{} is valid", path.display());
    println!(
        "admission: {} concurrent, queue limit {}, request timeout {}",
        config.admission.max_concurrent,
        config.admission.queue_limit,
        config
            .admission
            .request_timeout_ms
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "none".to_string())
    );
    println!(
        "socket: {} ({} attempts every {}ms, heartbeat {}ms)",
        config.socket.url,
        config.socket.max_reconnect_attempts,
        config.socket.reconnect_interval_ms,
        config.socket.heartbeat_interval_ms
    );
    Ok(())
}

struct BurstPlan {
    calls: usize,
    min_latency_ms: u64,
    max_latency_ms: u64,
    fail_percent: u8,
    timeout: Duration,
    seed: u64,
}

async fn run_burst(config: ResilienceConfig, plan: BurstPlan) -> Result<()> {
    let events = MemorySink::new();
    let client = Arc::new(NetClient::new(config, events.clone())?);
    let monitor = client.health_monitor();

    let mut rng = Lcg64::new(plan.seed);
    let started = tokio::time::Instant::now();
    let mut handles = Vec::with_capacity(plan.calls);

    for index in 0..plan.calls {
        let spread = plan.max_latency_ms - plan.min_latency_ms + 1;
        let latency = Duration::from_millis(plan.min_latency_ms + rng.next_u64() % spread);
        let fails = (rng.next_u64() % 100) < plan.fail_percent as u64;
        let priority = if rng.next_u64() % 5 == 0 { 5 } else { DEFAULT_PRIORITY };
        let timeout = plan.timeout;
        let client = Arc::clone(&client);

        handles.push(tokio::spawn(async move {
            let call_started = tokio::time::Instant::now();
            let meta = CallMeta::new(format!("/synthetic/{}", index), "POST");
            let result = client
                .submit_with(
                    || {
                        let guarded = Arc::clone(&client);
                        async move {
                            guarded
                                .guard(
                                    move || async move {
                                        tokio::time::sleep(latency).await;
                                        if fails {
                                            Err(NetError::Call("synthetic failure".into()))
                                        } else {
                                            Ok(())
                                        }
                                    },
                                    timeout,
                                )
                                .await
                        }
                    },
                    priority,
                    meta,
                )
                .await;
            (result, call_started.elapsed().as_millis() as u64)
        }));
    }

    let mut latencies = Vec::with_capacity(plan.calls);
    let mut rejected = 0usize;
    for handle in handles {
        let (result, elapsed_ms) = handle.await.context("burst task panicked")?;
        if matches!(result, Err(NetError::QueueFull { .. })) {
            rejected += 1;
        } else {
            latencies.push(elapsed_ms);
        }
    }
    latencies.sort_unstable();

    let report = monitor.check();
    println!("burst of {} calls finished in {:?}", plan.calls, started.elapsed());
    println!("{}", client.admission_stats());
    println!("{}", client.guard_stats());
    println!(
        "latency ms: p50={} p95={} p99={} ({} rejected at admission)",
        percentile(&latencies, 0.50),
        percentile(&latencies, 0.95),
        percentile(&latencies, 0.99),
        rejected
    );
    println!(
        "events: {} timeouts, {} rejections, {} alerts in final sweep",
        events.count("call_timed_out"),
        events.count("queue_rejected"),
        report.alerts.len()
    );
    Ok(())
}

fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[idx]
}

struct Lcg64 {
    state: u64,
}

impl Lcg64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        self.state >> 11
    }
}
