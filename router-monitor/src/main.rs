mod arp;
mod dns;
mod dnsmasq;
mod ebpf;
mod error;
mod flows;
mod hostname;
mod leases;
mod model;
mod probe;
mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arp::{ArpTableReader, DEFAULT_ARP_FILE};
use clap::{Args, Parser, Subcommand};
use dnsmasq::{DnsmasqCollector, DnsmasqConfig, DnsmasqMetrics, FailurePolicy, StatsClient};
use hostname::{HostnameCache, SystemResolver, DEFAULT_HOSTNAME_TTL, DEFAULT_LOOKUP_TIMEOUT};
use probe::{
    ProbeMetrics, ReachabilityProbe, DEFAULT_PROBE_INTERVAL, DEFAULT_PROBE_TARGETS,
    DEFAULT_PROBE_TIMEOUT,
};
use prometheus_client::registry::Registry;
use server::{AppState, Exporter};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_LEASES_FILE: &str = "/var/lib/misc/dnsmasq.leases";
const DEFAULT_DNSMASQ_ADDR: &str = "localhost:53";

#[derive(Parser, Debug)]
#[command(name = "router-monitor")]
#[command(about = "Export router traffic, device and resolver metrics for Prometheus")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Attach the tc counters and serve the metrics endpoint.
    Run(RunArgs),

    /// Print the ARP table with resolved hostnames.
    Arp {
        #[arg(long, default_value = DEFAULT_ARP_FILE)]
        arp_file: PathBuf,

        #[arg(long, env = "DOMAIN_SUFFIX", default_value = "")]
        strip_domain_suffix: String,

        #[arg(long, default_value_t = DEFAULT_LOOKUP_TIMEOUT.as_millis() as u64)]
        reverse_lookup_timeout_ms: u64,
    },

    /// Print the DHCP leases handed out by dnsmasq.
    Leases {
        #[arg(long, default_value = DEFAULT_LEASES_FILE)]
        leases_file: PathBuf,
    },

    /// Print the cache statistics dnsmasq reports over CHAOS/TXT.
    DnsmasqStats {
        #[arg(long, default_value = DEFAULT_DNSMASQ_ADDR)]
        dnsmasq_addr: String,

        #[arg(long, default_value_t = 2000)]
        dns_timeout_ms: u64,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long)]
    iface: String,

    /// Optional eBPF object path. If omitted, auto-detect a local build artifact.
    #[arg(long)]
    bpf_object: Option<PathBuf>,

    #[arg(long, env = "HOST", default_value = "localhost")]
    listen_host: String,

    #[arg(long, env = "PORT", default_value_t = 9156)]
    listen_port: u16,

    #[arg(long, default_value = "/metrics")]
    metrics_path: String,

    #[arg(long, default_value = DEFAULT_ARP_FILE)]
    arp_file: PathBuf,

    #[arg(long, default_value = DEFAULT_LEASES_FILE)]
    leases_file: PathBuf,

    #[arg(long, default_value = DEFAULT_DNSMASQ_ADDR)]
    dnsmasq_addr: String,

    /// Removed from the end of every resolved hostname.
    #[arg(long, env = "DOMAIN_SUFFIX", default_value = "")]
    strip_domain_suffix: String,

    #[arg(long, default_value_t = DEFAULT_HOSTNAME_TTL.as_secs())]
    hostname_ttl_secs: u64,

    #[arg(long, default_value_t = DEFAULT_LOOKUP_TIMEOUT.as_millis() as u64)]
    reverse_lookup_timeout_ms: u64,

    #[arg(long, default_value_t = 2000)]
    dns_timeout_ms: u64,

    #[arg(long, value_enum, default_value_t = FailurePolicy::FailScrape)]
    dnsmasq_failure_policy: FailurePolicy,

    /// host:port dialled by the reachability probe. Repeat for several targets.
    #[arg(long = "probe-target", default_values = DEFAULT_PROBE_TARGETS)]
    probe_targets: Vec<String>,

    #[arg(long, default_value_t = DEFAULT_PROBE_INTERVAL.as_secs())]
    probe_interval_secs: u64,

    #[arg(long, default_value_t = DEFAULT_PROBE_TIMEOUT.as_millis() as u64)]
    probe_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_log();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Arp {
            arp_file,
            strip_domain_suffix,
            reverse_lookup_timeout_ms,
        } => {
            let hosts = HostnameCache::new(
                Arc::new(SystemResolver),
                strip_domain_suffix,
                DEFAULT_HOSTNAME_TTL,
                millis(reverse_lookup_timeout_ms),
            );
            let reader = ArpTableReader::new(arp_file, Arc::new(hosts));
            let rows = reader.read().await;
            print_rows_or_empty(&rows, |row| println!("{}", row));
            Ok(())
        }
        Command::Leases { leases_file } => {
            let rows = leases::read_leases(&leases_file).await?;
            print_rows_or_empty(&rows, |row| println!("{}", row));
            Ok(())
        }
        Command::DnsmasqStats {
            dnsmasq_addr,
            dns_timeout_ms,
        } => {
            let client = StatsClient::new(dnsmasq_addr, millis(dns_timeout_ms));
            let stats = client.query_stats().await?;
            print_rows_or_empty(&stats.values, |(record, value)| {
                println!("{}\t{}", record, value)
            });
            println!("## servers");
            print_rows_or_empty(&stats.servers, |row| println!("{}", row));
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let object = ebpf::resolve_bpf_object(args.bpf_object)?;
    let (attachment, flows) = ebpf::attach(&object, &args.iface)?;

    let hosts = Arc::new(HostnameCache::new(
        Arc::new(SystemResolver),
        args.strip_domain_suffix,
        Duration::from_secs(args.hostname_ttl_secs.max(1)),
        millis(args.reverse_lookup_timeout_ms),
    ));
    let arp = ArpTableReader::new(args.arp_file, hosts);
    let dnsmasq = DnsmasqCollector::new(
        DnsmasqConfig {
            addr: args.dnsmasq_addr,
            leases_path: args.leases_file,
            timeout: millis(args.dns_timeout_ms),
            policy: args.dnsmasq_failure_policy,
        },
        DnsmasqMetrics::default(),
    );
    let exporter = Exporter::new(flows, arp, dnsmasq);
    let probe_metrics = ProbeMetrics::default();

    let mut registry = Registry::default();
    exporter.register(&mut registry);
    probe_metrics.register(&mut registry);

    let probe = ReachabilityProbe::new(
        args.probe_targets,
        Duration::from_secs(args.probe_interval_secs),
        millis(args.probe_timeout_ms),
        probe_metrics,
    );

    let shutdown = CancellationToken::new();
    let fatal = CancellationToken::new();
    let probe_task = tokio::spawn(probe.run(shutdown.child_token()));
    spawn_shutdown_triggers(shutdown.clone(), fatal.clone());

    let state = AppState {
        registry: Arc::new(registry),
        exporter: Arc::new(exporter),
        fatal: fatal.clone(),
        metrics_path: normalize_path(&args.metrics_path),
    };
    let listener = TcpListener::bind((args.listen_host.as_str(), args.listen_port))
        .await
        .with_context(|| format!("failed to bind {}:{}", args.listen_host, args.listen_port))?;
    let served = server::serve(listener, server::router(state), shutdown.clone()).await;

    shutdown.cancel();
    if let Err(err) = probe_task.await {
        warn!(error = %err, "reachability probe task failed");
    }
    info!(iface = %attachment.iface(), "detaching tc programs");
    drop(attachment);

    served?;
    if fatal.is_cancelled() {
        bail!("flow counter tables became unreadable");
    }
    Ok(())
}

fn spawn_shutdown_triggers(shutdown: CancellationToken, fatal: CancellationToken) {
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                on_signal.cancel();
            }
            Err(err) => warn!(error = %err, "cannot listen for ctrl-c"),
        }
    });
    tokio::spawn(async move {
        tokio::select! {
            _ = fatal.cancelled() => shutdown.cancel(),
            _ = shutdown.cancelled() => {}
        }
    });
}

fn init_log() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,aya=warn".into()),
        )
        .with_target(true)
        .try_init();
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms.max(1))
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

fn print_rows_or_empty<T, F>(rows: &[T], mut render: F)
where
    F: FnMut(&T),
{
    if rows.is_empty() {
        println!("(empty)");
        return;
    }
    for row in rows {
        render(row);
    }
}
