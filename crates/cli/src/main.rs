use std::str::FromStr;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use outpost_core::PodEvent;
use outpost_kubewatch::PodWatcher;
use outpost_merge::{EngineConfig, PodMerger};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "outpostctl", version, about = "Outpost cloud controller CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch pods and print the merged event stream
    Watch {
        /// Raw event queue capacity
        #[arg(long = "buffer", env = "OUTPOST_POD_BUFFER")]
        buffer: Option<usize>,
    },
}

fn init_tracing() {
    let env = std::env::var("OUTPOST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("OUTPOST_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid OUTPOST_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Watch { buffer } => {
            let ns = cli.namespace.as_deref();
            let config = EngineConfig {
                event_buffer: buffer.unwrap_or(EngineConfig::default().event_buffer),
            };
            info!(ns = ?ns, buffer = config.event_buffer, "watch invoked");

            let watcher = PodWatcher::connect(ns).await?;
            let shutdown = CancellationToken::new();
            let mut merger = match PodMerger::start(&config, &watcher, shutdown.clone()).await {
                Ok(m) => m,
                Err(e) => {
                    error!(error = %e, "failed to start merge engine");
                    return Err(e.into());
                }
            };

            tokio::spawn({
                let shutdown = shutdown.clone();
                async move {
                    if signal::ctrl_c().await.is_ok() {
                        info!("Ctrl-C received; shutting down");
                        shutdown.cancel();
                    }
                }
            });

            while let Some(ev) = merger.events().recv().await {
                match cli.output {
                    Output::Human => {
                        let sigil = match &ev {
                            PodEvent::Added(_) => '+',
                            PodEvent::Modified(_) => '~',
                            PodEvent::Deleted(_) => '-',
                            PodEvent::Unknown(_) => '?',
                        };
                        println!("{} {}", sigil, ev.snapshot().key());
                    }
                    Output::Json => println!("{}", serde_json::to_string(&ev)?),
                }
            }
            info!("merged stream closed; exiting");
        }
    }
    Ok(())
}
