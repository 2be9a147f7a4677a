//! nmc: run a pool of nginx workers behind a self-healing round-robin proxy.

use std::io::IsTerminal;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};

use nmc::cluster::Cluster;
use nmc::config::ClusterConfig;
use nmc::runtime::{DockerRuntime, WorkerRuntime};
use nmc::ui::Spinner;

#[derive(Parser, Debug)]
#[command(name = "nmc")]
#[command(version, about = "Nginx mini-cluster: round-robin proxy over self-healing nginx workers")]
struct Cli {
    /// Directory with the static site every worker serves
    #[arg(long)]
    site: Option<PathBuf>,

    /// Number of workers
    #[arg(short, long)]
    count: Option<usize>,

    /// Host port of the first worker; workers use consecutive ports
    #[arg(short, long)]
    port: Option<u16>,

    /// Public port of the proxy
    #[arg(long)]
    server_port: Option<u16>,

    /// Address the proxy listens on
    #[arg(long)]
    bind: Option<IpAddr>,

    /// nginx image tag
    #[arg(long)]
    nginx_version: Option<String>,

    /// TOML configuration file with a [cluster] table
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

impl Cli {
    /// Resolve the effective configuration: file (if any), then flags.
    fn into_config(self) -> Result<ClusterConfig> {
        let mut config = match &self.config {
            Some(path) => ClusterConfig::load_from(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => ClusterConfig::default(),
        };

        if let Some(site) = self.site {
            config.site = site;
        }
        if let Some(count) = self.count {
            config.count = count;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(server_port) = self.server_port {
            config.server_port = server_port;
        }
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(version) = self.nginx_version {
            config.image_version = version;
        }

        // Docker requires an absolute bind-mount source.
        if config.site.is_relative() {
            let cwd = std::env::current_dir().context("Failed to resolve working directory")?;
            config.site = cwd.join(&config.site);
        }

        Ok(config)
    }
}

fn init_logging(format: LogFormat) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_format = cli.log_format;
    init_logging(log_format);

    let config = cli.into_config()?;
    let validation = config.validate().context("Invalid configuration")?;
    for warning in &validation.warnings {
        warn!("{}", warning);
    }

    let runtime: Arc<dyn WorkerRuntime> = Arc::new(DockerRuntime::connect().await?);

    let spinner = if log_format == LogFormat::Text && std::io::stderr().is_terminal() {
        Spinner::start("Starting Nginx Mini-cluster...")
    } else {
        Spinner::hidden()
    };

    let cluster = match Cluster::bootstrap(&config, runtime).await {
        Ok(cluster) => {
            spinner.success(format!(
                "{} workers ready on ports {}-{}",
                config.count,
                config.port,
                usize::from(config.port) + config.count - 1
            ));
            cluster
        },
        Err(e) => {
            spinner.fail("Startup failed");
            error!(error = %e, "Startup failed");
            return Err(e.into());
        },
    };

    info!("Nginx Mini-cluster available at http://{}", cluster.listen_addr());

    let report = cluster.run().await?;
    if !report.is_clean() {
        anyhow::bail!("{} worker(s) did not stop cleanly", report.failed.len());
    }
    Ok(())
}
