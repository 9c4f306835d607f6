pub mod commands;

use crate::config::DiscoveryConfig;
use crate::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kubedox")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Discover API documentation served inside a Kubernetes cluster", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, global = true, env = "KUBEDOX_CONFIG", help = "YAML configuration file")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// `--verbose` forces DEBUG; otherwise `RUST_LOG`, falling back to INFO
    pub fn log_filter(&self) -> EnvFilter {
        if self.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Run discovery until interrupted")]
    Watch {
        #[command(flatten)]
        discovery: DiscoveryArgs,

        #[arg(long, default_value_t = 30, help = "Seconds between API list reports")]
        report_secs: u64,

        #[arg(long, help = "Print metrics in Prometheus format on exit")]
        metrics: bool,
    },
    #[command(about = "Discover APIs once and print them")]
    List {
        #[command(flatten)]
        discovery: DiscoveryArgs,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Json, help = "Output format")]
        format: OutputFormat,

        #[arg(long, default_value_t = 10, help = "Seconds to let discovery settle")]
        settle_secs: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Yaml,
}

/// Discovery settings overriding the configuration file
#[derive(Args, Debug, Clone, Default)]
pub struct DiscoveryArgs {
    #[arg(short, long, env = "KUBEDOX_NAMESPACE", help = "Kubernetes namespace to watch (default: all)")]
    pub namespace: Option<String>,

    #[arg(long, env = "KUBEDOX_RESYNC_SECS", help = "Informer relist period in seconds")]
    pub resync_secs: Option<u64>,

    #[arg(long, env = "KUBEDOX_DOMAIN_SUFFIX", help = "Cluster domain suffix")]
    pub domain_suffix: Option<String>,

    #[arg(long = "ignore", env = "KUBEDOX_IGNORE", value_delimiter = ',', help = "Service hostnames to ignore")]
    pub ignored_services: Vec<String>,

    #[arg(long, env = "KUBEDOX_PROBE_TIMEOUT_MS", help = "Probe timeout in milliseconds")]
    pub probe_timeout_ms: Option<u64>,

    #[arg(long, env = "KUBEDOX_SPEC_PATH", help = "Path probed for API documents")]
    pub spec_path: Option<String>,
}

impl DiscoveryArgs {
    /// Load the configuration file (or defaults) and apply these overrides
    pub fn resolve(&self, config_file: Option<&PathBuf>) -> Result<DiscoveryConfig> {
        let mut config = match config_file {
            Some(path) => DiscoveryConfig::from_yaml_file(path)?,
            None => DiscoveryConfig::default(),
        };

        if let Some(namespace) = &self.namespace {
            config.namespace = Some(namespace.clone());
        }
        if let Some(secs) = self.resync_secs {
            config.resync_period_secs = secs;
        }
        if let Some(suffix) = &self.domain_suffix {
            config.domain_suffix = suffix.clone();
        }
        if !self.ignored_services.is_empty() {
            config.ignored_services = self.ignored_services.clone();
        }
        if let Some(ms) = self.probe_timeout_ms {
            config.probe_timeout_ms = ms;
        }
        if let Some(path) = &self.spec_path {
            config.spec_path = path.clone();
        }

        config.validate()?;
        Ok(config)
    }
}
