//! Agent configuration

use agent_lib::cache::NodeCacheConfig;
use agent_lib::upload::MAX_BATCH_SIZE;
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound for every period and timeout setting (one week)
const MAX_PERIOD_SECS: u64 = 7 * 24 * 60 * 60;

/// Kubernetes usage agent
#[derive(Debug, Parser)]
#[command(name = "usage-agent")]
#[command(author, version, about = "Reports per-workload resource usage to Firehose", long_about = None)]
pub struct Cli {
    /// Optional configuration file (TOML, YAML or JSON)
    #[arg(long, env = "AGENT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Cluster name stamped on every record
    #[arg(long)]
    pub cluster_name: Option<String>,

    /// Firehose delivery stream
    #[arg(long)]
    pub stream_name: Option<String>,

    /// Path to kubeconfig file (in-cluster config if not specified)
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Health and metrics port
    #[arg(long)]
    pub api_port: Option<u16>,

    /// Seconds between scans
    #[arg(long)]
    pub scan_interval_secs: Option<u64>,

    /// Seconds between full node reconciliations
    #[arg(long)]
    pub node_resync_interval_secs: Option<u64>,

    /// Seconds a deleted node stays cached
    #[arg(long)]
    pub node_eviction_grace_secs: Option<u64>,

    /// Seconds to wait for the initial node listing
    #[arg(long)]
    pub cache_sync_timeout_secs: Option<u64>,

    /// Records per Firehose call
    #[arg(long)]
    pub max_batch_size: Option<u64>,

    /// Log records instead of sending them
    #[arg(long)]
    pub dry_run: bool,

    /// Log output format
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

impl LogFormat {
    fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Text => "text",
        }
    }
}

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Cluster name stamped on every node snapshot
    #[serde(default)]
    pub cluster_name: String,

    /// Firehose delivery stream, not needed in dry-run mode
    #[serde(default)]
    pub stream_name: Option<String>,

    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,

    /// API server port for health/metrics
    pub api_port: u16,

    pub scan_interval_secs: u64,

    pub node_resync_interval_secs: u64,

    pub node_eviction_grace_secs: u64,

    pub cache_sync_timeout_secs: u64,

    pub max_batch_size: usize,

    pub dry_run: bool,

    pub log_format: LogFormat,
}

impl AgentConfig {
    /// Load configuration from defaults, an optional file, `AGENT_*`
    /// environment variables and command line flags, in that order
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Self::defaults()?;
        if let Some(path) = &cli.config {
            builder = builder.add_source(File::from(path.as_path()));
        }
        builder = builder.add_source(Environment::with_prefix("AGENT").try_parsing(true));
        Self::finish(apply_overrides(builder, cli)?)
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>> {
        Ok(config::Config::builder()
            .set_default("api_port", 8080)?
            .set_default("scan_interval_secs", 900)?
            .set_default("node_resync_interval_secs", 900)?
            .set_default("node_eviction_grace_secs", 300)?
            .set_default("cache_sync_timeout_secs", 60)?
            .set_default("max_batch_size", MAX_BATCH_SIZE as u64)?
            .set_default("dry_run", false)?
            .set_default("log_format", LogFormat::default().as_str())?)
    }

    fn finish(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let config: Self = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the agent cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.trim().is_empty() {
            anyhow::bail!("cluster_name is required");
        }
        if !self.dry_run && self.stream_name.as_deref().map_or(true, str::is_empty) {
            anyhow::bail!("stream_name is required unless dry_run is set");
        }
        for (name, secs) in [
            ("scan_interval_secs", self.scan_interval_secs),
            ("node_resync_interval_secs", self.node_resync_interval_secs),
            ("cache_sync_timeout_secs", self.cache_sync_timeout_secs),
        ] {
            if secs == 0 {
                anyhow::bail!("{} must be positive", name);
            }
            if secs > MAX_PERIOD_SECS {
                anyhow::bail!("{} must be at most {}", name, MAX_PERIOD_SECS);
            }
        }
        if self.node_eviction_grace_secs > MAX_PERIOD_SECS {
            anyhow::bail!("node_eviction_grace_secs must be at most {}", MAX_PERIOD_SECS);
        }
        if !(1..=MAX_BATCH_SIZE).contains(&self.max_batch_size) {
            anyhow::bail!("max_batch_size must be between 1 and {}", MAX_BATCH_SIZE);
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn node_cache_config(&self) -> NodeCacheConfig {
        NodeCacheConfig {
            eviction_grace: Duration::from_secs(self.node_eviction_grace_secs),
            resync_interval: Duration::from_secs(self.node_resync_interval_secs),
            sync_timeout: Duration::from_secs(self.cache_sync_timeout_secs),
            ..NodeCacheConfig::default()
        }
    }
}

fn apply_overrides(
    builder: ConfigBuilder<DefaultState>,
    cli: &Cli,
) -> Result<ConfigBuilder<DefaultState>> {
    let mut builder = builder
        .set_override_option("cluster_name", cli.cluster_name.clone())?
        .set_override_option("stream_name", cli.stream_name.clone())?
        .set_override_option(
            "kubeconfig",
            cli.kubeconfig
                .as_ref()
                .map(|path| path.to_string_lossy().into_owned()),
        )?
        .set_override_option("api_port", cli.api_port.map(u64::from))?
        .set_override_option("scan_interval_secs", cli.scan_interval_secs)?
        .set_override_option("node_resync_interval_secs", cli.node_resync_interval_secs)?
        .set_override_option("node_eviction_grace_secs", cli.node_eviction_grace_secs)?
        .set_override_option("cache_sync_timeout_secs", cli.cache_sync_timeout_secs)?
        .set_override_option("max_batch_size", cli.max_batch_size)?
        .set_override_option("log_format", cli.log_format.map(|f| f.as_str()))?;
    if cli.dry_run {
        builder = builder.set_override("dry_run", true)?;
    }
    Ok(builder)
}
