use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;

use crate::config::MetricsFormat;

pub const DEFAULT_WORKERS: usize = 5;
pub const DEFAULT_MAX_ENDPOINTS_PER_SLICE: usize = 100;
pub const MAX_ENDPOINTS_PER_SLICE_LIMIT: usize = 1000;
pub const DEFAULT_MAX_ENDPOINTS_CAPACITY: usize = 1000;
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MIN_RETRY_DELAY_MS: u64 = 5;
pub const DEFAULT_MAX_RETRY_DELAY_SECS: u64 = 1000;
pub const DEFAULT_STRUCTURAL_RETRY_DELAY_SECS: u64 = 60;
pub const DEFAULT_CACHE_SYNC_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_METRICS_INTERVAL_SECS: u64 = 10;

#[derive(Debug, derive_more::Display)]
pub enum ConfigError {
    #[display("Failed to read config file {}", path.display())]
    Read { path: PathBuf },
    #[display("Failed to parse config file {}", path.display())]
    Parse { path: PathBuf },
    #[display("Invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

impl std::error::Error for ConfigError {}

#[derive(Parser, Clone, Debug)]
pub struct RunArgs {
    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "PARALLEL_EP_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "YAML file with controller settings; replaces the command line values"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        env = "PARALLEL_EP_METRICS_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Path for printing controller metrics, e.g. /logs/metrics.log"
    )]
    pub metrics_file: Option<PathBuf>,

    #[arg(long, env = "PARALLEL_EP_NAMESPACE", help = "Namespace to watch (empty for all namespaces)")]
    pub namespace: Option<String>,

    #[arg(long, default_value_t = DEFAULT_WORKERS, help = "Workers syncing Endpoints objects")]
    pub endpoint_workers: usize,

    #[arg(long, default_value_t = DEFAULT_WORKERS, help = "Workers syncing EndpointSlice objects")]
    pub endpointslice_workers: usize,

    #[arg(long, default_value_t = DEFAULT_MAX_ENDPOINTS_PER_SLICE, help = "Maximum endpoints per EndpointSlice (1-1000)")]
    pub max_endpoints_per_slice: usize,

    #[arg(long, default_value_t = DEFAULT_MAX_ENDPOINTS_CAPACITY, help = "Addresses kept in an Endpoints object before truncating")]
    pub max_endpoints_capacity: usize,

    #[arg(
        long,
        env = "PARALLEL_EP_TOPOLOGY_AWARE_ROUTING",
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Populate zone hints for Services that opt in"
    )]
    pub enable_topology_aware_routing: bool,

    #[arg(long, default_value_t = DEFAULT_RESYNC_INTERVAL_SECS, help = "Interval of the full resync of every Service")]
    pub resync_interval_secs: u64,

    #[arg(long, default_value_t = 0, help = "Delay coalescing Pod triggered syncs, 0 syncs immediately")]
    pub endpoint_updates_batch_period_ms: u64,

    #[arg(long, default_value_t = DEFAULT_WRITE_TIMEOUT_SECS, help = "Deadline of a single API write")]
    pub write_timeout_secs: u64,

    #[arg(long, default_value_t = DEFAULT_MIN_RETRY_DELAY_MS, help = "Initial per-key retry delay")]
    pub min_retry_delay_ms: u64,

    #[arg(long, default_value_t = DEFAULT_MAX_RETRY_DELAY_SECS, help = "Cap of the per-key retry delay")]
    pub max_retry_delay_secs: u64,

    #[arg(long, default_value_t = DEFAULT_STRUCTURAL_RETRY_DELAY_SECS, help = "Minimum delay before retrying a Service whose objects are rejected")]
    pub structural_retry_delay_secs: u64,

    #[arg(long, default_value_t = DEFAULT_CACHE_SYNC_TIMEOUT_SECS, help = "Time allowed for the initial cache sync")]
    pub cache_sync_timeout_secs: u64,

    #[arg(
        long,
        env = "PARALLEL_EP_METRICS_FORMAT",
        value_enum,
        default_value_t = MetricsFormat::Influx,
        help = "Metrics format"
    )]
    pub metrics_format: MetricsFormat,

    #[arg(long, default_value_t = DEFAULT_METRICS_INTERVAL_SECS, help = "Interval between metric flushes")]
    pub metrics_interval_secs: u64,
}

/// Tunables of both controllers after merging the command line and the
/// optional config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ControllerConfig {
    pub namespace: Option<String>,
    pub endpoint_workers: usize,
    pub endpointslice_workers: usize,
    pub max_endpoints_per_slice: usize,
    pub max_endpoints_capacity: usize,
    pub enable_topology_aware_routing: bool,
    pub resync_interval_secs: u64,
    pub endpoint_updates_batch_period_ms: u64,
    pub write_timeout_secs: u64,
    pub min_retry_delay_ms: u64,
    pub max_retry_delay_secs: u64,
    pub structural_retry_delay_secs: u64,
    pub cache_sync_timeout_secs: u64,
    pub metrics_format: MetricsFormat,
    pub metrics_interval_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            endpoint_workers: DEFAULT_WORKERS,
            endpointslice_workers: DEFAULT_WORKERS,
            max_endpoints_per_slice: DEFAULT_MAX_ENDPOINTS_PER_SLICE,
            max_endpoints_capacity: DEFAULT_MAX_ENDPOINTS_CAPACITY,
            enable_topology_aware_routing: true,
            resync_interval_secs: DEFAULT_RESYNC_INTERVAL_SECS,
            endpoint_updates_batch_period_ms: 0,
            write_timeout_secs: DEFAULT_WRITE_TIMEOUT_SECS,
            min_retry_delay_ms: DEFAULT_MIN_RETRY_DELAY_MS,
            max_retry_delay_secs: DEFAULT_MAX_RETRY_DELAY_SECS,
            structural_retry_delay_secs: DEFAULT_STRUCTURAL_RETRY_DELAY_SECS,
            cache_sync_timeout_secs: DEFAULT_CACHE_SYNC_TIMEOUT_SECS,
            metrics_format: MetricsFormat::Influx,
            metrics_interval_secs: DEFAULT_METRICS_INTERVAL_SECS,
        }
    }
}

impl From<&RunArgs> for ControllerConfig {
    fn from(args: &RunArgs) -> Self {
        Self {
            namespace: args.namespace.clone().filter(|ns| !ns.is_empty()),
            endpoint_workers: args.endpoint_workers,
            endpointslice_workers: args.endpointslice_workers,
            max_endpoints_per_slice: args.max_endpoints_per_slice,
            max_endpoints_capacity: args.max_endpoints_capacity,
            enable_topology_aware_routing: args.enable_topology_aware_routing,
            resync_interval_secs: args.resync_interval_secs,
            endpoint_updates_batch_period_ms: args.endpoint_updates_batch_period_ms,
            write_timeout_secs: args.write_timeout_secs,
            min_retry_delay_ms: args.min_retry_delay_ms,
            max_retry_delay_secs: args.max_retry_delay_secs,
            structural_retry_delay_secs: args.structural_retry_delay_secs,
            cache_sync_timeout_secs: args.cache_sync_timeout_secs,
            metrics_format: args.metrics_format,
            metrics_interval_secs: args.metrics_interval_secs,
        }
    }
}

impl RunArgs {
    /// The effective configuration: the config file when given, the command
    /// line otherwise. Fails on unreadable or invalid settings.
    pub fn resolve(&self) -> Result<ControllerConfig, Report<ConfigError>> {
        let config = match &self.config {
            Some(path) => ControllerConfig::from_file(path)?,
            None => ControllerConfig::from(self),
        };
        config.validate()?;
        Ok(config)
    }
}

impl ControllerConfig {
    pub fn from_file(path: &Path) -> Result<Self, Report<ConfigError>> {
        let content = std::fs::read_to_string(path).change_context(ConfigError::Read {
            path: path.to_path_buf(),
        })?;
        Self::from_yaml(&content).change_context(ConfigError::Parse {
            path: path.to_path_buf(),
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self, Report<serde_yaml::Error>> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), Report<ConfigError>> {
        let invalid = |field: &'static str, message: String| -> Result<(), Report<ConfigError>> {
            Err(Report::new(ConfigError::Invalid { field, message }))
        };

        if !(1..=MAX_ENDPOINTS_PER_SLICE_LIMIT).contains(&self.max_endpoints_per_slice) {
            return invalid(
                "maxEndpointsPerSlice",
                format!(
                    "{} is outside 1..={MAX_ENDPOINTS_PER_SLICE_LIMIT}",
                    self.max_endpoints_per_slice
                ),
            );
        }
        if self.max_endpoints_capacity == 0 {
            return invalid("maxEndpointsCapacity", "must be at least 1".to_string());
        }
        if self.endpoint_workers == 0 {
            return invalid("endpointWorkers", "must be at least 1".to_string());
        }
        if self.endpointslice_workers == 0 {
            return invalid("endpointsliceWorkers", "must be at least 1".to_string());
        }
        if self.min_retry_delay_ms == 0 {
            return invalid("minRetryDelayMs", "must be at least 1".to_string());
        }
        if self.min_retry_delay() > self.max_retry_delay() {
            return invalid(
                "maxRetryDelaySecs",
                format!(
                    "{:?} is below the minimum retry delay {:?}",
                    self.max_retry_delay(),
                    self.min_retry_delay()
                ),
            );
        }
        if self.resync_interval_secs == 0 {
            return invalid("resyncIntervalSecs", "must be at least 1".to_string());
        }
        if self.metrics_interval_secs == 0 {
            return invalid("metricsIntervalSecs", "must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn batch_period(&self) -> Duration {
        Duration::from_millis(self.endpoint_updates_batch_period_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn min_retry_delay(&self) -> Duration {
        Duration::from_millis(self.min_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.max_retry_delay_secs)
    }

    pub fn structural_retry_delay(&self) -> Duration {
        Duration::from_secs(self.structural_retry_delay_secs)
    }

    pub fn cache_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_sync_timeout_secs)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }
}
