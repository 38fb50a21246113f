use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::template::PathTemplate;

/// Top-level configuration for the ingestor. Immutable after load.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Address the UDP receiver binds to. Default: "0.0.0.0:33333".
    #[serde(default = "default_udp_address")]
    pub udp_address: String,

    /// Downstream sink URL, scheme "tcp" or "file".
    /// Default: "tcp://127.0.0.1:3002".
    #[serde(default = "default_sink_target")]
    pub sink_target: String,

    /// Whether incoming datagrams are gzip-encoded. Default: true.
    #[serde(default = "default_true")]
    pub gzip: bool,

    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Per-source-IP rate limiting.
    #[serde(default)]
    pub per_ip_rate_limit: RateLimitConfig,

    /// Whether internal counters are fed back through the pipeline.
    /// Default: true.
    #[serde(default = "default_true")]
    pub monitoring_enabled: bool,

    /// Path template for self-metrics. Default: "pirate.{metric.name}".
    #[serde(default = "default_monitoring_template")]
    pub monitoring_template: String,

    /// Compiled form of `monitoring_template`.
    #[serde(skip)]
    pub monitoring: PathTemplate,

    /// Declarative schemas keyed by project id.
    #[serde(default)]
    pub projects: HashMap<String, ProjectConfig>,
}

/// Per-source-IP rate limit settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Packets allowed per window. Default: 100.
    #[serde(default = "default_rate_amount")]
    pub amount: u64,

    /// Window length. Default: 1m.
    #[serde(default = "default_rate_interval", with = "humantime_serde")]
    pub interval: Duration,
}

/// Schema for one project: a default sink path plus the allowed attribute
/// and metric keys.
#[derive(Debug, Deserialize)]
pub struct ProjectConfig {
    /// Default path template for metrics of this project.
    #[serde(default)]
    pub graphite_path: String,

    #[serde(skip)]
    pub template: PathTemplate,

    /// Allowed header attributes, each bound to a validation regex.
    #[serde(default)]
    pub attributes: HashMap<String, String>,

    #[serde(skip)]
    pub patterns: HashMap<String, Regex>,

    /// Allowed metric keys and their bounds.
    #[serde(default)]
    pub metrics: HashMap<String, MetricConfig>,
}

/// Bounds and path override for one metric key.
#[derive(Debug, Deserialize)]
pub struct MetricConfig {
    /// Path template override; falls back to the project template.
    #[serde(default)]
    pub graphite_path: String,

    #[serde(skip)]
    pub template: PathTemplate,

    #[serde(default)]
    pub min: f64,

    #[serde(default)]
    pub max: f64,
}

// --- Default value functions ---

fn default_udp_address() -> String {
    "0.0.0.0:33333".to_string()
}

fn default_sink_target() -> String {
    "tcp://127.0.0.1:3002".to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_monitoring_template() -> String {
    "pirate.{metric.name}".to_string()
}

fn default_rate_amount() -> u64 {
    100
}

fn default_rate_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            amount: default_rate_amount(),
            interval: default_rate_interval(),
        }
    }
}

// --- Loading, compilation and validation ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Parse configuration from YAML text, compiling templates and regexes.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let mut cfg: Config = serde_yaml::from_str(data).context("parsing YAML")?;

        cfg.compile()?;
        cfg.validate()?;

        Ok(cfg)
    }

    /// Compile all path templates and attribute regexes in place.
    fn compile(&mut self) -> Result<()> {
        self.monitoring = PathTemplate::parse(&self.monitoring_template)
            .context("invalid path for monitoring_template")?;

        for (pid, project) in &mut self.projects {
            project.template = PathTemplate::parse(&project.graphite_path)
                .with_context(|| format!("invalid path for projects.{pid}.graphite_path"))?;

            for (aid, pattern) in &project.attributes {
                let regex = Regex::new(pattern).with_context(|| {
                    format!("invalid regexp for projects.{pid}.attributes.{aid}")
                })?;
                project.patterns.insert(aid.clone(), regex);
            }

            for (mid, metric) in &mut project.metrics {
                // A metric without its own path uses the project template.
                if metric.graphite_path.is_empty() {
                    metric.graphite_path = project.graphite_path.clone();
                    metric.template = project.template.clone();
                } else {
                    metric.template = PathTemplate::parse(&metric.graphite_path).with_context(
                        || format!("invalid path for projects.{pid}.metrics.{mid}.graphite_path"),
                    )?;
                }
            }
        }

        Ok(())
    }

    /// Validate cross-field constraints.
    fn validate(&self) -> Result<()> {
        for (pid, project) in &self.projects {
            // "project" is the reserved routing key and may not be shadowed
            // by a declared attribute.
            if project.attributes.contains_key("project") {
                bail!(r#"projects.{pid}.attributes must not declare the reserved key "project""#);
            }
        }

        Ok(())
    }

    /// Dump the effective configuration at debug level.
    pub fn log_summary(&self) {
        debug!(udp_address = %self.udp_address, "config: UDP address");
        debug!(sink_target = %self.sink_target, "config: sink target");
        debug!(
            enabled = self.per_ip_rate_limit.enabled,
            amount = self.per_ip_rate_limit.amount,
            interval = ?self.per_ip_rate_limit.interval,
            "config: per-IP rate limit",
        );

        for (pid, project) in &self.projects {
            debug!(project = %pid, "config: project");

            for (mid, metric) in &project.metrics {
                debug!(
                    project = %pid,
                    metric = %mid,
                    min = metric.min,
                    max = metric.max,
                    path = %metric.graphite_path,
                    "config: metric",
                );
            }
        }
    }
}
