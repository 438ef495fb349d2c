//! Exporter configuration.
//!
//! Every field has a default, so a configuration file only names what it changes.
//! CLI flags are applied on top with the `with_*` setters and the result is checked
//! with `validate()` before any sink is built.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone};
use conduit_packet::{FieldSpec, Template, TemplateError, MIN_TEMPLATE_ID};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Packets per message before the count trigger flushes.
pub const DEFAULT_MAX_PACKETS_PER_MESSAGE: usize = 10;
/// Hard bound of the pending batch.
pub const DEFAULT_PENDING_CAPACITY: usize = 1024;
/// Wall-clock age of the oldest batched packet before the time trigger flushes.
pub const DEFAULT_MAX_PACKET_LIFETIME_MS: u64 = 400;
/// Bounded queue between `receive` and the sink worker.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;
/// Longest `receive` blocks on a full queue before dropping.
pub const DEFAULT_ENQUEUE_TIMEOUT_MS: u64 = 100;
/// Collector port registered for IPFIX.
pub const DEFAULT_COLLECTOR_PORT: u16 = 4739;

/// Grace period between SIGTERM and SIGKILL.
pub const DEFAULT_SIG_KILL_TIMEOUT_SEC: u64 = 3;
/// Deadline for writing one PCAP record into the pipe.
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 1000;
/// Worker wakeup interval for liveness checks while idle.
pub const DEFAULT_LIVENESS_POLL_MS: u64 = 250;
/// Snapshot length announced in the PCAP global header.
pub const DEFAULT_SNAPLEN: u32 = 65535;

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("max_packets_per_message {max} exceeds pending_capacity {capacity}")]
    MessageExceedsCapacity { max: usize, capacity: usize },

    #[error("reader_cmd is empty")]
    EmptyCommand,

    #[error("invalid template: {0}")]
    Template(#[from] TemplateError),
}

/// One configured collector. The transport token is checked when the collector is added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorConfig {
    pub address: String,
    #[serde(default = "default_collector_port")]
    pub port: u16,
    #[serde(default = "default_transport")]
    pub transport: String,
}

fn default_collector_port() -> u16 {
    DEFAULT_COLLECTOR_PORT
}

fn default_transport() -> String {
    "UDP".to_string()
}

impl CollectorConfig {
    pub fn new(address: impl Into<String>, port: u16, transport: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port,
            transport: transport.into(),
        }
    }
}

/// Configuration of the batched protocol exporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_packets_per_message: usize,
    pub pending_capacity: usize,
    pub max_packet_lifetime_ms: u64,
    pub queue_capacity: usize,
    pub enqueue_timeout_ms: u64,
    pub observation_domain_id: u32,
    pub template_id: u16,
    /// Template fields; empty selects the IPv4 five-tuple.
    pub fields: Vec<FieldSpec>,
    pub collectors: Vec<CollectorConfig>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_packets_per_message: DEFAULT_MAX_PACKETS_PER_MESSAGE,
            pending_capacity: DEFAULT_PENDING_CAPACITY,
            max_packet_lifetime_ms: DEFAULT_MAX_PACKET_LIFETIME_MS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            enqueue_timeout_ms: DEFAULT_ENQUEUE_TIMEOUT_MS,
            observation_domain_id: 0,
            template_id: MIN_TEMPLATE_ID,
            fields: Vec::new(),
            collectors: Vec::new(),
        }
    }
}

impl BatchConfig {
    pub fn with_max_packets_per_message(mut self, max: usize) -> Self {
        self.max_packets_per_message = max;
        self
    }

    pub fn with_pending_capacity(mut self, capacity: usize) -> Self {
        self.pending_capacity = capacity;
        self
    }

    pub fn with_max_packet_lifetime_ms(mut self, lifetime_ms: u64) -> Self {
        self.max_packet_lifetime_ms = lifetime_ms;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_enqueue_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.enqueue_timeout_ms = timeout_ms;
        self
    }

    pub fn with_observation_domain_id(mut self, id: u32) -> Self {
        self.observation_domain_id = id;
        self
    }

    pub fn with_collector(mut self, collector: CollectorConfig) -> Self {
        self.collectors.push(collector);
        self
    }

    /// Build the configured template.
    pub fn template(&self) -> Result<Template, TemplateError> {
        if self.fields.is_empty() {
            Template::ipv4_five_tuple(self.template_id)
        } else {
            Template::new(self.template_id, self.fields.clone())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_packets_per_message == 0 {
            return Err(ConfigError::Zero("max_packets_per_message"));
        }
        if self.pending_capacity == 0 {
            return Err(ConfigError::Zero("pending_capacity"));
        }
        if self.max_packets_per_message > self.pending_capacity {
            return Err(ConfigError::MessageExceedsCapacity {
                max: self.max_packets_per_message,
                capacity: self.pending_capacity,
            });
        }
        if self.max_packet_lifetime_ms == 0 {
            return Err(ConfigError::Zero("max_packet_lifetime_ms"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("queue_capacity"));
        }
        self.template()?;
        Ok(())
    }
}

/// Configuration of the piped process exporter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeConfig {
    /// Reader command line, split on whitespace into program and arguments.
    pub reader_cmd: String,
    pub working_dir: Option<PathBuf>,
    /// File the reader's stdout and stderr are appended to.
    pub log_file: Option<PathBuf>,
    /// Suffix `log_file` with the spawn time.
    pub append_date: bool,
    pub sig_kill_timeout_sec: u64,
    pub restart_on_signal: bool,
    /// Restart period in packet-timestamp seconds; 0 disables.
    pub restart_interval_sec: u64,
    pub write_timeout_ms: u64,
    pub liveness_poll_ms: u64,
    pub snaplen: u32,
    pub queue_capacity: usize,
    pub enqueue_timeout_ms: u64,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            reader_cmd: String::new(),
            working_dir: None,
            log_file: None,
            append_date: false,
            sig_kill_timeout_sec: DEFAULT_SIG_KILL_TIMEOUT_SEC,
            restart_on_signal: true,
            restart_interval_sec: 0,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            liveness_poll_ms: DEFAULT_LIVENESS_POLL_MS,
            snaplen: DEFAULT_SNAPLEN,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            enqueue_timeout_ms: DEFAULT_ENQUEUE_TIMEOUT_MS,
        }
    }
}

impl PipeConfig {
    pub fn new(reader_cmd: impl Into<String>) -> Self {
        Self {
            reader_cmd: reader_cmd.into(),
            ..Self::default()
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>, append_date: bool) -> Self {
        self.log_file = Some(path.into());
        self.append_date = append_date;
        self
    }

    pub fn with_sig_kill_timeout_sec(mut self, secs: u64) -> Self {
        self.sig_kill_timeout_sec = secs;
        self
    }

    pub fn with_restart_on_signal(mut self, enabled: bool) -> Self {
        self.restart_on_signal = enabled;
        self
    }

    pub fn with_restart_interval_sec(mut self, secs: u64) -> Self {
        self.restart_interval_sec = secs;
        self
    }

    pub fn with_write_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.write_timeout_ms = timeout_ms;
        self
    }

    pub fn with_liveness_poll_ms(mut self, poll_ms: u64) -> Self {
        self.liveness_poll_ms = poll_ms;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_enqueue_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.enqueue_timeout_ms = timeout_ms;
        self
    }

    /// Log file path for a reader spawned at `now`.
    ///
    /// With `append_date`, `reader.log` becomes `reader-20240101-120000.log`.
    pub fn log_file_path<Tz>(&self, now: &DateTime<Tz>) -> Option<PathBuf>
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        let path = self.log_file.as_ref()?;
        if !self.append_date {
            return Some(path.clone());
        }
        let stamp = now.format("%Y%m%d-%H%M%S");
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = match path.extension() {
            Some(ext) => format!("{stem}-{stamp}.{}", ext.to_string_lossy()),
            None => format!("{stem}-{stamp}"),
        };
        Some(path.with_file_name(name))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reader_cmd.split_whitespace().next().is_none() {
            return Err(ConfigError::EmptyCommand);
        }
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::Zero("write_timeout_ms"));
        }
        if self.liveness_poll_ms == 0 {
            return Err(ConfigError::Zero("liveness_poll_ms"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("queue_capacity"));
        }
        Ok(())
    }
}

/// Configuration file contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConduitConfig {
    pub batch: BatchConfig,
    pub pipe: PipeConfig,
}

impl ConduitConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }
}
