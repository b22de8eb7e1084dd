//! Configuration of a simulation, in code or as a declarative fixture.

use crate::{
    filter::{Factory, Registry},
    validator, Error,
};
use faultline_agreement::NodeId;
use prometheus_client::registry::Registry as Metrics;
use serde::Deserialize;
use serde_json::Value;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{debug, Level};

/// Default wall-clock duration of a tick.
pub const DEFAULT_TICK_GRANULARITY: Duration = Duration::from_millis(100);

/// Verbosity of the logs emitted during a simulation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawLevel")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// Levels are given by name or by their legacy numeric value (`0..=2` error, `3` warn, `4` info,
/// `5` debug, `6` trace).
#[derive(Deserialize)]
#[serde(untagged)]
enum RawLevel {
    Name(String),
    Legacy(u8),
}

impl TryFrom<RawLevel> for LogLevel {
    type Error = String;

    fn try_from(value: RawLevel) -> Result<Self, String> {
        match value {
            RawLevel::Name(name) => match name.to_ascii_lowercase().as_str() {
                "trace" => Ok(Self::Trace),
                "debug" => Ok(Self::Debug),
                "info" => Ok(Self::Info),
                "warn" | "warning" => Ok(Self::Warn),
                "error" | "fatal" | "panic" => Ok(Self::Error),
                _ => Err(format!("unknown log level: {name}")),
            },
            RawLevel::Legacy(level) => match level {
                0..=2 => Ok(Self::Error),
                3 => Ok(Self::Warn),
                4 => Ok(Self::Info),
                5 => Ok(Self::Debug),
                6 => Ok(Self::Trace),
                _ => Err(format!("unknown log level: {level}")),
            },
        }
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

/// Everything needed to build a [crate::network::Network].
#[derive(Clone, Debug)]
pub struct FuzzerConfig {
    /// Name of the simulation (used in logs).
    pub name: String,
    /// Number of nodes.
    pub nodes: u32,
    /// Whether each node holds stake. Empty means every node does.
    pub online: Vec<bool>,
    /// Factories of every node's filter chain, in chain order.
    pub filters: Vec<Arc<dyn Factory>>,
    pub log_level: LogLevel,
    /// Suppress per-message trace events.
    pub disable_traces: bool,
    /// Wall-clock duration of a tick.
    pub tick_granularity: Duration,
    /// Seed of every randomized filter.
    pub seed: u64,
    /// Registry network metrics are registered in.
    pub metrics: Option<Arc<Mutex<Metrics>>>,
}

impl FuzzerConfig {
    pub fn new(name: impl Into<String>, nodes: u32) -> Self {
        Self {
            name: name.into(),
            nodes,
            online: Vec::new(),
            filters: Vec::new(),
            log_level: LogLevel::default(),
            disable_traces: false,
            tick_granularity: DEFAULT_TICK_GRANULARITY,
            seed: 0,
            metrics: None,
        }
    }

    /// Append a filter to every node's chain.
    pub fn with_filter(self, factory: impl Factory) -> Self {
        self.with_factory(Arc::new(factory))
    }

    /// Append a shared filter factory to every node's chain.
    pub fn with_factory(mut self, factory: Arc<dyn Factory>) -> Self {
        self.filters.push(factory);
        self
    }

    pub fn with_online(mut self, online: Vec<bool>) -> Self {
        self.online = online;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_tick_granularity(mut self, tick_granularity: Duration) -> Self {
        self.tick_granularity = tick_granularity;
        self
    }

    pub fn with_metrics(mut self, registry: Arc<Mutex<Metrics>>) -> Self {
        self.metrics = Some(registry);
        self
    }

    /// Check the configuration and return whether each node holds stake.
    pub fn validate(&self) -> Result<Vec<bool>, Error> {
        if self.nodes == 0 {
            return Err(Error::NoNodes);
        }
        let nodes = self.nodes as usize;
        if self.online.is_empty() {
            return Ok(vec![true; nodes]);
        }
        if self.online.len() != nodes {
            return Err(Error::InvalidOnlineNodes {
                expected: nodes,
                found: self.online.len(),
            });
        }
        Ok(self.online.clone())
    }

    /// Whether `node` holds stake.
    pub fn is_online(&self, node: NodeId) -> bool {
        self.online.is_empty() || self.online.get(node as usize).copied().unwrap_or(false)
    }
}

/// Declarative description of a simulation and its validation.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Fixture {
    pub fuzzer_name: String,
    pub nodes_count: u32,
    #[serde(default)]
    pub online_nodes: Vec<bool>,
    /// Filter blobs, resolved through a [Registry].
    #[serde(default)]
    pub filters: Vec<Value>,
    pub validator: validator::Config,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub disable_traces: bool,
}

impl Fixture {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    /// Build the [FuzzerConfig] described by the fixture.
    ///
    /// Returns `None` if one of the filters is not recognized by `registry`.
    pub fn resolve(&self, registry: &Registry) -> Result<Option<FuzzerConfig>, Error> {
        let filters = match registry.parse_all(&self.filters) {
            Ok(filters) => filters,
            Err(Error::UnrecognizedFilter(name)) => {
                debug!(fixture = %self.fuzzer_name, filter = %name, "skipping fixture");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        let config = FuzzerConfig {
            name: self.fuzzer_name.clone(),
            nodes: self.nodes_count,
            online: self.online_nodes.clone(),
            filters,
            log_level: self.log_level,
            disable_traces: self.disable_traces,
            ..FuzzerConfig::new(self.fuzzer_name.clone(), self.nodes_count)
        };
        config.validate()?;
        Ok(Some(config))
    }
}
