use std::{path::Path, sync::Arc, time::Duration};

use anyhow::Context as _;
use regex::Regex;
use relay_aggregator::{AggregatorConfiguration, AggregatorSet, DEFAULT_TICK_INTERVAL};
use relay_app::{config::ConfigurationLoader, GenericError};
use serde::Deserialize;

use crate::router::{Route, Router};

/// Prefix of environment variables overriding file configuration.
pub const ENV_PREFIX: &str = "RELAY";

const fn default_tick_interval_ms() -> u64 {
    DEFAULT_TICK_INTERVAL.as_millis() as u64
}

const fn default_output_queue_size() -> usize {
    8192
}

/// An aggregator, and the expressions selecting which metrics are routed to it.
#[derive(Clone, Debug, Deserialize)]
pub struct RouteConfiguration {
    /// Regular expressions matched against metric names. The first matching expression's capture groups are available
    /// to the aggregator's output name templates.
    #[serde(rename = "match")]
    pub patterns: Vec<String>,

    #[serde(flatten)]
    pub aggregator: AggregatorConfiguration,
}

/// Relay configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct RelayConfiguration {
    /// Aggregators, in routing order.
    #[serde(default)]
    pub aggregators: Vec<RouteConfiguration>,

    /// Interval between aggregator worker wakeups, in milliseconds.
    ///
    /// Defaults to 1000.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Capacity of the queue between aggregators and standard output.
    #[serde(default = "default_output_queue_size")]
    pub output_queue_size: usize,
}

impl RelayConfiguration {
    /// Loads the configuration from the given YAML file, with `RELAY_*` environment variables taking precedence.
    pub fn load(path: &Path) -> Result<Self, GenericError> {
        let config = ConfigurationLoader::default()
            .from_yaml(path)
            .with_context(|| format!("Failed to load configuration file '{}'.", path.display()))?
            .from_environment(ENV_PREFIX)?
            .into_typed::<Self>()?;
        Ok(config)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// Builds the aggregators and the routing table dispatching to them.
    pub fn build(&self) -> Result<(Router, AggregatorSet), GenericError> {
        let mut aggregators = Vec::with_capacity(self.aggregators.len());
        let mut patterns = Vec::with_capacity(self.aggregators.len());

        for (idx, route) in self.aggregators.iter().enumerate() {
            let aggregator = route
                .aggregator
                .build()
                .with_context(|| format!("Invalid configuration for aggregator #{}.", idx))?;

            let route_patterns = route
                .patterns
                .iter()
                .map(|pattern| {
                    Regex::new(pattern).with_context(|| format!("Invalid match expression '{}'.", pattern))
                })
                .collect::<Result<Vec<_>, _>>()?;
            if route_patterns.is_empty() {
                anyhow::bail!("Aggregator #{} has no match expressions.", idx);
            }

            aggregators.push(aggregator);
            patterns.push(route_patterns);
        }

        let set = AggregatorSet::new(aggregators);
        let routes = set
            .aggregators()
            .iter()
            .zip(patterns)
            .map(|(aggregator, patterns)| Route::new(patterns, Arc::clone(aggregator)))
            .collect();

        Ok((Router::new(routes), set))
    }
}
