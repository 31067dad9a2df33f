use std::{ops::Range, sync::Arc};

use regex::Regex;
use relay_aggregator::Aggregator;

/// An aggregator and the expressions selecting the metrics routed to it.
pub struct Route {
    patterns: Vec<Regex>,
    aggregator: Arc<Aggregator>,
}

impl Route {
    pub fn new(patterns: Vec<Regex>, aggregator: Arc<Aggregator>) -> Self {
        Self { patterns, aggregator }
    }
}

/// Dispatches plaintext metric lines to aggregators.
///
/// Each line's metric name is matched against every route in order, and the line goes to the first route with a
/// matching expression, along with the capture group offsets of that match.
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Routes a single `<name> <value> [<timestamp>]` line.
    ///
    /// Returns `true` if the line was handed to an aggregator.
    pub fn route(&self, line: &str) -> bool {
        let line = line.trim_end_matches(['\r', '\n']);
        let Some(first_space) = line.find(' ') else {
            return false;
        };
        let name = &line[..first_space];

        for route in &self.routes {
            for pattern in &route.patterns {
                if let Some(captures) = pattern.captures(name) {
                    let offsets = captures
                        .iter()
                        .map(|group| group.map(|m| m.range()))
                        .collect::<Vec<Option<Range<usize>>>>();
                    route.aggregator.put_metric(line, first_space, &offsets);
                    return true;
                }
            }
        }

        false
    }
}
