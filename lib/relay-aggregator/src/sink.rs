//! Output sinks for emitted aggregate lines.

use std::fmt::Write as _;

use crossbeam_queue::ArrayQueue;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::DropReason;

/// Why a line could not be handed to an output sink.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SinkError {
    /// The sink has no room left.
    Full,

    /// The sink's consumer is gone.
    Closed,
}

impl SinkError {
    pub(crate) const fn drop_reason(&self) -> DropReason {
        match self {
            Self::Full => DropReason::SinkFull,
            Self::Closed => DropReason::SinkClosed,
        }
    }
}

/// A destination for emitted aggregate lines.
///
/// Sinks are called from ingestion threads and from the aggregator worker, so `try_send` must never block: a sink that
/// cannot take a line right away rejects it, and the line is counted as dropped.
pub trait OutputSink: Send + Sync {
    /// Hands a formatted line, including its trailing newline, to the sink.
    fn try_send(&self, line: String) -> Result<(), SinkError>;
}

impl OutputSink for mpsc::Sender<String> {
    fn try_send(&self, line: String) -> Result<(), SinkError> {
        mpsc::Sender::try_send(self, line).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::Full,
            TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

impl OutputSink for ArrayQueue<String> {
    fn try_send(&self, line: String) -> Result<(), SinkError> {
        self.push(line).map_err(|_| SinkError::Full)
    }
}

/// Renders an output line of the form `<name> <value> <timestamp>\n`.
///
/// Values use the shortest representation that round-trips, which renders integral values without a fractional part.
pub fn format_line(name: &str, value: f64, timestamp: i64) -> String {
    let mut line = String::with_capacity(name.len() + 32);
    // Writing to a `String` cannot fail.
    let _ = writeln!(line, "{} {} {}", name, value, timestamp);
    line
}
