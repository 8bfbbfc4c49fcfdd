//! The incremental synchronization loop.
//!
//! Each cycle fetches one snapshot, decodes every stream, and publishes the streams
//! whose marker moved since the last confirmed delivery. Watermarks advance per
//! stream, only once the sink policy accepts that stream's delivery.

use crate::client::{EcobeeClientError, SnapshotSource};
use crate::models::ecobee::DecodeError;
use crate::records::{self, RecordOptions};
use crate::retry::RetryPolicy;
use crate::sinks::Publisher;
use crate::watermark::{Stream, Watermarks};
use chrono::Utc;
use core::fmt;
use log::{debug, error, info, warn};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub enum CycleError {
    Fetch(EcobeeClientError),
    Decode(DecodeError),
    /// Streams the sink policy did not accept; their watermarks did not move.
    Undelivered(Vec<Stream>),
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleError::Fetch(e) => write!(f, "fetching snapshot failed: {}", e),
            CycleError::Decode(e) => write!(f, "decoding snapshot failed: {}", e),
            CycleError::Undelivered(streams) => {
                let names = streams.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ");
                write!(f, "not delivered: {}", names)
            }
        }
    }
}

impl std::error::Error for CycleError {}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Stream and number of records delivered.
    pub published: Vec<(Stream, usize)>,
    /// Streams with nothing new.
    pub unchanged: Vec<Stream>,
}

impl CycleReport {
    pub fn records_published(&self) -> usize {
        self.published.iter().map(|(_, n)| n).sum()
    }
}

pub struct Engine<'a, S: SnapshotSource> {
    source: &'a S,
    publisher: &'a Publisher,
    thermostat_id: String,
    options: RecordOptions,
    cycle_retry: RetryPolicy,
}

impl<'a, S: SnapshotSource> Engine<'a, S> {
    pub fn new(
        source: &'a S,
        publisher: &'a Publisher,
        thermostat_id: impl Into<String>,
        options: RecordOptions,
        cycle_retry: RetryPolicy,
    ) -> Self {
        Engine {
            source,
            publisher,
            thermostat_id: thermostat_id.into(),
            options,
            cycle_retry,
        }
    }

    /// One fetch, decode and publish pass. Every new stream is attempted even when
    /// an earlier one fails; any undelivered stream makes the cycle an error.
    pub fn run_cycle(&self, watermarks: &mut Watermarks) -> Result<CycleReport, CycleError> {
        let snapshot = self
            .source
            .fetch_snapshot(&self.thermostat_id)
            .map_err(CycleError::Fetch)?;
        info!(
            "latest runtime interval available is {}",
            snapshot.extended_runtime.runtime_interval
        );

        let batches = records::plan(&snapshot, &self.options, Utc::now()).map_err(CycleError::Decode)?;

        let mut report = CycleReport::default();
        let mut undelivered = Vec::new();
        for batch in batches {
            if !batch.always_publish && !watermarks.should_publish(batch.stream, batch.marker) {
                debug!("{}: nothing new (still at {})", batch.stream, batch.marker);
                report.unchanged.push(batch.stream);
                continue;
            }

            let delivery = self.publisher.publish(batch.stream, &batch.records);
            if delivery.satisfies(self.publisher.policy()) {
                watermarks.advance(batch.stream, batch.marker);
                info!(
                    "{}: published {} record(s) at {} to {}",
                    batch.stream,
                    batch.records.len(),
                    batch.marker,
                    delivery.accepted.join(", ")
                );
                report.published.push((batch.stream, batch.records.len()));
            } else {
                let failed = delivery
                    .failed
                    .iter()
                    .map(|(name, e)| format!("{} ({})", name, e))
                    .collect::<Vec<_>>()
                    .join("; ");
                warn!(
                    "{}: delivery did not satisfy sink policy '{}', watermark stays at {}: {}",
                    batch.stream,
                    self.publisher.policy(),
                    watermarks
                        .get(batch.stream)
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| "never published".to_string()),
                    failed
                );
                undelivered.push(batch.stream);
            }
        }

        if undelivered.is_empty() {
            Ok(report)
        } else {
            Err(CycleError::Undelivered(undelivered))
        }
    }

    /// A cycle under the outer retry budget. Streams delivered by a failed attempt
    /// are not republished by the next one.
    pub fn sync_once(&self, watermarks: &mut Watermarks) -> Result<CycleReport, CycleError> {
        self.cycle_retry
            .run("sync cycle", |_attempt| self.run_cycle(&mut *watermarks))
    }

    /// Cycles forever at a fixed cadence measured from each cycle's start.
    pub fn run_loop(&self, interval: Duration) -> ! {
        let mut watermarks = Watermarks::new();
        loop {
            let tick_start = Instant::now();

            match self.sync_once(&mut watermarks) {
                Ok(report) => debug!(
                    "Cycle complete: {} record(s) published, {} stream(s) unchanged",
                    report.records_published(),
                    report.unchanged.len()
                ),
                Err(e) => error!("Sync cycle gave up until the next tick: {}", e),
            }

            // Maintain steady cadence
            let elapsed = tick_start.elapsed();
            if elapsed < interval {
                thread::sleep(interval - elapsed);
            }
        }
    }
}
