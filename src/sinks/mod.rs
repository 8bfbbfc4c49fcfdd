//! Downstream sinks and the fan-out publisher.
//!
//! The engine only knows about [`Sink`]. Concrete backends implement one of the two
//! narrow capabilities, [`TimeSeriesSink`] or [`MessageBusSink`], and are wrapped in
//! the matching adapter which owns the record-to-wire mapping.

pub mod mqtt;
pub mod timescale;

use crate::retry::{Attempt, RetryPolicy};
use crate::watermark::Stream;
use chrono::{DateTime, Utc};
use core::fmt;
use log::{debug, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::error::Error;
use std::str::FromStr;
use std::thread;

// =====================
// Records
// =====================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Text(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::Bool(v) => write!(f, "{}", v),
            FieldValue::Text(v) => f.write_str(v),
        }
    }
}

/// One normalized observation, ready for any sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Time-series measurement name, e.g. `ecobee_runtime`.
    pub measurement: &'static str,
    /// Message-bus topic segment, e.g. `runtime` or `sensor/rs:100`.
    pub category: String,
    pub time: DateTime<Utc>,
    pub tags: BTreeMap<&'static str, String>,
    pub fields: BTreeMap<&'static str, FieldValue>,
}

// =====================
// Errors
// =====================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    Connection(String),
    Write(String),
    Timeout(String),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::Connection(s) => write!(f, "connection error: {}", s),
            SinkError::Write(s) => write!(f, "write error: {}", s),
            SinkError::Timeout(s) => write!(f, "timed out: {}", s),
        }
    }
}

impl Error for SinkError {}

// =====================
// Capabilities
// =====================

/// Stores points addressed by measurement, tags and time.
pub trait TimeSeriesSink: Send + Sync {
    fn name(&self) -> &str;

    fn write_points(&self, points: &[Record], attempt: Attempt) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
}

/// Publishes plain-text payloads to topics.
pub trait MessageBusSink: Send + Sync {
    fn name(&self) -> &str;

    fn publish(&self, messages: &[BusMessage], attempt: Attempt) -> Result<(), SinkError>;
}

/// What the publisher fans out to.
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    fn write(&self, records: &[Record], attempt: Attempt) -> Result<(), SinkError>;
}

pub struct TimeSeries<S> {
    inner: S,
}

impl<S: TimeSeriesSink> TimeSeries<S> {
    pub fn new(inner: S) -> Self {
        TimeSeries { inner }
    }
}

impl<S: TimeSeriesSink> Sink for TimeSeries<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn write(&self, records: &[Record], attempt: Attempt) -> Result<(), SinkError> {
        self.inner.write_points(records, attempt)
    }
}

/// Flattens each record into one message per field under
/// `{root}/{thermostat_id}/{category}/{field}`.
pub struct MessageBus<S> {
    inner: S,
    topic_root: String,
    thermostat_id: String,
}

impl<S: MessageBusSink> MessageBus<S> {
    pub fn new(inner: S, topic_root: impl Into<String>, thermostat_id: impl Into<String>) -> Self {
        MessageBus {
            inner,
            topic_root: topic_root.into().trim_end_matches('/').to_string(),
            thermostat_id: thermostat_id.into(),
        }
    }

    pub fn messages(&self, records: &[Record]) -> Vec<BusMessage> {
        records
            .iter()
            .flat_map(|record| {
                record.fields.iter().map(move |(field, value)| BusMessage {
                    topic: format!(
                        "{}/{}/{}/{}",
                        self.topic_root, self.thermostat_id, record.category, field
                    ),
                    payload: value.to_string(),
                })
            })
            .collect()
    }
}

impl<S: MessageBusSink> Sink for MessageBus<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn write(&self, records: &[Record], attempt: Attempt) -> Result<(), SinkError> {
        self.inner.publish(&self.messages(records), attempt)
    }
}

// =====================
// Fan-out
// =====================

/// When a stream counts as delivered, and so when its watermark may advance.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum SinkPolicy {
    /// At least one enabled sink accepted the records.
    #[default]
    RequireAny,
    /// Every enabled sink accepted the records.
    RequireAll,
}

impl FromStr for SinkPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" => Ok(SinkPolicy::RequireAny),
            "all" => Ok(SinkPolicy::RequireAll),
            other => Err(format!("unknown sink policy '{}' (expected any or all)", other)),
        }
    }
}

impl fmt::Display for SinkPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkPolicy::RequireAny => f.write_str("any"),
            SinkPolicy::RequireAll => f.write_str("all"),
        }
    }
}

/// Per-sink outcome of one publish.
#[derive(Debug, Default)]
pub struct Delivery {
    pub accepted: Vec<String>,
    pub failed: Vec<(String, SinkError)>,
}

impl Delivery {
    pub fn satisfies(&self, policy: SinkPolicy) -> bool {
        match policy {
            SinkPolicy::RequireAny => !self.accepted.is_empty(),
            SinkPolicy::RequireAll => self.failed.is_empty(),
        }
    }
}

struct Target {
    sink: Box<dyn Sink>,
    retry: RetryPolicy,
}

pub struct Publisher {
    targets: Vec<Target>,
    policy: SinkPolicy,
}

impl Publisher {
    pub fn new(policy: SinkPolicy) -> Self {
        Publisher {
            targets: Vec::new(),
            policy,
        }
    }

    /// Adds a sink with its own retry budget.
    pub fn with_sink(mut self, sink: Box<dyn Sink>, retry: RetryPolicy) -> Self {
        self.targets.push(Target { sink, retry });
        self
    }

    pub fn policy(&self) -> SinkPolicy {
        self.policy
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.targets.iter().map(|t| t.sink.name()).collect()
    }

    /// Writes `records` to every sink concurrently, each under its own retry budget.
    /// A failing sink never affects what the others receive.
    pub fn publish(&self, stream: Stream, records: &[Record]) -> Delivery {
        let mut delivery = Delivery::default();
        if records.is_empty() {
            delivery.accepted = self.targets.iter().map(|t| t.sink.name().to_string()).collect();
            return delivery;
        }

        let outcomes: Vec<(String, Result<(), SinkError>)> = thread::scope(|scope| {
            let handles: Vec<_> = self
                .targets
                .iter()
                .map(|target| {
                    let handle = scope.spawn(move || {
                        let label = format!("publish {} to {}", stream, target.sink.name());
                        target.retry.run(&label, |attempt| target.sink.write(records, attempt))
                    });
                    (target.sink.name().to_string(), handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(name, handle)| {
                    let result = handle
                        .join()
                        .unwrap_or_else(|_| Err(SinkError::Write("publisher thread panicked".to_string())));
                    (name, result)
                })
                .collect()
        });

        for (name, result) in outcomes {
            match result {
                Ok(()) => {
                    debug!("{}: {} record(s) accepted by {}", stream, records.len(), name);
                    delivery.accepted.push(name);
                }
                Err(e) => {
                    warn!("{}: sink {} failed after retries: {}", stream, name, e);
                    delivery.failed.push((name, e));
                }
            }
        }
        delivery
    }
}

#[cfg(test)]
pub mod testing {
    //! In-memory sinks for engine tests.

    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingSink {
        pub name: String,
        pub written: Mutex<Vec<Record>>,
        pub calls: Mutex<u32>,
        /// Number of leading calls that fail before writes succeed.
        pub fail_first: u32,
        pub always_fail: bool,
    }

    impl RecordingSink {
        pub fn named(name: &str) -> Self {
            RecordingSink {
                name: name.to_string(),
                ..Default::default()
            }
        }

        pub fn failing(name: &str) -> Self {
            RecordingSink {
                always_fail: true,
                ..Self::named(name)
            }
        }

        pub fn records(&self) -> Vec<Record> {
            self.written.lock().unwrap().clone()
        }

        pub fn call_count(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    impl TimeSeriesSink for RecordingSink {
        fn name(&self) -> &str {
            &self.name
        }

        fn write_points(&self, points: &[Record], _attempt: Attempt) -> Result<(), SinkError> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if self.always_fail || *calls <= self.fail_first {
                return Err(SinkError::Connection(format!("{} unavailable", self.name)));
            }
            self.written.lock().unwrap().extend_from_slice(points);
            Ok(())
        }
    }

    impl TimeSeriesSink for std::sync::Arc<RecordingSink> {
        fn name(&self) -> &str {
            self.as_ref().name()
        }

        fn write_points(&self, points: &[Record], attempt: Attempt) -> Result<(), SinkError> {
            self.as_ref().write_points(points, attempt)
        }
    }

    #[derive(Default)]
    pub struct RecordingBus {
        pub published: Mutex<Vec<BusMessage>>,
    }

    impl MessageBusSink for RecordingBus {
        fn name(&self) -> &str {
            "bus"
        }

        fn publish(&self, messages: &[BusMessage], _attempt: Attempt) -> Result<(), SinkError> {
            self.published.lock().unwrap().extend_from_slice(messages);
            Ok(())
        }
    }

    impl MessageBusSink for std::sync::Arc<RecordingBus> {
        fn name(&self) -> &str {
            self.as_ref().name()
        }

        fn publish(&self, messages: &[BusMessage], attempt: Attempt) -> Result<(), SinkError> {
            self.as_ref().publish(messages, attempt)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{RecordingBus, RecordingSink};
    use super::*;
    use chrono::TimeZone;
    use std::num::NonZeroU32;
    use std::sync::Arc;
    use std::time::Duration;

    fn retry(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(NonZeroU32::new(attempts).unwrap(), Duration::ZERO, Duration::from_secs(1))
    }

    fn record(category: &str) -> Record {
        let mut fields = BTreeMap::new();
        fields.insert("temperature", FieldValue::Float(70.5));
        fields.insert("occupied", FieldValue::Bool(true));
        let mut tags = BTreeMap::new();
        tags.insert("thermostat_name", "Hallway".to_string());
        Record {
            measurement: "ecobee_sensor",
            category: category.to_string(),
            time: Utc.with_ymd_and_hms(2024, 1, 15, 13, 7, 41).unwrap(),
            tags,
            fields,
        }
    }

    #[test]
    fn field_values_render_as_plain_text() {
        assert_eq!(FieldValue::Float(70.5).to_string(), "70.5");
        assert_eq!(FieldValue::Int(-3).to_string(), "-3");
        assert_eq!(FieldValue::Bool(false).to_string(), "false");
        assert_eq!(FieldValue::Text("heatOff".into()).to_string(), "heatOff");
    }

    #[test]
    fn message_bus_topics_are_per_field() {
        let bus = MessageBus::new(RecordingBus::default(), "ecobee/", "318324702718");
        let messages = bus.messages(&[record("sensor/rs:100")]);
        assert_eq!(
            messages,
            vec![
                BusMessage {
                    topic: "ecobee/318324702718/sensor/rs:100/occupied".to_string(),
                    payload: "true".to_string(),
                },
                BusMessage {
                    topic: "ecobee/318324702718/sensor/rs:100/temperature".to_string(),
                    payload: "70.5".to_string(),
                },
            ]
        );
    }

    #[test]
    fn failing_sink_does_not_block_the_others() {
        let good = Arc::new(RecordingSink::named("good"));
        let bad = Arc::new(RecordingSink::failing("bad"));
        let publisher = Publisher::new(SinkPolicy::RequireAny)
            .with_sink(Box::new(TimeSeries::new(bad.clone())), retry(2))
            .with_sink(Box::new(TimeSeries::new(good.clone())), retry(2));

        let delivery = publisher.publish(Stream::Sensors, &[record("sensor/ei:0"), record("sensor/rs:100")]);

        assert_eq!(delivery.accepted, vec!["good".to_string()]);
        assert_eq!(delivery.failed.len(), 1);
        assert_eq!(delivery.failed[0].0, "bad");
        assert_eq!(bad.call_count(), 2);
        assert_eq!(good.records().len(), 2);
        assert!(delivery.satisfies(SinkPolicy::RequireAny));
        assert!(!delivery.satisfies(SinkPolicy::RequireAll));
    }

    #[test]
    fn transient_failure_is_retried_within_budget() {
        let flaky = Arc::new(RecordingSink {
            fail_first: 1,
            ..RecordingSink::named("flaky")
        });
        let publisher =
            Publisher::new(SinkPolicy::RequireAll).with_sink(Box::new(TimeSeries::new(flaky.clone())), retry(2));

        let delivery = publisher.publish(Stream::Runtime, &[record("runtime")]);
        assert!(delivery.satisfies(SinkPolicy::RequireAll));
        assert_eq!(flaky.call_count(), 2);
        assert_eq!(flaky.records().len(), 1);
    }

    #[test]
    fn empty_batch_is_trivially_delivered() {
        let sink = Arc::new(RecordingSink::failing("never-called"));
        let publisher =
            Publisher::new(SinkPolicy::RequireAll).with_sink(Box::new(TimeSeries::new(sink.clone())), retry(1));
        let delivery = publisher.publish(Stream::Sensors, &[]);
        assert!(delivery.satisfies(SinkPolicy::RequireAll));
        assert_eq!(sink.call_count(), 0);
    }

    #[test]
    fn parses_sink_policy() {
        assert_eq!("ANY".parse::<SinkPolicy>(), Ok(SinkPolicy::RequireAny));
        assert_eq!("all".parse::<SinkPolicy>(), Ok(SinkPolicy::RequireAll));
        assert!("most".parse::<SinkPolicy>().is_err());
    }
}
