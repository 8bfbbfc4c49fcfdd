//! Last-published markers for the independently deduplicated data streams.
//!
//! Markers live only in memory. A restart starts from "never published", so the
//! first cycle after a restart republishes whatever the device currently reports.

use chrono::{DateTime, Utc};
use core::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Stream {
    /// Extended runtime samples, keyed by the device's runtime interval counter.
    Runtime,
    /// Remote sensor and air quality samples, keyed by the thermostat's UTC time.
    Sensors,
    /// Current weather, keyed by the weather observation time.
    Weather,
}

impl Stream {
    pub fn as_str(self) -> &'static str {
        match self {
            Stream::Runtime => "runtime",
            Stream::Sensors => "sensors",
            Stream::Weather => "weather",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The value a snapshot reports for a stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Marker {
    Interval(i64),
    Timestamp(DateTime<Utc>),
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Marker::Interval(i) => write!(f, "interval {}", i),
            Marker::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Watermarks {
    runtime: Option<Marker>,
    sensors: Option<Marker>,
    weather: Option<Marker>,
}

impl Watermarks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, stream: Stream) -> &Option<Marker> {
        match stream {
            Stream::Runtime => &self.runtime,
            Stream::Sensors => &self.sensors,
            Stream::Weather => &self.weather,
        }
    }

    fn slot_mut(&mut self, stream: Stream) -> &mut Option<Marker> {
        match stream {
            Stream::Runtime => &mut self.runtime,
            Stream::Sensors => &mut self.sensors,
            Stream::Weather => &mut self.weather,
        }
    }

    pub fn get(&self, stream: Stream) -> Option<Marker> {
        *self.slot(stream)
    }

    /// Any change counts as new data; an older timestamp than the stored one is
    /// still a different sample.
    pub fn should_publish(&self, stream: Stream, candidate: Marker) -> bool {
        self.slot(stream).as_ref() != Some(&candidate)
    }

    pub fn advance(&mut self, stream: Stream, candidate: Marker) {
        *self.slot_mut(stream) = Some(candidate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(minute: u32) -> Marker {
        Marker::Timestamp(Utc.with_ymd_and_hms(2024, 1, 15, 13, minute, 0).unwrap())
    }

    #[test]
    fn fresh_watermarks_publish_everything() {
        let w = Watermarks::new();
        assert!(w.should_publish(Stream::Runtime, Marker::Interval(0)));
        assert!(w.should_publish(Stream::Sensors, ts(0)));
        assert!(w.should_publish(Stream::Weather, ts(0)));
    }

    #[test]
    fn interval_change_is_detected() {
        let mut w = Watermarks::new();
        w.advance(Stream::Runtime, Marker::Interval(41));
        assert!(!w.should_publish(Stream::Runtime, Marker::Interval(41)));
        assert!(w.should_publish(Stream::Runtime, Marker::Interval(42)));
        // the counter wraps at midnight
        assert!(w.should_publish(Stream::Runtime, Marker::Interval(0)));
    }

    #[test]
    fn out_of_order_timestamps_count_as_new() {
        let mut w = Watermarks::new();
        w.advance(Stream::Sensors, ts(10));
        assert!(!w.should_publish(Stream::Sensors, ts(10)));
        assert!(w.should_publish(Stream::Sensors, ts(5)));
        assert!(w.should_publish(Stream::Sensors, ts(15)));
    }

    #[test]
    fn streams_are_independent() {
        let mut w = Watermarks::new();
        w.advance(Stream::Sensors, ts(10));
        assert!(w.should_publish(Stream::Weather, ts(10)));
        assert_eq!(w.get(Stream::Sensors), Some(ts(10)));
        assert_eq!(w.get(Stream::Weather), None);
    }
}
