//! Measurement store adapter
//!
//! Time-stamped numeric samples keyed by (device id, measurement, channel).
//! Every read is bounded by an explicit staleness window, so "no data" and
//! "old data" are both reported as an absent value.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use vd_error::{Result, VerdantError};

use crate::constants::store as store_const;
use crate::data::MeasurementRef;

/// One stored sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// A value to write for one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelValue {
    pub measurement: String,
    pub unit: String,
    pub value: f64,
}

impl ChannelValue {
    pub fn new(measurement: impl Into<String>, unit: impl Into<String>, value: f64) -> Self {
        Self {
            measurement: measurement.into(),
            unit: unit.into(),
            value,
        }
    }
}

/// Convert a staleness window in seconds to a chrono duration
pub fn max_age(max_age_sec: f64) -> ChronoDuration {
    ChronoDuration::milliseconds((max_age_sec.max(0.0) * 1000.0).round() as i64)
}

/// Read/write access to the time-series store
///
/// Implementations must be safe to call from many controller loops at once.
pub trait MeasurementStore: Send + Sync {
    /// Newest sample no older than `max_age_sec` relative to `now`
    fn read_latest_at(&self, key: &MeasurementRef, max_age_sec: f64, now: DateTime<Utc>) -> Option<Sample>;

    /// All samples no older than `max_age_sec` relative to `now`, oldest first
    fn read_range_at(&self, key: &MeasurementRef, max_age_sec: f64, now: DateTime<Utc>) -> Vec<Sample>;

    /// Append one sample; never mutates existing samples
    fn append(&self, key: &MeasurementRef, unit: &str, sample: Sample) -> Result<()>;

    fn read_latest(&self, key: &MeasurementRef, max_age_sec: f64) -> Option<Sample> {
        self.read_latest_at(key, max_age_sec, Utc::now())
    }

    fn read_range(&self, key: &MeasurementRef, max_age_sec: f64) -> Vec<Sample> {
        self.read_range_at(key, max_age_sec, Utc::now())
    }

    /// Write several channels of one device
    ///
    /// With `use_shared_timestamp` every channel gets the same timestamp,
    /// otherwise each channel is stamped when it is written.
    fn write(
        &self,
        device_id: &str,
        values: &BTreeMap<u32, ChannelValue>,
        use_shared_timestamp: bool,
    ) -> Result<Vec<DateTime<Utc>>> {
        let shared = Utc::now();
        let mut stamps = Vec::with_capacity(values.len());
        for (channel, cv) in values {
            if !cv.value.is_finite() {
                return Err(VerdantError::measurement(
                    device_id,
                    format!("non-finite value for CH{}", channel),
                ));
            }
            let timestamp = if use_shared_timestamp { shared } else { Utc::now() };
            let key = MeasurementRef::new(device_id, cv.measurement.clone(), *channel);
            self.append(&key, &cv.unit, Sample { timestamp, value: cv.value })?;
            stamps.push(timestamp);
        }
        Ok(stamps)
    }
}

#[derive(Debug, Default)]
struct Series {
    unit: String,
    samples: VecDeque<Sample>,
}

/// Bounded in-memory store; the oldest samples are dropped past `retention`
#[derive(Debug)]
pub struct InMemoryStore {
    series: RwLock<HashMap<MeasurementRef, Series>>,
    retention: usize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_retention(store_const::DEFAULT_RETENTION)
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            retention: retention.max(1),
        }
    }

    /// Unit recorded for a series
    pub fn unit(&self, key: &MeasurementRef) -> Option<String> {
        self.series.read().get(key).map(|s| s.unit.clone())
    }

    /// Number of samples held for a series
    pub fn len(&self, key: &MeasurementRef) -> usize {
        self.series.read().get(key).map(|s| s.samples.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.series.read().values().all(|s| s.samples.is_empty())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MeasurementStore for InMemoryStore {
    fn read_latest_at(&self, key: &MeasurementRef, max_age_sec: f64, now: DateTime<Utc>) -> Option<Sample> {
        let oldest = now - max_age(max_age_sec);
        let guard = self.series.read();
        let series = guard.get(key)?;
        series.samples.back().copied().filter(|s| s.timestamp >= oldest)
    }

    fn read_range_at(&self, key: &MeasurementRef, max_age_sec: f64, now: DateTime<Utc>) -> Vec<Sample> {
        let oldest = now - max_age(max_age_sec);
        let guard = self.series.read();
        match guard.get(key) {
            Some(series) => series.samples.iter().filter(|s| s.timestamp >= oldest).copied().collect(),
            None => Vec::new(),
        }
    }

    fn append(&self, key: &MeasurementRef, unit: &str, sample: Sample) -> Result<()> {
        let mut guard = self.series.write();
        let series = guard.entry(key.clone()).or_default();
        if series.unit.is_empty() {
            series.unit = unit.to_string();
        }
        // Samples stay ordered by timestamp even if writers race
        let idx = series.samples.partition_point(|s| s.timestamp <= sample.timestamp);
        series.samples.insert(idx, sample);
        while series.samples.len() > self.retention {
            series.samples.pop_front();
        }
        Ok(())
    }
}
