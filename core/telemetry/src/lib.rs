//! Sensor Telemetry Schema v1
//!
//! Raw readings, rolling window buffers and the per-entity windowed
//! feature aggregator that turns a reading stream into feature rows.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall clock in microseconds since the Unix epoch
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Raw reading from one entity (unnormalized)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    #[serde(alias = "machine_id")]
    pub entity_id: String,
    #[serde(default, alias = "timestamp", deserialize_with = "lenient_timestamp_us")]
    pub timestamp_us: u64,
    /// Every other field of the record. Non-numeric values are carried
    /// through but never aggregated.
    #[serde(flatten)]
    pub values: BTreeMap<String, Value>,
}

impl Reading {
    pub fn new(entity_id: impl Into<String>, timestamp_us: u64) -> Self {
        Self {
            entity_id: entity_id.into(),
            timestamp_us,
            values: BTreeMap::new(),
        }
    }

    /// Builder-style field insert
    pub fn with_value(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(field.into(), value.into());
        self
    }

    /// Numeric value of a field, if present and finite
    pub fn numeric(&self, field: &str) -> Option<f64> {
        self.values.get(field).and_then(as_finite)
    }

    /// All fields that carry a finite numeric value
    pub fn numeric_values(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.values
            .iter()
            .filter_map(|(k, v)| as_finite(v).map(|x| (k.as_str(), x)))
    }
}

fn as_finite(value: &Value) -> Option<f64> {
    value.as_f64().filter(|x| x.is_finite())
}

/// Microseconds since the epoch from a number or a date string.
///
/// Numbers are taken as microseconds. Strings may be RFC 3339 or a
/// zone-less ISO 8601 date-time, which is read as UTC.
pub fn parse_timestamp_us(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|x| x.is_finite() && *x >= 0.0).map(|x| x as u64)),
        Value::String(s) => parse_timestamp_str(s.trim()),
        _ => None,
    }
}

fn parse_timestamp_str(s: &str) -> Option<u64> {
    if let Ok(us) = s.parse::<u64>() {
        return Some(us);
    }
    let utc = DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| Utc.from_utc_datetime(&naive))
        })?;
    u64::try_from(utc.timestamp_micros()).ok()
}

/// Unparseable timestamps become 0 instead of failing the record
fn lenient_timestamp_us<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(parse_timestamp_us(&value).unwrap_or(0))
}

/// Window definition. Count-bounded, optionally also age-bounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    /// Label used in flattened feature names (`vibration_mean_1h`)
    pub label: String,
    pub capacity: usize,
    #[serde(default)]
    pub max_age_us: Option<u64>,
}

impl WindowSpec {
    pub fn count(label: impl Into<String>, capacity: usize) -> Self {
        Self {
            label: label.into(),
            capacity,
            max_age_us: None,
        }
    }

    pub fn with_max_age_us(mut self, max_age_us: u64) -> Self {
        self.max_age_us = Some(max_age_us);
        self
    }
}

/// Invalid window configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowError {
    NoWindows,
    ZeroCapacity(String),
    DuplicateLabel(String),
    /// Windows must be listed short to long
    Unordered { shorter: String, longer: String },
}

impl fmt::Display for WindowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowError::NoWindows => write!(f, "at least one window is required"),
            WindowError::ZeroCapacity(label) => write!(f, "window {} has zero capacity", label),
            WindowError::DuplicateLabel(label) => write!(f, "duplicate window label {}", label),
            WindowError::Unordered { shorter, longer } => {
                write!(f, "window {} is longer than following window {}", shorter, longer)
            }
        }
    }
}

impl std::error::Error for WindowError {}

/// Bounded FIFO of timestamped values for one field
#[derive(Debug, Clone)]
pub struct RollingBuffer {
    capacity: usize,
    max_age_us: Option<u64>,
    samples: VecDeque<(u64, f64)>,
    /// Set once anything has been evicted
    saturated: bool,
}

impl RollingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            max_age_us: None,
            samples: VecDeque::with_capacity(capacity.min(1024)),
            saturated: false,
        }
    }

    pub fn from_spec(spec: &WindowSpec) -> Self {
        let mut buf = Self::new(spec.capacity);
        buf.max_age_us = spec.max_age_us;
        buf
    }

    /// Add a value, evicting the oldest past capacity or age
    pub fn push(&mut self, timestamp_us: u64, value: f64) {
        self.samples.push_back((timestamp_us, value));

        while self.samples.len() > self.capacity {
            self.samples.pop_front();
            self.saturated = true;
        }

        if let Some(max_age) = self.max_age_us {
            let cutoff = timestamp_us.saturating_sub(max_age);
            while let Some((t, _)) = self.samples.front() {
                if *t < cutoff {
                    self.samples.pop_front();
                    self.saturated = true;
                } else {
                    break;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The buffer spans its whole window: it reached capacity, or has
    /// already aged values out
    pub fn is_full(&self) -> bool {
        self.saturated || self.samples.len() >= self.capacity
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().map(|(_, v)| *v)
    }

    pub fn latest(&self) -> Option<f64> {
        self.samples.back().map(|(_, v)| *v)
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.values().sum::<f64>() / self.samples.len() as f64
    }

    /// Sample standard deviation (n - 1). Zero below two values.
    pub fn stddev(&self) -> f64 {
        let n = self.samples.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let ss: f64 = self.values().map(|v| (v - mean).powi(2)).sum();
        (ss / (n - 1) as f64).sqrt()
    }

    pub fn min(&self) -> f64 {
        self.values().fold(f64::INFINITY, f64::min)
    }

    pub fn max(&self) -> f64 {
        self.values().fold(f64::NEG_INFINITY, f64::max)
    }
}

/// Rolling statistics of one field over one window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldStats {
    pub mean: f64,
    pub stddev: f64,
    pub min: f64,
    pub max: f64,
    /// Latest raw value minus the long window mean
    pub trend: f64,
}

impl FieldStats {
    pub const STAT_NAMES: [&'static str; 5] = ["mean", "std", "min", "max", "trend"];

    pub fn to_array(&self) -> [f64; 5] {
        [self.mean, self.stddev, self.min, self.max, self.trend]
    }
}

/// Feature row for one (entity, window) at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub entity_id: String,
    pub window: String,
    pub window_end_us: u64,
    pub fields: BTreeMap<String, FieldStats>,
}

impl FeatureRow {
    /// Flatten to named features, e.g. `temperature_std_24h`
    pub fn flatten(&self) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        for (field, stats) in &self.fields {
            for (name, value) in FieldStats::STAT_NAMES.iter().zip(stats.to_array()) {
                out.insert(feature_name(field, name, &self.window), value);
            }
        }
        out
    }
}

pub fn feature_name(field: &str, stat: &str, window: &str) -> String {
    format!("{}_{}_{}", field, stat, window)
}

/// Rolling buffers of a single entity, one map per configured window
#[derive(Debug)]
struct EntityWindows {
    buffers: Vec<BTreeMap<String, RollingBuffer>>,
    last_timestamp_us: u64,
}

impl EntityWindows {
    fn new(window_count: usize) -> Self {
        Self {
            buffers: vec![BTreeMap::new(); window_count],
            last_timestamp_us: 0,
        }
    }

    fn record(&mut self, specs: &[WindowSpec], reading: &Reading) {
        for (field, value) in reading.numeric_values() {
            for (spec, buffers) in specs.iter().zip(self.buffers.iter_mut()) {
                buffers
                    .entry(field.to_string())
                    .or_insert_with(|| RollingBuffer::from_spec(spec))
                    .push(reading.timestamp_us, value);
            }
        }
        self.last_timestamp_us = self.last_timestamp_us.max(reading.timestamp_us);
    }
}

/// Windowed feature aggregator
///
/// Keeps per-entity rolling buffers for each configured window. Ingestion
/// for different entities runs in parallel; a single entity is serialized
/// behind its own lock.
#[derive(Debug)]
pub struct WindowAggregator {
    specs: Vec<WindowSpec>,
    entities: DashMap<String, Arc<Mutex<EntityWindows>>>,
}

impl WindowAggregator {
    /// Windows are given short to long; the last one is the trend window.
    pub fn new(specs: Vec<WindowSpec>) -> Result<Self, WindowError> {
        if specs.is_empty() {
            return Err(WindowError::NoWindows);
        }
        for (i, spec) in specs.iter().enumerate() {
            if spec.capacity == 0 {
                return Err(WindowError::ZeroCapacity(spec.label.clone()));
            }
            if specs[..i].iter().any(|s| s.label == spec.label) {
                return Err(WindowError::DuplicateLabel(spec.label.clone()));
            }
            if i > 0 && specs[i - 1].capacity > spec.capacity {
                return Err(WindowError::Unordered {
                    shorter: specs[i - 1].label.clone(),
                    longer: spec.label.clone(),
                });
            }
        }

        Ok(Self {
            specs,
            entities: DashMap::new(),
        })
    }

    pub fn short_long(short: WindowSpec, long: WindowSpec) -> Result<Self, WindowError> {
        Self::new(vec![short, long])
    }

    /// Empty aggregator with the same windows
    pub fn fresh(&self) -> Self {
        Self {
            specs: self.specs.clone(),
            entities: DashMap::new(),
        }
    }

    pub fn windows(&self) -> &[WindowSpec] {
        &self.specs
    }

    /// Add a reading to every window of its entity
    pub fn ingest(&self, reading: &Reading) {
        let existing = self
            .entities
            .get(&reading.entity_id)
            .map(|entry| Arc::clone(entry.value()));
        let state = existing.unwrap_or_else(|| {
            Arc::clone(
                self.entities
                    .entry(reading.entity_id.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(EntityWindows::new(self.specs.len()))))
                    .value(),
            )
        });

        // shard lock is released here; only this entity is held below
        state.lock().record(&self.specs, reading);
    }

    /// Current feature row of one entity for one window
    pub fn snapshot(&self, entity_id: &str, window: &str) -> Option<FeatureRow> {
        let idx = self.specs.iter().position(|s| s.label == window)?;
        let state = Arc::clone(self.entities.get(entity_id)?.value());
        let state = state.lock();
        self.build_row(entity_id, idx, &state, false)
    }

    /// Feature rows of one entity for every window, short to long
    pub fn snapshot_all(&self, entity_id: &str) -> Vec<FeatureRow> {
        let Some(state) = self.entities.get(entity_id).map(|e| Arc::clone(e.value())) else {
            return Vec::new();
        };
        let state = state.lock();
        (0..self.specs.len())
            .filter_map(|idx| self.build_row(entity_id, idx, &state, false))
            .collect()
    }

    /// Like [`snapshot_all`](Self::snapshot_all), but a field only appears
    /// once both its own window and the long window are full. Stats from
    /// a partly filled window are not comparable with steady-state ones.
    pub fn snapshot_warm(&self, entity_id: &str) -> Vec<FeatureRow> {
        let Some(state) = self.entities.get(entity_id).map(|e| Arc::clone(e.value())) else {
            return Vec::new();
        };
        let state = state.lock();
        (0..self.specs.len())
            .filter_map(|idx| self.build_row(entity_id, idx, &state, true))
            .collect()
    }

    pub fn entities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entities.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    fn build_row(
        &self,
        entity_id: &str,
        idx: usize,
        state: &EntityWindows,
        warm_only: bool,
    ) -> Option<FeatureRow> {
        let long = state.buffers.last()?;
        let mut fields = BTreeMap::new();

        for (field, buf) in &state.buffers[idx] {
            if warm_only && !(buf.is_full() && long.get(field).is_some_and(RollingBuffer::is_full)) {
                continue;
            }
            let Some(latest) = buf.latest() else {
                continue;
            };
            let trend = match long.get(field) {
                Some(lb) if lb.len() >= 2 => latest - lb.mean(),
                _ => 0.0,
            };
            fields.insert(
                field.clone(),
                FieldStats {
                    mean: buf.mean(),
                    stddev: buf.stddev(),
                    min: buf.min(),
                    max: buf.max(),
                    trend,
                },
            );
        }

        if fields.is_empty() {
            return None;
        }

        Some(FeatureRow {
            entity_id: entity_id.to_string(),
            window: self.specs[idx].label.clone(),
            window_end_us: state.last_timestamp_us,
            fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator(short: usize, long: usize) -> WindowAggregator {
        WindowAggregator::short_long(WindowSpec::count("1h", short), WindowSpec::count("24h", long))
            .unwrap()
    }

    #[test]
    fn test_single_reading_has_zero_stddev() {
        let agg = aggregator(4, 24);
        agg.ingest(
            &Reading::new("machine_001", 1)
                .with_value("vibration", 51.5)
                .with_value("temperature", 24.0),
        );

        for row in agg.snapshot_all("machine_001") {
            for stats in row.fields.values() {
                assert_eq!(stats.stddev, 0.0);
                assert_eq!(stats.trend, 0.0);
                assert_eq!(stats.min, stats.max);
            }
        }
    }

    #[test]
    fn test_rolling_buffer_eviction() {
        let mut buf = RollingBuffer::new(3);
        for (t, v) in [1.0, 2.0, 3.0, 4.0].into_iter().enumerate() {
            buf.push(t as u64, v);
        }

        assert_eq!(buf.values().collect::<Vec<_>>(), vec![2.0, 3.0, 4.0]);
        assert_eq!(buf.mean(), 3.0);
        assert_eq!(buf.min(), 2.0);
        assert_eq!(buf.max(), 4.0);
    }

    #[test]
    fn test_sample_stddev() {
        let mut buf = RollingBuffer::new(8);
        for (t, v) in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0].into_iter().enumerate() {
            buf.push(t as u64, v);
        }
        // population stddev would be exactly 2.0
        assert!((buf.stddev() - (32.0f64 / 7.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_age_eviction() {
        let mut buf = RollingBuffer::from_spec(&WindowSpec::count("1h", 100).with_max_age_us(10));
        buf.push(0, 1.0);
        buf.push(5, 2.0);
        buf.push(12, 3.0);

        assert_eq!(buf.values().collect::<Vec<_>>(), vec![2.0, 3.0]);
    }

    #[test]
    fn test_buffer_full_by_count_or_age() {
        let mut buf = RollingBuffer::new(3);
        buf.push(0, 1.0);
        buf.push(1, 1.0);
        assert!(!buf.is_full());
        buf.push(2, 1.0);
        assert!(buf.is_full());

        let mut aged = RollingBuffer::from_spec(&WindowSpec::count("1h", 100).with_max_age_us(10));
        aged.push(0, 1.0);
        aged.push(5, 1.0);
        assert!(!aged.is_full());
        aged.push(20, 1.0);
        assert_eq!(aged.len(), 1);
        assert!(aged.is_full());
    }

    #[test]
    fn test_warm_snapshot_waits_for_full_windows() {
        let agg = aggregator(2, 4);
        let mut warm_rows = Vec::new();
        for t in 0..5u64 {
            agg.ingest(&Reading::new("m", t).with_value("vibration", t as f64));
            warm_rows.push(agg.snapshot_warm("m").len());
        }

        // short window is full from the second reading, but trend needs the long one
        assert_eq!(warm_rows, vec![0, 0, 0, 2, 2]);
        assert_eq!(agg.snapshot_all("m").len(), 2);
        assert!(agg.snapshot_warm("other").is_empty());

        let long = &agg.snapshot_warm("m")[1];
        assert_eq!(long.window, "24h");
        assert_eq!(long.fields["vibration"].mean, 2.5);
    }

    #[test]
    fn test_warmth_is_per_field() {
        let agg = aggregator(1, 2);
        agg.ingest(&Reading::new("m", 0).with_value("vibration", 1.0));
        agg.ingest(&Reading::new("m", 1).with_value("vibration", 2.0).with_value("pressure", 3.0));

        let rows = agg.snapshot_warm("m");
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| row.fields.keys().eq(["vibration"])));
    }

    #[test]
    fn test_window_eviction_through_aggregator() {
        let agg = aggregator(3, 5);
        for (t, v) in [1.0, 2.0, 3.0, 4.0].into_iter().enumerate() {
            agg.ingest(&Reading::new("m", t as u64).with_value("vibration", v));
        }

        let short = agg.snapshot("m", "1h").unwrap();
        let stats = short.fields["vibration"];
        assert_eq!(stats.mean, 3.0);
        assert_eq!(stats.min, 2.0);
        assert_eq!(short.window_end_us, 3);

        // long window still holds all four: mean 2.5, latest 4
        let long = agg.snapshot("m", "24h").unwrap();
        assert_eq!(long.fields["vibration"].mean, 2.5);
        assert_eq!(long.fields["vibration"].trend, 1.5);
        assert_eq!(stats.trend, 1.5);
    }

    #[test]
    fn test_non_numeric_field_is_skipped() {
        let agg = aggregator(2, 4);
        agg.ingest(
            &Reading::new("m", 0)
                .with_value("vibration", 50.0)
                .with_value("location", "London")
                .with_value("pressure", Value::Null),
        );

        let row = agg.snapshot("m", "1h").unwrap();
        assert_eq!(row.fields.keys().collect::<Vec<_>>(), vec!["vibration"]);
    }

    #[test]
    fn test_unknown_entity_or_window() {
        let agg = aggregator(2, 4);
        agg.ingest(&Reading::new("m", 0).with_value("vibration", 1.0));

        assert!(agg.snapshot("other", "1h").is_none());
        assert!(agg.snapshot("m", "7d").is_none());
        assert!(agg.snapshot_all("other").is_empty());
    }

    #[test]
    fn test_flatten_names() {
        let agg = aggregator(2, 4);
        agg.ingest(&Reading::new("m", 0).with_value("vibration", 1.0));

        let flat = agg.snapshot("m", "24h").unwrap().flatten();
        let names: Vec<&str> = flat.keys().map(|s| s.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "vibration_max_24h",
                "vibration_mean_24h",
                "vibration_min_24h",
                "vibration_std_24h",
                "vibration_trend_24h",
            ]
        );
    }

    #[test]
    fn test_invalid_windows() {
        assert_eq!(WindowAggregator::new(vec![]).unwrap_err(), WindowError::NoWindows);
        assert!(matches!(
            WindowAggregator::short_long(WindowSpec::count("a", 10), WindowSpec::count("b", 5)),
            Err(WindowError::Unordered { .. })
        ));
        assert!(matches!(
            WindowAggregator::short_long(WindowSpec::count("a", 1), WindowSpec::count("a", 5)),
            Err(WindowError::DuplicateLabel(_))
        ));
        assert!(matches!(
            WindowAggregator::new(vec![WindowSpec::count("a", 0)]),
            Err(WindowError::ZeroCapacity(_))
        ));
    }

    #[test]
    fn test_parallel_ingest_per_entity() {
        let agg = aggregator(8, 64);

        std::thread::scope(|s| {
            for e in 0..8 {
                let agg = &agg;
                s.spawn(move || {
                    for t in 0..50u64 {
                        agg.ingest(
                            &Reading::new(format!("machine_{:03}", e), t)
                                .with_value("vibration", (e * 10) as f64),
                        );
                    }
                });
            }
        });

        assert_eq!(agg.entity_count(), 8);
        for e in 0..8 {
            let row = agg.snapshot(&format!("machine_{:03}", e), "24h").unwrap();
            assert_eq!(row.fields["vibration"].mean, (e * 10) as f64);
            assert_eq!(row.window_end_us, 49);
        }
    }

    #[test]
    fn test_reading_from_flat_record() {
        let reading: Reading = serde_json::from_str(
            r#"{"machine_id": "machine_003", "timestamp": 17, "vibration": 48.2, "location": "Tokyo"}"#,
        )
        .unwrap();

        assert_eq!(reading.entity_id, "machine_003");
        assert_eq!(reading.timestamp_us, 17);
        assert_eq!(reading.numeric("vibration"), Some(48.2));
        assert_eq!(reading.numeric("location"), None);
        assert_eq!(reading.numeric_values().count(), 1);
    }

    #[test]
    fn test_reading_with_date_string_timestamp() {
        let reading: Reading = serde_json::from_str(
            r#"{"machine_id": "m", "timestamp": "2024-01-26T12:00:00Z", "vibration": 45.0}"#,
        )
        .unwrap();
        assert_eq!(reading.timestamp_us, 1_706_270_400_000_000);
        assert_eq!(reading.numeric("vibration"), Some(45.0));

        // zone-less, as written by the serving log
        let naive: Reading =
            serde_json::from_str(r#"{"machine_id": "m", "timestamp": "2024-01-26T12:00:00.250000"}"#).unwrap();
        assert_eq!(naive.timestamp_us, 1_706_270_400_250_000);
    }

    #[test]
    fn test_unreadable_timestamp_keeps_the_record() {
        for raw in [r#""yesterday""#, "null", "-5", "true"] {
            let line = format!(r#"{{"machine_id": "m", "timestamp": {}, "vibration": 1.0}}"#, raw);
            let reading: Reading = serde_json::from_str(&line).unwrap();
            assert_eq!(reading.timestamp_us, 0, "{}", raw);
            assert_eq!(reading.numeric("vibration"), Some(1.0));
        }
        assert_eq!(parse_timestamp_us(&Value::from("1700")), Some(1700));
        assert_eq!(parse_timestamp_us(&Value::from(12.9)), Some(12));
    }
}
