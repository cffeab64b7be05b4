//! Reading sources
//!
//! Where the controller pulls batches from: an inference log tailed line by
//! line, a synthetic generator, or a primary source with a logged fallback.

use crate::error::{MonitorError, MonitorResult};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde_json::Value;
use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use telemetry::Reading;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

/// Pulls one batch of new readings per call
#[async_trait]
pub trait ReadingSource: Send + Sync {
    async fn fetch_batch(&self) -> MonitorResult<Vec<Reading>>;

    fn name(&self) -> &str;
}

/// Where a [`JsonlSource`] finds its log
#[derive(Debug, Clone, PartialEq, Eq)]
enum LogLocation {
    Fixed(PathBuf),
    /// `{dir}/{prefix}_{YYYYMMDD}.jsonl`, one file per UTC day
    Daily { dir: PathBuf, prefix: String },
}

/// Read position inside one log file
#[derive(Debug)]
struct Cursor {
    path: PathBuf,
    offset: u64,
}

/// Tails a JSONL log. Each line is a reading, or an object whose `input`
/// field is a reading. Only complete lines written since the previous
/// fetch are returned, and at most `max_records` of them (the newest).
///
/// A daily log moves to the next day's file at UTC midnight; whatever was
/// left unread in the old file is returned with the first batch of the new
/// one.
#[derive(Debug)]
pub struct JsonlSource {
    location: LogLocation,
    max_records: usize,
    cursor: tokio::sync::Mutex<Option<Cursor>>,
}

impl JsonlSource {
    pub fn new(path: impl Into<PathBuf>, max_records: usize) -> Self {
        Self::with_location(LogLocation::Fixed(path.into()), max_records)
    }

    /// Follow `{dir}/{prefix}_{YYYYMMDD}.jsonl` for the current UTC date
    pub fn daily(dir: impl Into<PathBuf>, prefix: impl Into<String>, max_records: usize) -> Self {
        let location = LogLocation::Daily {
            dir: dir.into(),
            prefix: prefix.into(),
        };
        Self::with_location(location, max_records)
    }

    fn with_location(location: LogLocation, max_records: usize) -> Self {
        Self {
            location,
            max_records: max_records.max(1),
            cursor: tokio::sync::Mutex::new(None),
        }
    }

    /// Log file read on `date`
    pub fn path_on(&self, date: NaiveDate) -> PathBuf {
        match &self.location {
            LogLocation::Fixed(path) => path.clone(),
            LogLocation::Daily { dir, prefix } => {
                dir.join(format!("{}_{}.jsonl", prefix, date.format("%Y%m%d")))
            }
        }
    }

    /// Parse every complete line, skipping malformed ones
    pub fn parse_lines(&self, text: &str) -> Vec<Reading> {
        let mut readings = VecDeque::with_capacity(self.max_records.min(1024));
        let mut malformed = 0usize;

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match parse_line(line) {
                Some(reading) => {
                    if readings.len() == self.max_records {
                        readings.pop_front();
                    }
                    readings.push_back(reading);
                }
                None => malformed += 1,
            }
        }
        if malformed > 0 {
            debug!(location = ?self.location, malformed, "skipped malformed log lines");
        }
        readings.into()
    }

    /// New complete lines as of `date`
    pub async fn fetch_on(&self, date: NaiveDate) -> MonitorResult<Vec<Reading>> {
        let path = self.path_on(date);
        let mut cursor = self.cursor.lock().await;

        let mut text = String::new();
        if let Some(previous) = cursor.as_mut().filter(|c| c.path != path) {
            text = read_tail(&previous.path, &mut previous.offset).await?;
            info!(from = %previous.path.display(), to = %path.display(), "log file rolled over");
        }
        let current = match cursor.take() {
            Some(current) if current.path == path => cursor.insert(current),
            _ => cursor.insert(Cursor { path, offset: 0 }),
        };

        text.push_str(&read_tail(&current.path, &mut current.offset).await?);
        Ok(self.parse_lines(&text))
    }
}

/// Complete lines of `path` past `offset`, advancing `offset` over them
async fn read_tail(path: &Path, offset: &mut u64) -> MonitorResult<String> {
    let unavailable = |e: std::io::Error| MonitorError::SourceUnavailable(format!("{}: {}", path.display(), e));

    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "log file not found yet");
            return Ok(String::new());
        }
        Err(e) => return Err(unavailable(e)),
    };
    let len = file.metadata().await.map_err(unavailable)?.len();

    // rotated or truncated
    if *offset > len {
        *offset = 0;
    }
    file.seek(SeekFrom::Start(*offset)).await.map_err(unavailable)?;
    let mut unread = Vec::with_capacity((len - *offset) as usize);
    file.read_to_end(&mut unread).await.map_err(unavailable)?;

    let Some(last_newline) = unread.iter().rposition(|b| *b == b'\n') else {
        return Ok(String::new());
    };
    let complete = &unread[..=last_newline];
    *offset += complete.len() as u64;
    Ok(String::from_utf8_lossy(complete).into_owned())
}

fn parse_line(line: &str) -> Option<Reading> {
    let value: Value = serde_json::from_str(line).ok()?;
    let record = match value {
        Value::Object(mut map) if map.get("input").is_some_and(Value::is_object) => {
            let mut input = map.remove("input")?;
            // the logged time sits beside `input`, not inside it
            if let (Some(fields), Some(timestamp)) = (input.as_object_mut(), map.remove("timestamp")) {
                if !fields.contains_key("timestamp") && !fields.contains_key("timestamp_us") {
                    fields.insert("timestamp".to_string(), timestamp);
                }
            }
            input
        }
        other => other,
    };
    serde_json::from_value(record).ok()
}

#[async_trait]
impl ReadingSource for JsonlSource {
    async fn fetch_batch(&self) -> MonitorResult<Vec<Reading>> {
        self.fetch_on(Utc::now().date_naive()).await
    }

    fn name(&self) -> &str {
        "jsonl"
    }
}

/// Normal profile of one synthetic field
#[derive(Debug, Clone, PartialEq)]
pub struct FieldProfile {
    pub name: String,
    pub mean: f64,
    pub std_dev: f64,
}

impl FieldProfile {
    pub fn new(name: impl Into<String>, mean: f64, std_dev: f64) -> Self {
        Self {
            name: name.into(),
            mean,
            std_dev,
        }
    }
}

/// Baseline sensor profiles of a healthy machine
pub fn machine_profiles() -> Vec<FieldProfile> {
    vec![
        FieldProfile::new("vibration", 45.0, 5.0),
        FieldProfile::new("temperature", 75.0, 3.0),
        FieldProfile::new("rotational_speed", 1500.0, 50.0),
        FieldProfile::new("pressure", 2.5, 0.2),
        FieldProfile::new("power_consumption", 15.0, 1.5),
    ]
}

#[derive(Debug)]
struct GeneratorState {
    rng: StdRng,
    drift_factor: f64,
    next_timestamp_us: u64,
}

/// Synthetic readings drawn from per-field normal distributions.
///
/// A drift factor `d` scales every field's mean and spread by `1 + d`.
#[derive(Debug)]
pub struct SyntheticSource {
    entities: usize,
    per_entity: usize,
    step_us: u64,
    profiles: Vec<FieldProfile>,
    state: Mutex<GeneratorState>,
}

impl SyntheticSource {
    pub fn new(entities: usize, per_entity: usize) -> Self {
        Self {
            entities,
            per_entity,
            step_us: 1_000_000,
            profiles: machine_profiles(),
            state: Mutex::new(GeneratorState {
                rng: StdRng::from_entropy(),
                drift_factor: 0.0,
                next_timestamp_us: telemetry::now_us(),
            }),
        }
    }

    pub fn with_seed(self, seed: u64) -> Self {
        self.state.lock().rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_profiles(mut self, profiles: Vec<FieldProfile>) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn with_drift(self, drift_factor: f64) -> Self {
        self.set_drift(drift_factor);
        self
    }

    pub fn starting_at(self, timestamp_us: u64) -> Self {
        self.state.lock().next_timestamp_us = timestamp_us;
        self
    }

    pub fn set_drift(&self, drift_factor: f64) {
        self.state.lock().drift_factor = drift_factor;
    }

    pub fn generate(&self) -> MonitorResult<Vec<Reading>> {
        let mut state = self.state.lock();
        let scale = 1.0 + state.drift_factor;

        let distributions = self
            .profiles
            .iter()
            .map(|p| {
                Normal::new(p.mean * scale, p.std_dev * scale)
                    .map(|d| (p.name.as_str(), d))
                    .map_err(|e| MonitorError::SourceUnavailable(format!("profile {}: {}", p.name, e)))
            })
            .collect::<MonitorResult<Vec<_>>>()?;

        let mut batch = Vec::with_capacity(self.entities * self.per_entity);
        for _ in 0..self.per_entity {
            let timestamp_us = state.next_timestamp_us;
            state.next_timestamp_us += self.step_us;

            for entity in 0..self.entities {
                let mut reading = Reading::new(format!("machine_{:03}", entity + 1), timestamp_us);
                for (name, dist) in &distributions {
                    let value = dist.sample(&mut state.rng);
                    reading = reading.with_value(*name, value);
                }
                batch.push(reading);
            }
        }
        Ok(batch)
    }
}

#[async_trait]
impl ReadingSource for SyntheticSource {
    async fn fetch_batch(&self) -> MonitorResult<Vec<Reading>> {
        self.generate()
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

/// Primary source, with a fallback used (and logged) whenever it fails
pub struct FallbackSource {
    primary: Arc<dyn ReadingSource>,
    fallback: Arc<dyn ReadingSource>,
}

impl FallbackSource {
    pub fn new(primary: Arc<dyn ReadingSource>, fallback: Arc<dyn ReadingSource>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl ReadingSource for FallbackSource {
    async fn fetch_batch(&self) -> MonitorResult<Vec<Reading>> {
        match self.primary.fetch_batch().await {
            Ok(batch) => Ok(batch),
            Err(e) => {
                warn!(
                    primary = self.primary.name(),
                    fallback = self.fallback.name(),
                    error = %e,
                    "primary source failed, using fallback"
                );
                self.fallback.fetch_batch().await
            }
        }
    }

    fn name(&self) -> &str {
        "fallback"
    }
}
