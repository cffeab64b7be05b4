//! Drift Scoring
//!
//! Columnar feature tables, the reference snapshot, the bounded current
//! window and the scorer that compares the two.
//!
//! Scores use a single global threshold for every feature. Per-feature
//! thresholds would slot in at [`DriftScorer::flag`].

pub mod measure;

pub use measure::{DistanceMeasure, KolmogorovSmirnov, NormalizedWasserstein};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use telemetry::{FeatureRow, Reading};
use thiserror::Error;

/// Default drift threshold on the per-feature score
pub const DEFAULT_THRESHOLD: f64 = 0.3;

/// Which side of a comparison an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Reference,
    Current,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Reference => write!(f, "reference"),
            Side::Current => write!(f, "current"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriftError {
    #[error("{0} data is empty")]
    EmptyInput(Side),

    #[error("no common features between reference and current data")]
    NoCommonFeatures,
}

pub type DriftResult<T> = Result<T, DriftError>;

/// Row key: who produced the row and when its window ended
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey {
    pub entity_id: String,
    pub timestamp_us: u64,
}

/// One row of named numeric features
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    pub key: RowKey,
    pub values: BTreeMap<String, f64>,
}

impl From<&FeatureRow> for TableRow {
    fn from(row: &FeatureRow) -> Self {
        Self {
            key: RowKey {
                entity_id: row.entity_id.clone(),
                timestamp_us: row.window_end_us,
            },
            values: row.flatten(),
        }
    }
}

impl From<&Reading> for TableRow {
    fn from(reading: &Reading) -> Self {
        Self {
            key: RowKey {
                entity_id: reading.entity_id.clone(),
                timestamp_us: reading.timestamp_us,
            },
            values: reading
                .numeric_values()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }
}

/// Columnar table. Every column has one cell per row; rows that lack a
/// feature hold `None` in that column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
    keys: Vec<RowKey>,
    columns: BTreeMap<String, Vec<Option<f64>>>,
}

impl FeatureTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows<'a>(rows: impl IntoIterator<Item = &'a TableRow>) -> Self {
        let mut table = Self::new();
        for row in rows {
            table.push_row(row);
        }
        table
    }

    pub fn from_readings(readings: &[Reading]) -> Self {
        let rows: Vec<TableRow> = readings.iter().map(TableRow::from).collect();
        Self::from_rows(&rows)
    }

    pub fn from_feature_rows(rows: &[FeatureRow]) -> Self {
        let rows: Vec<TableRow> = rows.iter().map(TableRow::from).collect();
        Self::from_rows(&rows)
    }

    /// Rebuild from raw columns, checking every column has one cell per key
    pub fn from_columns(
        keys: Vec<RowKey>,
        columns: BTreeMap<String, Vec<Option<f64>>>,
    ) -> Result<Self, String> {
        for (name, cells) in &columns {
            if cells.len() != keys.len() {
                return Err(format!(
                    "column {} has {} cells for {} rows",
                    name,
                    cells.len(),
                    keys.len()
                ));
            }
        }
        Ok(Self { keys, columns })
    }

    pub fn push_row(&mut self, row: &TableRow) {
        let filled = self.keys.len();
        self.keys.push(row.key.clone());

        for (name, value) in &row.values {
            self.columns
                .entry(name.clone())
                .or_insert_with(|| vec![None; filled])
                .push(Some(*value));
        }
        for cells in self.columns.values_mut() {
            if cells.len() < self.keys.len() {
                cells.push(None);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[RowKey] {
        &self.keys
    }

    pub fn columns(&self) -> &BTreeMap<String, Vec<Option<f64>>> {
        &self.columns
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(|s| s.as_str())
    }

    /// Present, finite values of one column
    pub fn values(&self, column: &str) -> Vec<f64> {
        self.columns
            .get(column)
            .map(|cells| cells.iter().flatten().copied().filter(|v| v.is_finite()).collect())
            .unwrap_or_default()
    }

    /// Back to rows, dropping empty cells
    pub fn to_rows(&self) -> Vec<TableRow> {
        self.keys
            .iter()
            .enumerate()
            .map(|(i, key)| TableRow {
                key: key.clone(),
                values: self
                    .columns
                    .iter()
                    .filter_map(|(name, cells)| cells[i].map(|v| (name.clone(), v)))
                    .collect(),
            })
            .collect()
    }
}

/// How the active reference came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceOrigin {
    /// First collected batch, taken as the baseline
    Bootstrap,
    /// Loaded from storage at startup
    Loaded,
    /// Explicitly replaced at runtime
    Replaced,
}

/// Named, versioned baseline. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceSnapshot {
    pub name: String,
    pub version: u32,
    pub created_at_us: u64,
    pub origin: ReferenceOrigin,
    table: FeatureTable,
}

impl ReferenceSnapshot {
    pub fn new(
        name: impl Into<String>,
        version: u32,
        created_at_us: u64,
        origin: ReferenceOrigin,
        table: FeatureTable,
    ) -> Self {
        Self {
            name: name.into(),
            version,
            created_at_us,
            origin,
            table,
        }
    }

    /// Successor snapshot under the same name
    pub fn replaced_by(&self, table: FeatureTable, created_at_us: u64) -> Self {
        Self::new(
            self.name.clone(),
            self.version + 1,
            created_at_us,
            ReferenceOrigin::Replaced,
            table,
        )
    }

    pub fn table(&self) -> &FeatureTable {
        &self.table
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Bounded FIFO of the most recent feature rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentWindow {
    capacity: usize,
    rows: VecDeque<TableRow>,
}

impl CurrentWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rows: VecDeque::new(),
        }
    }

    /// Append a row; returns the evicted row on overflow
    pub fn push(&mut self, row: TableRow) -> Option<TableRow> {
        self.rows.push_back(row);
        if self.rows.len() > self.capacity {
            self.rows.pop_front()
        } else {
            None
        }
    }

    pub fn extend(&mut self, rows: impl IntoIterator<Item = TableRow>) -> usize {
        rows.into_iter().filter_map(|row| self.push(row)).count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = &TableRow> {
        self.rows.iter()
    }

    pub fn to_table(&self) -> FeatureTable {
        FeatureTable::from_rows(&self.rows)
    }
}

/// Outcome of one drift comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub per_feature_score: BTreeMap<String, f64>,
    pub per_feature_flag: BTreeMap<String, bool>,
    pub overall_score: f64,
    pub detected: bool,
    pub reference_size: usize,
    pub current_size: usize,
    pub threshold: f64,
    pub reference_name: String,
    pub reference_version: u32,
    pub measure: String,
    pub timestamp_us: u64,
}

impl DriftReport {
    /// Report emitted when a batch becomes the reference
    pub fn bootstrap(reference: &ReferenceSnapshot, threshold: f64, timestamp_us: u64) -> Self {
        Self {
            per_feature_score: BTreeMap::new(),
            per_feature_flag: BTreeMap::new(),
            overall_score: 0.0,
            detected: false,
            reference_size: reference.len(),
            current_size: reference.len(),
            threshold,
            reference_name: reference.name.clone(),
            reference_version: reference.version,
            measure: String::from("bootstrap"),
            timestamp_us,
        }
    }

    /// Features whose score exceeded the threshold
    pub fn drifted_features(&self) -> Vec<&str> {
        self.per_feature_flag
            .iter()
            .filter(|(_, flagged)| **flagged)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Compares a reference snapshot against current data
#[derive(Debug, Clone)]
pub struct DriftScorer {
    threshold: f64,
    measure: Arc<dyn DistanceMeasure>,
}

impl DriftScorer {
    pub fn new(threshold: f64) -> Self {
        Self::with_measure(threshold, Arc::new(NormalizedWasserstein::new()))
    }

    pub fn with_measure(threshold: f64, measure: Arc<dyn DistanceMeasure>) -> Self {
        Self { threshold, measure }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn measure_name(&self) -> &'static str {
        self.measure.name()
    }

    pub fn score(
        &self,
        reference: &ReferenceSnapshot,
        current: &CurrentWindow,
        timestamp_us: u64,
    ) -> DriftResult<DriftReport> {
        self.score_table(reference, &current.to_table(), timestamp_us)
    }

    pub fn score_table(
        &self,
        reference: &ReferenceSnapshot,
        current: &FeatureTable,
        timestamp_us: u64,
    ) -> DriftResult<DriftReport> {
        let ref_table = reference.table();
        if ref_table.is_empty() {
            return Err(DriftError::EmptyInput(Side::Reference));
        }
        if current.is_empty() {
            return Err(DriftError::EmptyInput(Side::Current));
        }

        let cur_names: BTreeSet<&str> = current.column_names().collect();
        let mut per_feature_score = BTreeMap::new();

        for name in ref_table.column_names().filter(|n| cur_names.contains(n)) {
            let ref_values = ref_table.values(name);
            let cur_values = current.values(name);
            if ref_values.is_empty() || cur_values.is_empty() {
                continue;
            }
            let score = self.measure.distance(&ref_values, &cur_values);
            per_feature_score.insert(name.to_string(), score);
        }

        if per_feature_score.is_empty() {
            return Err(DriftError::NoCommonFeatures);
        }

        let per_feature_flag: BTreeMap<String, bool> = per_feature_score
            .iter()
            .map(|(name, score)| (name.clone(), self.flag(name, *score)))
            .collect();
        let overall_score = per_feature_score.values().copied().fold(0.0, f64::max);

        Ok(DriftReport {
            per_feature_score,
            per_feature_flag,
            overall_score,
            detected: overall_score > self.threshold,
            reference_size: ref_table.len(),
            current_size: current.len(),
            threshold: self.threshold,
            reference_name: reference.name.clone(),
            reference_version: reference.version,
            measure: self.measure.name().to_string(),
            timestamp_us,
        })
    }

    fn flag(&self, _feature: &str, score: f64) -> bool {
        score > self.threshold
    }
}

impl Default for DriftScorer {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn draws(seed: u64, mean: f64, sd: f64, n: usize) -> Vec<Reading> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(mean, sd).unwrap();
        (0..n)
            .map(|i| {
                Reading::new(format!("machine_{:03}", i % 10), i as u64)
                    .with_value("vibration", normal.sample(&mut rng))
            })
            .collect()
    }

    fn reference(readings: &[Reading]) -> ReferenceSnapshot {
        ReferenceSnapshot::new(
            "baseline",
            1,
            0,
            ReferenceOrigin::Loaded,
            FeatureTable::from_readings(readings),
        )
    }

    #[test]
    fn test_same_distribution_is_not_drift() {
        let scorer = DriftScorer::default();
        let reference = reference(&draws(42, 50.0, 10.0, 1000));

        for seed in 100..120 {
            let current = FeatureTable::from_readings(&draws(seed, 50.0, 10.0, 100));
            let report = scorer.score_table(&reference, &current, 0).unwrap();
            assert!(!report.detected, "seed {} scored {}", seed, report.overall_score);
        }
    }

    #[test]
    fn test_shifted_distribution_is_drift() {
        let scorer = DriftScorer::default();
        let reference = reference(&draws(42, 50.0, 10.0, 1000));
        let current = FeatureTable::from_readings(&draws(44, 90.0, 15.0, 100));

        let report = scorer.score_table(&reference, &current, 0).unwrap();
        assert!(report.detected);
        assert!(report.per_feature_score["vibration"] > report.threshold);
        assert!(report.per_feature_flag["vibration"]);
        assert_eq!(report.drifted_features(), vec!["vibration"]);
        assert_eq!(report.reference_size, 1000);
        assert_eq!(report.current_size, 100);
    }

    #[test]
    fn test_only_shifted_feature_is_flagged() {
        let mut rng = StdRng::seed_from_u64(7);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let rows = |shift: f64, n: usize, rng: &mut StdRng| -> Vec<Reading> {
            (0..n)
                .map(|i| {
                    Reading::new("m", i as u64)
                        .with_value("temperature", 25.0 + 5.0 * normal.sample(rng))
                        .with_value("pressure", 1013.0 + shift + 10.0 * normal.sample(rng))
                })
                .collect()
        };
        let reference = reference(&rows(0.0, 1000, &mut rng));
        let current = FeatureTable::from_readings(&rows(200.0, 200, &mut rng));

        let report = DriftScorer::default().score_table(&reference, &current, 0).unwrap();
        assert!(report.per_feature_flag["pressure"]);
        assert!(!report.per_feature_flag["temperature"]);
        assert_eq!(report.overall_score, report.per_feature_score["pressure"]);
    }

    #[test]
    fn test_score_is_deterministic() {
        let scorer = DriftScorer::default();
        let reference = reference(&draws(1, 50.0, 10.0, 500));
        let mut window = CurrentWindow::new(100);
        window.extend(draws(2, 55.0, 12.0, 150).iter().map(TableRow::from));

        let a = scorer.score(&reference, &window, 9).unwrap();
        let b = scorer.score(&reference, &window, 9).unwrap();
        assert_eq!(a.overall_score.to_bits(), b.overall_score.to_bits());
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_inputs() {
        let scorer = DriftScorer::default();
        let full = reference(&draws(1, 0.0, 1.0, 10));
        let empty = reference(&[]);

        assert_eq!(
            scorer.score_table(&full, &FeatureTable::new(), 0).unwrap_err(),
            DriftError::EmptyInput(Side::Current)
        );
        assert_eq!(
            scorer.score(&empty, &CurrentWindow::new(4), 0).unwrap_err(),
            DriftError::EmptyInput(Side::Reference)
        );
    }

    #[test]
    fn test_no_common_features() {
        let reference = reference(&[Reading::new("m", 0).with_value("vibration", 1.0)]);
        let current = FeatureTable::from_readings(&[Reading::new("m", 1).with_value("humidity", 60.0)]);

        assert_eq!(
            DriftScorer::default().score_table(&reference, &current, 0).unwrap_err(),
            DriftError::NoCommonFeatures
        );
    }

    #[test]
    fn test_scores_only_the_intersection() {
        let reference = reference(&[
            Reading::new("m", 0).with_value("vibration", 1.0).with_value("pressure", 2.0),
            Reading::new("m", 1).with_value("vibration", 2.0).with_value("pressure", 3.0),
        ]);
        let current = FeatureTable::from_readings(&[
            Reading::new("m", 2).with_value("vibration", 1.5).with_value("humidity", 3.0),
        ]);

        let report = DriftScorer::default().score_table(&reference, &current, 0).unwrap();
        assert_eq!(report.per_feature_score.keys().collect::<Vec<_>>(), vec!["vibration"]);
    }

    #[test]
    fn test_kolmogorov_smirnov_scorer() {
        let scorer = DriftScorer::with_measure(0.5, Arc::new(KolmogorovSmirnov));
        let reference = reference(&draws(3, 50.0, 10.0, 1000));
        let current = FeatureTable::from_readings(&draws(4, 90.0, 15.0, 100));

        let report = scorer.score_table(&reference, &current, 0).unwrap();
        assert_eq!(report.measure, "kolmogorov_smirnov");
        assert!(report.overall_score <= 1.0);
        assert!(report.detected);
    }

    #[test]
    fn test_current_window_evicts_oldest() {
        let mut window = CurrentWindow::new(3);
        let rows: Vec<TableRow> = (0..4)
            .map(|i| TableRow::from(&Reading::new("m", i).with_value("x", i as f64)))
            .collect();

        assert_eq!(window.extend(rows), 1);
        let kept: Vec<u64> = window.rows().map(|r| r.key.timestamp_us).collect();
        assert_eq!(kept, vec![1, 2, 3]);
    }

    #[test]
    fn test_sparse_table_columns() {
        let table = FeatureTable::from_readings(&[
            Reading::new("a", 0).with_value("x", 1.0),
            Reading::new("b", 1).with_value("y", 2.0),
            Reading::new("c", 2).with_value("x", 3.0).with_value("y", 4.0),
        ]);

        assert_eq!(table.len(), 3);
        assert_eq!(table.columns()["x"], vec![Some(1.0), None, Some(3.0)]);
        assert_eq!(table.columns()["y"], vec![None, Some(2.0), Some(4.0)]);
        assert_eq!(table.values("x"), vec![1.0, 3.0]);

        let rows = table.to_rows();
        assert_eq!(rows[1].values.len(), 1);
        assert_eq!(FeatureTable::from_rows(&rows), table);
    }

    #[test]
    fn test_feature_rows_flatten_into_table() {
        let row = FeatureRow {
            entity_id: "machine_001".into(),
            window: "1h".into(),
            window_end_us: 10,
            fields: BTreeMap::from([(
                "vibration".to_string(),
                telemetry::FieldStats { mean: 1.0, stddev: 0.0, min: 1.0, max: 1.0, trend: 0.0 },
            )]),
        };
        let table = FeatureTable::from_feature_rows(&[row]);

        assert_eq!(table.keys()[0].timestamp_us, 10);
        assert_eq!(table.values("vibration_mean_1h"), vec![1.0]);
        assert_eq!(table.column_names().count(), 5);
    }
}
