//! Turning readings into scoring rows.
//!
//! Window statistics only enter a row once the entity's windows are full,
//! so rows built at start-up and rows built later describe the same thing.

use drift::{FeatureTable, TableRow};
use serde::{Deserialize, Serialize};
use telemetry::{Reading, WindowAggregator, WindowError, WindowSpec};

/// Columns a scoring row carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureSet {
    /// The reading's numeric fields as logged
    #[default]
    Raw,
    /// Raw fields plus the stats of every full window. Rolling stats of
    /// one entity are strongly correlated from row to row, so this needs
    /// many entities before it is as quiet as `Raw`.
    Windowed,
}

/// Scoring row of one reading
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringRow {
    pub row: TableRow,
    /// Every numeric field of the reading carries the stats of every window
    pub warm: bool,
}

/// Ingest one reading and return its scoring row. With
/// [`FeatureSet::Windowed`] the row also carries the flattened stats of
/// every full window for that entity.
pub fn ingest_row(aggregator: &WindowAggregator, reading: &Reading, set: FeatureSet) -> ScoringRow {
    aggregator.ingest(reading);
    if set == FeatureSet::Raw {
        return ScoringRow {
            row: TableRow::from(reading),
            warm: true,
        };
    }

    let windows = aggregator.snapshot_warm(&reading.entity_id);
    let warm = windows.len() == aggregator.windows().len()
        && windows
            .iter()
            .all(|w| reading.numeric_values().all(|(field, _)| w.fields.contains_key(field)));

    let mut row = TableRow::from(reading);
    for features in &windows {
        row.values.extend(features.flatten());
    }
    ScoringRow { row, warm }
}

/// Rows for a standalone batch, aggregated from scratch with `aggregator`'s
/// windows. The aggregator itself is left untouched.
pub fn rows_with(aggregator: &WindowAggregator, readings: &[Reading], set: FeatureSet) -> Vec<TableRow> {
    let scratch = aggregator.fresh();
    readings.iter().map(|r| ingest_row(&scratch, r, set).row).collect()
}

pub fn table_with(aggregator: &WindowAggregator, readings: &[Reading], set: FeatureSet) -> FeatureTable {
    FeatureTable::from_rows(&rows_with(aggregator, readings, set))
}

pub fn table_from_readings(
    windows: &[WindowSpec],
    readings: &[Reading],
    set: FeatureSet,
) -> Result<FeatureTable, WindowError> {
    let aggregator = WindowAggregator::new(windows.to_vec())?;
    Ok(table_with(&aggregator, readings, set))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn windows() -> Vec<WindowSpec> {
        vec![WindowSpec::count("1h", 2), WindowSpec::count("24h", 4)]
    }

    #[test]
    fn test_row_carries_raw_and_full_window_features() {
        let aggregator = WindowAggregator::new(windows()).unwrap();
        let rows: Vec<ScoringRow> = [40.0, 50.0, 40.0, 50.0]
            .into_iter()
            .enumerate()
            .map(|(t, v)| {
                let reading = Reading::new("machine_001", t as u64).with_value("vibration", v);
                ingest_row(&aggregator, &reading, FeatureSet::Windowed)
            })
            .collect();

        // raw value only while the long window fills
        assert!(!rows[1].warm);
        assert_eq!(rows[1].row.values.len(), 1);
        assert_eq!(rows[1].row.values["vibration"], 50.0);

        let last = &rows[3];
        assert!(last.warm);
        assert_eq!(last.row.key.timestamp_us, 3);
        // raw plus five stats per window
        assert_eq!(last.row.values.len(), 11);
        assert_eq!(last.row.values["vibration_mean_1h"], 45.0);
        assert_eq!(last.row.values["vibration_max_24h"], 50.0);
        assert_eq!(last.row.values["vibration_trend_24h"], 5.0);
    }

    #[test]
    fn test_new_field_is_not_warm() {
        let aggregator = WindowAggregator::new(windows()).unwrap();
        for t in 0..4 {
            ingest_row(&aggregator, &Reading::new("m", t).with_value("x", 1.0), FeatureSet::Windowed);
        }
        let reading = Reading::new("m", 4).with_value("x", 1.0).with_value("y", 3.0);
        let late = ingest_row(&aggregator, &reading, FeatureSet::Windowed);
        assert!(!late.warm);
        assert!(late.row.values.contains_key("x_mean_24h"));
        assert!(!late.row.values.contains_key("y_mean_24h"));
    }

    #[test]
    fn test_standalone_rows_leave_the_aggregator_alone() {
        let aggregator = WindowAggregator::new(vec![WindowSpec::count("1h", 1)]).unwrap();
        let table = table_with(
            &aggregator,
            &[
                Reading::new("a", 1).with_value("x", 1.0),
                Reading::new("b", 1).with_value("x", 100.0),
            ],
            FeatureSet::Windowed,
        );

        assert_eq!(table.values("x_mean_1h"), vec![1.0, 100.0]);
        assert_eq!(aggregator.entity_count(), 0);
    }

    #[test]
    fn test_raw_rows_still_feed_the_aggregator() {
        let aggregator = WindowAggregator::new(vec![WindowSpec::count("1h", 1)]).unwrap();
        let scored = ingest_row(&aggregator, &Reading::new("m", 0).with_value("x", 2.0), FeatureSet::Raw);

        assert!(scored.warm);
        assert_eq!(scored.row.values.keys().collect::<Vec<_>>(), vec!["x"]);
        assert_eq!(aggregator.snapshot("m", "1h").unwrap().fields["x"].mean, 2.0);
    }
}
