//! State shared by the controller and the query service.

use drift::{CurrentWindow, DriftReport, FeatureTable, ReferenceOrigin, ReferenceSnapshot, TableRow};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
pub struct MonitorState {
    pub reference: Option<ReferenceSnapshot>,
    pub current: CurrentWindow,
    pub latest_report: Option<DriftReport>,
    pub last_check_us: Option<u64>,
    /// Rows set aside for a first-batch reference
    pub pending_reference: Vec<TableRow>,
}

impl MonitorState {
    pub fn new(window_capacity: usize) -> Self {
        Self {
            reference: None,
            current: CurrentWindow::new(window_capacity),
            latest_report: None,
            last_check_us: None,
            pending_reference: Vec::new(),
        }
    }

    pub fn with_reference(mut self, reference: ReferenceSnapshot) -> Self {
        self.reference = Some(reference);
        self
    }

    /// Install `table` as the reference: the successor version of the
    /// current one, or version 1 under `name` when none is loaded
    pub fn replace_reference(&mut self, name: &str, table: FeatureTable, now_us: u64) -> &ReferenceSnapshot {
        let next = match &self.reference {
            Some(old) => old.replaced_by(table, now_us),
            None => ReferenceSnapshot::new(name, 1, now_us, ReferenceOrigin::Replaced, table),
        };
        self.latest_report = None;
        self.pending_reference.clear();
        self.reference.insert(next)
    }

    /// Set `rows` aside for the bootstrap reference. Once at least
    /// `min_rows` are gathered they are all handed back and the pile is
    /// emptied.
    pub fn gather_reference<I>(&mut self, rows: I, min_rows: usize) -> Option<Vec<TableRow>>
    where
        I: IntoIterator<Item = TableRow>,
    {
        self.pending_reference.extend(rows);
        if self.pending_reference.is_empty() || self.pending_reference.len() < min_rows {
            return None;
        }
        Some(std::mem::take(&mut self.pending_reference))
    }
}

/// Handle to the single mutable monitor state
#[derive(Debug, Clone)]
pub struct SharedState {
    inner: Arc<Mutex<MonitorState>>,
}

impl SharedState {
    pub fn new(state: MonitorState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.inner.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry::Reading;

    #[test]
    fn test_replace_bumps_version() {
        let table = FeatureTable::from_readings(&[Reading::new("m", 0).with_value("x", 1.0)]);
        let mut state = MonitorState::new(10);

        assert_eq!(state.replace_reference("baseline", table.clone(), 1).version, 1);
        let second = state.replace_reference("ignored", table, 2);
        assert_eq!(second.version, 2);
        assert_eq!(second.name, "baseline");
        assert_eq!(second.origin, ReferenceOrigin::Replaced);
    }

    #[test]
    fn test_gather_reference_until_enough_rows() {
        let row = |v: f64| TableRow::from(&Reading::new("m", 0).with_value("x", v));
        let mut state = MonitorState::new(10);

        assert!(state.gather_reference(vec![row(1.0), row(2.0)], 3).is_none());
        assert!(state.gather_reference(Vec::new(), 3).is_none());
        assert_eq!(state.pending_reference.len(), 2);

        let rows = state.gather_reference(vec![row(3.0), row(4.0)], 3).unwrap();
        assert_eq!(rows.len(), 4);
        assert!(state.pending_reference.is_empty());
        assert!(state.gather_reference(Vec::new(), 1).is_none());
    }

    #[test]
    fn test_replace_drops_gathered_rows() {
        let reading = Reading::new("m", 0).with_value("x", 1.0);
        let mut state = MonitorState::new(10);
        state.gather_reference(vec![TableRow::from(&reading)], 5);

        state.replace_reference("baseline", FeatureTable::from_readings(&[reading]), 1);
        assert!(state.pending_reference.is_empty());
    }
}
