//! Blob storage for reference snapshots and window checkpoints.
//!
//! Keys are `/`-separated. References live under `reference/`, checkpoints
//! under `checkpoint/`; both are zero-padded so lexical order is version or
//! time order.

use crate::error::{MonitorError, MonitorResult};
use crate::features::{self, FeatureSet};
use crate::source::JsonlSource;
use drift::{CurrentWindow, ReferenceOrigin, ReferenceSnapshot};
use parking_lot::Mutex;
use snapshot_format::{Snapshot, SnapshotKind};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use telemetry::WindowSpec;

pub trait BlobStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8]) -> MonitorResult<()>;

    fn get(&self, key: &str) -> MonitorResult<Option<Vec<u8>>>;

    /// Keys starting with `prefix`, sorted
    fn list(&self, prefix: &str) -> MonitorResult<Vec<String>>;
}

pub fn reference_key(name: &str, version: u32) -> String {
    format!("reference/{}-v{:06}.snap", name, version)
}

pub fn checkpoint_key(window_end_us: u64) -> String {
    format!("checkpoint/{:020}.snap", window_end_us)
}

pub fn save_reference(store: &dyn BlobStore, reference: &ReferenceSnapshot) -> MonitorResult<String> {
    let key = reference_key(&reference.name, reference.version);
    store.put(&key, &Snapshot::from_reference(reference).to_bytes()?)?;
    Ok(key)
}

/// Highest stored version of the named reference
pub fn load_reference(store: &dyn BlobStore, name: &str) -> MonitorResult<Option<ReferenceSnapshot>> {
    let prefix = format!("reference/{}-v", name);
    let Some(key) = store.list(&prefix)?.pop() else {
        return Ok(None);
    };
    let snapshot = decode(store, &key, SnapshotKind::Reference)?;
    Ok(snapshot.map(Snapshot::into_reference))
}

/// Reference from a file: an encoded `.snap` or a JSONL log of readings,
/// which is turned into `set` rows with `windows` first
pub fn read_reference_file(
    path: &Path,
    name: &str,
    windows: &[WindowSpec],
    set: FeatureSet,
) -> MonitorResult<ReferenceSnapshot> {
    let bytes = std::fs::read(path)?;
    if path.extension().is_some_and(|ext| ext == "snap") {
        let snapshot = Snapshot::from_bytes(&bytes)?;
        return Ok(snapshot.into_reference());
    }

    let readings = JsonlSource::new(path, usize::MAX).parse_lines(&String::from_utf8_lossy(&bytes));
    let table = features::table_from_readings(windows, &readings, set)
        .map_err(|e| MonitorError::Config(e.to_string()))?;
    Ok(ReferenceSnapshot::new(
        name,
        1,
        telemetry::now_us(),
        ReferenceOrigin::Loaded,
        table,
    ))
}

pub fn save_checkpoint(
    store: &dyn BlobStore,
    window: &CurrentWindow,
    batches: u64,
    created_at_us: u64,
) -> MonitorResult<String> {
    let window_end_us = window.rows().map(|r| r.key.timestamp_us).max().unwrap_or(created_at_us);
    let key = checkpoint_key(window_end_us);
    store.put(&key, &Snapshot::checkpoint(window, batches, created_at_us).to_bytes()?)?;
    Ok(key)
}

/// Newest checkpoint, refilled into a window of `capacity`
pub fn load_latest_checkpoint(
    store: &dyn BlobStore,
    capacity: usize,
) -> MonitorResult<Option<(CurrentWindow, u64)>> {
    let Some(key) = store.list("checkpoint/")?.pop() else {
        return Ok(None);
    };
    Ok(decode(store, &key, SnapshotKind::Checkpoint)?.map(|snapshot| {
        let batches = snapshot.metadata.batches;
        (snapshot.into_window(capacity), batches)
    }))
}

fn decode(store: &dyn BlobStore, key: &str, kind: SnapshotKind) -> MonitorResult<Option<Snapshot>> {
    let Some(bytes) = store.get(key)? else {
        return Ok(None);
    };
    let snapshot = Snapshot::from_bytes(&bytes)?;
    if snapshot.header.kind != kind {
        return Err(MonitorError::Store(format!(
            "{} holds a {:?} snapshot, expected {:?}",
            key, snapshot.header.kind, kind
        )));
    }
    Ok(Some(snapshot))
}

/// Files under a root directory, one per key
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &str) -> MonitorResult<PathBuf> {
        let mut path = self.root.clone();
        for part in key.split('/') {
            if part.is_empty() || part == "." || part == ".." {
                return Err(MonitorError::Store(format!("invalid key {:?}", key)));
            }
            path.push(part);
        }
        Ok(path)
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> MonitorResult<()> {
        let path = self.path_of(key)?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        // write then rename so readers never see a partial blob
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get(&self, key: &str) -> MonitorResult<Option<Vec<u8>>> {
        match std::fs::read(self.path_of(key)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> MonitorResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];

        while let Some((dir, key_prefix)) = pending.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = format!("{}{}", key_prefix, name);
                if entry.file_type()?.is_dir() {
                    pending.push((entry.path(), format!("{}/", key)));
                } else if key.starts_with(prefix) && !name.ends_with(".tmp") {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// In-memory store for tests and ephemeral runs
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> MonitorResult<()> {
        self.blobs.lock().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> MonitorResult<Option<Vec<u8>>> {
        Ok(self.blobs.lock().get(key).cloned())
    }

    fn list(&self, prefix: &str) -> MonitorResult<Vec<String>> {
        Ok(self
            .blobs
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift::{FeatureTable, ReferenceOrigin, TableRow};
    use telemetry::Reading;

    fn reference(version: u32) -> ReferenceSnapshot {
        let readings: Vec<Reading> = (0..3)
            .map(|i| Reading::new("machine_001", i).with_value("vibration", 45.0 + i as f64))
            .collect();
        ReferenceSnapshot::new(
            "baseline",
            version,
            100,
            ReferenceOrigin::Bootstrap,
            FeatureTable::from_readings(&readings),
        )
    }

    #[test]
    fn test_keys_sort_by_version() {
        assert!(reference_key("baseline", 9) < reference_key("baseline", 10));
        assert!(checkpoint_key(999) < checkpoint_key(1_000));
    }

    #[test]
    fn test_latest_reference_wins() {
        let store = MemoryBlobStore::new();
        assert!(load_reference(&store, "baseline").unwrap().is_none());

        save_reference(&store, &reference(1)).unwrap();
        save_reference(&store, &reference(2)).unwrap();

        let loaded = load_reference(&store, "baseline").unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.origin, ReferenceOrigin::Loaded);
        assert_eq!(loaded.table(), reference(2).table());
    }

    #[test]
    fn test_fs_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        save_reference(&store, &reference(1)).unwrap();
        let mut window = CurrentWindow::new(10);
        window.push(TableRow::from(&Reading::new("machine_001", 7).with_value("vibration", 50.0)));
        let key = save_checkpoint(&store, &window, 5, 8).unwrap();
        assert_eq!(key, checkpoint_key(7));

        assert_eq!(store.list("").unwrap().len(), 2);
        assert_eq!(store.list("reference/").unwrap(), vec![reference_key("baseline", 1)]);

        let (restored, batches) = load_latest_checkpoint(&store, 10).unwrap().unwrap();
        assert_eq!(batches, 5);
        assert_eq!(restored, window);
        assert!(store.get("checkpoint/missing.snap").unwrap().is_none());
    }

    #[test]
    fn test_kind_mismatch_is_an_error() {
        let store = MemoryBlobStore::new();
        let bytes = Snapshot::checkpoint(&CurrentWindow::new(1), 0, 0).to_bytes().unwrap();
        store.put(&reference_key("baseline", 1), &bytes).unwrap();

        assert!(matches!(load_reference(&store, "baseline"), Err(MonitorError::Store(_))));
    }

    #[test]
    fn test_reference_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let windows = vec![WindowSpec::count("1h", 2)];

        let jsonl = dir.path().join("reference.jsonl");
        std::fs::write(
            &jsonl,
            "{\"machine_id\":\"machine_001\",\"vibration\":44.0}\n{\"machine_id\":\"machine_001\",\"vibration\":46.0}\n",
        )
        .unwrap();
        let from_log = read_reference_file(&jsonl, "baseline", &windows, FeatureSet::Windowed).unwrap();
        assert_eq!(from_log.len(), 2);
        assert_eq!(from_log.table().values("vibration_mean_1h"), vec![45.0]);

        let raw = read_reference_file(&jsonl, "baseline", &windows, FeatureSet::Raw).unwrap();
        assert_eq!(raw.table().values("vibration"), vec![44.0, 46.0]);
        assert!(raw.table().values("vibration_mean_1h").is_empty());

        let snap = dir.path().join("reference.snap");
        std::fs::write(&snap, Snapshot::from_reference(&reference(3)).to_bytes().unwrap()).unwrap();
        let from_snap = read_reference_file(&snap, "ignored", &windows, FeatureSet::Raw).unwrap();
        assert_eq!(from_snap.version, 3);
        assert_eq!(from_snap.name, "baseline");
    }

    #[test]
    fn test_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(store.put("../outside", b"x").is_err());
    }
}
