//! Snapshot Binary Format
//!
//! Binary container for columnar feature snapshots (reference baselines and
//! current-window checkpoints). One row per feature row, keyed by entity id
//! and window end time.
//! Layout: [Header][Columns][Metadata][Checksum]

use drift::{CurrentWindow, FeatureTable, ReferenceOrigin, ReferenceSnapshot, RowKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use thiserror::Error;

/// Magic bytes: "DRS1"
pub const MAGIC: [u8; 4] = *b"DRS1";

/// Current format version
pub const VERSION: u16 = 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("data too short: {0} bytes")]
    Truncated(usize),

    #[error("invalid magic: {0:?}")]
    BadMagic([u8; 4]),

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u16),

    #[error("unknown snapshot kind: {0}")]
    UnknownKind(u8),

    #[error("CRC mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("section sizes exceed payload")]
    Layout,

    #[error("column layout: {0}")]
    Columns(String),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("csv: {0}")]
    Csv(#[from] csv::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Snapshot kind discriminant
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotKind {
    Reference = 0,
    Checkpoint = 1,
}

impl SnapshotKind {
    fn from_u8(value: u8) -> SnapshotResult<Self> {
        match value {
            0 => Ok(SnapshotKind::Reference),
            1 => Ok(SnapshotKind::Checkpoint),
            other => Err(SnapshotError::UnknownKind(other)),
        }
    }
}

/// Snapshot file header (fixed size)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub magic: [u8; 4],
    pub version: u16,
    pub kind: SnapshotKind,
    pub row_count: u32,
    pub column_count: u32,
    pub created_at_us: u64,
    pub columns_size_bytes: u32,
    pub metadata_size_bytes: u32,
}

impl SnapshotHeader {
    pub const SIZE: usize = 31; // 4 + 2 + 1 + 4 + 4 + 8 + 4 + 4

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.magic);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.row_count.to_le_bytes());
        buf.extend_from_slice(&self.column_count.to_le_bytes());
        buf.extend_from_slice(&self.created_at_us.to_le_bytes());
        buf.extend_from_slice(&self.columns_size_bytes.to_le_bytes());
        buf.extend_from_slice(&self.metadata_size_bytes.to_le_bytes());

        let mut result = [0u8; Self::SIZE];
        result.copy_from_slice(&buf);
        result
    }

    pub fn from_bytes(bytes: &[u8]) -> SnapshotResult<Self> {
        if bytes.len() < Self::SIZE {
            return Err(SnapshotError::Truncated(bytes.len()));
        }

        let mut offset = 0;

        let magic: [u8; 4] = field(bytes, &mut offset);
        let version = u16::from_le_bytes(field(bytes, &mut offset));
        let kind = u8::from_le_bytes(field(bytes, &mut offset));
        let row_count = u32::from_le_bytes(field(bytes, &mut offset));
        let column_count = u32::from_le_bytes(field(bytes, &mut offset));
        let created_at_us = u64::from_le_bytes(field(bytes, &mut offset));
        let columns_size_bytes = u32::from_le_bytes(field(bytes, &mut offset));
        let metadata_size_bytes = u32::from_le_bytes(field(bytes, &mut offset));

        if magic != MAGIC {
            return Err(SnapshotError::BadMagic(magic));
        }
        if version != VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }

        Ok(Self {
            magic,
            version,
            kind: SnapshotKind::from_u8(kind)?,
            row_count,
            column_count,
            created_at_us,
            columns_size_bytes,
            metadata_size_bytes,
        })
    }
}

/// Read `N` bytes at `offset` and advance it. Callers check the length.
fn field<const N: usize>(bytes: &[u8], offset: &mut usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[*offset..*offset + N]);
    *offset += N;
    out
}

/// Column section: key columns plus one column per feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Columns {
    entity_id: Vec<String>,
    window_end_us: Vec<u64>,
    features: BTreeMap<String, Vec<Option<f64>>>,
}

/// Metadata section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub name: String,
    pub version: u32,
    pub origin: Option<ReferenceOrigin>,
    /// Collection batches ingested when the checkpoint was taken
    pub batches: u64,
    pub notes: String,
}

/// Decoded snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub header: SnapshotHeader,
    pub table: FeatureTable,
    pub metadata: SnapshotMetadata,
}

impl Snapshot {
    pub fn new(
        kind: SnapshotKind,
        table: FeatureTable,
        metadata: SnapshotMetadata,
        created_at_us: u64,
    ) -> Self {
        let header = SnapshotHeader {
            magic: MAGIC,
            version: VERSION,
            kind,
            row_count: table.len() as u32,
            column_count: table.columns().len() as u32,
            created_at_us,
            columns_size_bytes: 0,
            metadata_size_bytes: 0,
        };
        Self {
            header,
            table,
            metadata,
        }
    }

    pub fn from_reference(reference: &ReferenceSnapshot) -> Self {
        Self::new(
            SnapshotKind::Reference,
            reference.table().clone(),
            SnapshotMetadata {
                name: reference.name.clone(),
                version: reference.version,
                origin: Some(reference.origin),
                batches: 0,
                notes: String::new(),
            },
            reference.created_at_us,
        )
    }

    pub fn checkpoint(window: &CurrentWindow, batches: u64, created_at_us: u64) -> Self {
        Self::new(
            SnapshotKind::Checkpoint,
            window.to_table(),
            SnapshotMetadata {
                name: String::from("current"),
                version: 0,
                origin: None,
                batches,
                notes: format!("capacity={}", window.capacity()),
            },
            created_at_us,
        )
    }

    /// Reference snapshot as it was stored, marked as loaded
    pub fn into_reference(self) -> ReferenceSnapshot {
        ReferenceSnapshot::new(
            self.metadata.name,
            self.metadata.version,
            self.header.created_at_us,
            ReferenceOrigin::Loaded,
            self.table,
        )
    }

    /// Refill a window, oldest row first
    pub fn into_window(self, capacity: usize) -> CurrentWindow {
        let mut window = CurrentWindow::new(capacity);
        window.extend(self.table.to_rows());
        window
    }

    /// Serialize to binary format
    pub fn to_bytes(&self) -> SnapshotResult<Vec<u8>> {
        let mut buf = Vec::new();

        let columns = Columns {
            entity_id: self.table.keys().iter().map(|k| k.entity_id.clone()).collect(),
            window_end_us: self.table.keys().iter().map(|k| k.timestamp_us).collect(),
            features: self.table.columns().clone(),
        };
        let columns_bytes = serde_json::to_vec(&columns)?;
        let metadata_bytes = serde_json::to_vec(&self.metadata)?;

        let header = SnapshotHeader {
            row_count: self.table.len() as u32,
            column_count: self.table.columns().len() as u32,
            columns_size_bytes: columns_bytes.len() as u32,
            metadata_size_bytes: metadata_bytes.len() as u32,
            ..self.header
        };

        buf.write_all(&header.to_bytes())?;
        buf.write_all(&columns_bytes)?;
        buf.write_all(&metadata_bytes)?;

        let crc = crc32fast::hash(&buf);
        buf.write_all(&crc.to_le_bytes())?;

        Ok(buf)
    }

    /// Deserialize from binary format
    pub fn from_bytes(data: &[u8]) -> SnapshotResult<Self> {
        if data.len() < SnapshotHeader::SIZE + 4 {
            return Err(SnapshotError::Truncated(data.len()));
        }

        let payload_len = data.len() - 4;
        let payload = &data[..payload_len];
        let mut crc_offset = payload_len;
        let expected = u32::from_le_bytes(field(data, &mut crc_offset));
        let actual = crc32fast::hash(payload);
        if actual != expected {
            return Err(SnapshotError::ChecksumMismatch { expected, actual });
        }

        let header = SnapshotHeader::from_bytes(&payload[..SnapshotHeader::SIZE])?;

        let columns_end = SnapshotHeader::SIZE + header.columns_size_bytes as usize;
        let metadata_end = columns_end + header.metadata_size_bytes as usize;
        if metadata_end > payload_len {
            return Err(SnapshotError::Layout);
        }

        let columns: Columns = serde_json::from_slice(&payload[SnapshotHeader::SIZE..columns_end])?;
        let metadata: SnapshotMetadata = serde_json::from_slice(&payload[columns_end..metadata_end])?;

        if columns.entity_id.len() != columns.window_end_us.len() {
            return Err(SnapshotError::Columns(String::from("key columns differ in length")));
        }
        let keys = columns
            .entity_id
            .into_iter()
            .zip(columns.window_end_us)
            .map(|(entity_id, timestamp_us)| RowKey {
                entity_id,
                timestamp_us,
            })
            .collect();
        let table =
            FeatureTable::from_columns(keys, columns.features).map_err(SnapshotError::Columns)?;

        Ok(Snapshot {
            header,
            table,
            metadata,
        })
    }
}

/// Write a table as CSV: `entity_id,window_end_us,<features...>`
pub fn write_csv<W: Write>(table: &FeatureTable, writer: W) -> SnapshotResult<()> {
    let mut out = csv::Writer::from_writer(writer);

    let mut header = vec![String::from("entity_id"), String::from("window_end_us")];
    header.extend(table.column_names().map(String::from));
    out.write_record(&header)?;

    for (i, key) in table.keys().iter().enumerate() {
        let mut record = vec![key.entity_id.clone(), key.timestamp_us.to_string()];
        record.extend(
            table
                .columns()
                .values()
                .map(|cells| cells[i].map(|v| v.to_string()).unwrap_or_default()),
        );
        out.write_record(&record)?;
    }

    out.flush()?;
    Ok(())
}
