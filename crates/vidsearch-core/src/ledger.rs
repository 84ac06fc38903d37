//! Metadata ledger: one record per index row, in row order

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Result, VsError};

/// Current ledger envelope version.
pub const LEDGER_VERSION: u32 = 1;

/// Metadata for one sampled frame, stored at the same position as its vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    /// Row key; always equal to the record's position in the ledger
    pub row: u64,
    /// Identifier of the source video (its file stem)
    pub video_id: String,
    /// Offset of the frame into the video, in seconds
    pub timestamp: f64,
    /// Where the thumbnail for this frame was written
    pub thumbnail_path: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    records: Vec<FrameRecord>,
}

/// Ordered record store kept in lockstep with the vector index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataLedger {
    records: Vec<FrameRecord>,
}

impl MetadataLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, row: usize) -> Option<&FrameRecord> {
        self.records.get(row)
    }

    pub fn records(&self) -> &[FrameRecord] {
        &self.records
    }

    /// Whether any record belongs to `video_id`.
    pub fn contains_video(&self, video_id: &str) -> bool {
        self.records.iter().any(|r| r.video_id == video_id)
    }

    /// Append one record at the next position. The record's `row` is assigned here.
    pub fn append(&mut self, video_id: &str, timestamp: f64, thumbnail_path: PathBuf) -> u64 {
        let row = self.records.len() as u64;
        self.records.push(FrameRecord {
            row,
            video_id: video_id.to_string(),
            timestamp,
            thumbnail_path,
        });
        row
    }

    /// Drop uncommitted records past `len`.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.records.truncate(len);
    }

    /// Load the ledger from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| VsError::Persistence(format!("{}: {}", path.display(), e)))?;
        let ledger: LedgerFile = serde_json::from_reader(BufReader::new(file))?;
        if ledger.version > LEDGER_VERSION {
            return Err(VsError::Persistence(format!(
                "{}: ledger version {} is newer than supported version {}",
                path.display(),
                ledger.version,
                LEDGER_VERSION
            )));
        }
        Ok(Self {
            records: ledger.records,
        })
    }

    /// Save the ledger to disk.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .map_err(|e| VsError::Persistence(format!("{}: {}", path.display(), e)))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(
            &mut writer,
            &LedgerFile {
                version: LEDGER_VERSION,
                records: self.records.clone(),
            },
        )?;
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| VsError::Persistence(format!("{}: {}", path.display(), e)))?;
        file.sync_all()?;
        Ok(())
    }
}
