//! Append-only flat L2 vector index
//!
//! Rows are stored contiguously in insertion order. The row position is the
//! join key with the metadata ledger, so nothing here ever reorders or removes
//! committed rows.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{Result, VsError};

const MAGIC: &[u8; 4] = b"VSIX";
const FORMAT_VERSION: u32 = 1;
const DIGEST_LEN: usize = 32;

/// Map a squared L2 distance to a similarity score in (0, 1].
pub fn similarity(distance: f32) -> f32 {
    1.0 / (1.0 + distance.max(0.0))
}

/// Flat (exhaustive) index over fixed-dimension vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    dimension: usize,
    keys: Vec<u64>,
    data: Vec<f32>,
}

impl VectorIndex {
    /// Create an empty index for vectors of `dimension` components.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            keys: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Row key stored at `row`. Keys always equal their position.
    pub fn key(&self, row: usize) -> Option<u64> {
        self.keys.get(row).copied()
    }

    /// Vector stored at `row`.
    pub fn get(&self, row: usize) -> Option<&[f32]> {
        let start = row.checked_mul(self.dimension)?;
        self.data.get(start..start + self.dimension)
    }

    /// Append vectors in call order. Either all vectors are added or none.
    pub fn add(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dimension) {
            return Err(VsError::Encoding(format!(
                "vector has dimension {}, index expects {}",
                bad.len(),
                self.dimension
            )));
        }

        self.data.reserve(vectors.len() * self.dimension);
        for vector in vectors {
            let key = self.keys.len() as u64;
            self.keys.push(key);
            self.data.extend_from_slice(vector);
        }
        Ok(())
    }

    /// Drop uncommitted rows past `len`.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.keys.truncate(len);
        self.data.truncate(len * self.dimension);
    }

    /// Return up to `k` `(distance, row)` pairs nearest to `query`, ascending
    /// by squared L2 distance with ties broken by row position.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(f32, usize)>> {
        if query.len() != self.dimension {
            return Err(VsError::Query(format!(
                "query has dimension {}, index expects {}",
                query.len(),
                self.dimension
            )));
        }
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(f32, usize)> = self
            .data
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(row, vector)| (squared_l2(query, vector), row))
            .collect();

        let k = k.min(scored.len());
        if k < scored.len() {
            scored.select_nth_unstable_by(k - 1, compare_hits);
            scored.truncate(k);
        }
        scored.sort_by(compare_hits);

        Ok(scored)
    }

    /// Persist every row to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut buf = Vec::with_capacity(24 + self.keys.len() * (8 + 4 * self.dimension));
        buf.extend_from_slice(MAGIC);
        buf.write_u32::<LittleEndian>(FORMAT_VERSION)?;
        buf.write_u32::<LittleEndian>(self.dimension as u32)?;
        buf.write_u64::<LittleEndian>(self.keys.len() as u64)?;
        for key in &self.keys {
            buf.write_u64::<LittleEndian>(*key)?;
        }
        for value in &self.data {
            buf.write_f32::<LittleEndian>(*value)?;
        }
        let digest = blake3::hash(&buf);

        let file = File::create(path)
            .map_err(|e| VsError::Persistence(format!("{}: {}", path.display(), e)))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&buf)?;
        writer.write_all(digest.as_bytes())?;
        let file = writer
            .into_inner()
            .map_err(|e| VsError::Persistence(format!("{}: {}", path.display(), e)))?;
        file.sync_all()?;
        Ok(())
    }

    /// Load a snapshot written by [`VectorIndex::save`], rows in original order.
    pub fn load(path: &Path) -> Result<Self> {
        let mut bytes = Vec::new();
        File::open(path)
            .and_then(|mut f| f.read_to_end(&mut bytes))
            .map_err(|e| VsError::Persistence(format!("{}: {}", path.display(), e)))?;

        let corrupt = |what: &str| VsError::Persistence(format!("{}: {}", path.display(), what));

        if bytes.len() < MAGIC.len() + 16 + DIGEST_LEN {
            return Err(corrupt("truncated index snapshot"));
        }
        let (body, digest) = bytes.split_at(bytes.len() - DIGEST_LEN);
        if blake3::hash(body).as_bytes() != digest {
            return Err(corrupt("index snapshot checksum mismatch"));
        }

        let mut cursor = Cursor::new(body);
        let mut magic = [0u8; 4];
        cursor.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(corrupt("not an index snapshot"));
        }
        let version = cursor.read_u32::<LittleEndian>()?;
        if version != FORMAT_VERSION {
            return Err(corrupt(&format!("unsupported snapshot version {}", version)));
        }
        let dimension = cursor.read_u32::<LittleEndian>()? as usize;
        let count = cursor.read_u64::<LittleEndian>()? as usize;

        let expected = count
            .checked_mul(8 + 4 * dimension)
            .and_then(|n| n.checked_add(cursor.position() as usize));
        if expected != Some(body.len()) {
            return Err(corrupt("index snapshot size does not match row count"));
        }

        let mut keys = Vec::with_capacity(count);
        for _ in 0..count {
            keys.push(cursor.read_u64::<LittleEndian>()?);
        }
        let mut data = vec![0f32; count * dimension];
        cursor.read_f32_into::<LittleEndian>(&mut data)?;

        Ok(Self {
            dimension,
            keys,
            data,
        })
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

fn compare_hits(a: &(f32, usize), b: &(f32, usize)) -> Ordering {
    a.0.total_cmp(&b.0).then(a.1.cmp(&b.1))
}
