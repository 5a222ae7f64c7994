//! Persistent tree catalog.
//!
//! `persist()` snapshots the tree's shape — the logical clock, the
//! record count, and per-level geometry plus the run files backing each
//! level — into one CRC-protected file. `reopen()` replays exactly what
//! the snapshot names: there is no write-ahead log, so anything not yet
//! flushed into a run at persist time is gone by design.
//!
//! The catalog is written atomically (`catalog.sdb.tmp` → rename) so a
//! crash mid-persist leaves the previous snapshot intact.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::encoding::{self, Decode, Encode, EncodingError};

const CATALOG_MAGIC: [u8; 4] = *b"SCAT";
const CATALOG_VERSION: u32 = 1;
const CATALOG_FILE: &str = "catalog.sdb";

/// Errors raised while saving or loading the catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Snapshot encode/decode failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The snapshot file is damaged or from a different format.
    #[error("corrupted catalog: {0}")]
    Corrupted(String),
}

/// Geometry and backing files of one persisted level.
pub struct CatalogLevel {
    /// Run slots at this level.
    pub run_capacity: u64,
    /// Record budget at this level.
    pub record_capacity: u64,
    /// Whether the level lives in RAM when the tree is open.
    pub memory_resident: bool,
    /// Backing run files, oldest first.
    pub files: Vec<u32>,
}

impl Encode for CatalogLevel {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.run_capacity.encode_to(buf)?;
        self.record_capacity.encode_to(buf)?;
        self.memory_resident.encode_to(buf)?;
        encoding::encode_vec(&self.files, buf)?;
        Ok(())
    }
}

impl Decode for CatalogLevel {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (run_capacity, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (record_capacity, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (memory_resident, n) = bool::decode_from(&buf[off..])?;
        off += n;
        let (files, n) = encoding::decode_vec::<u32>(&buf[off..])?;
        off += n;
        Ok((
            Self {
                run_capacity,
                record_capacity,
                memory_resident,
                files,
            },
            off,
        ))
    }
}

/// A complete persisted snapshot of the tree's shape.
pub struct Catalog {
    /// Next timestamp to hand out.
    pub clock: u64,
    /// Total records at persist time, tombstones included.
    pub record_count: u64,
    /// Levels, shallowest first.
    pub levels: Vec<CatalogLevel>,
}

struct CatalogFile {
    magic: [u8; 4],
    version: u32,
    clock: u64,
    record_count: u64,
    levels: Vec<CatalogLevel>,
    crc: u32,
}

impl Encode for CatalogFile {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.magic.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.clock.encode_to(buf)?;
        self.record_count.encode_to(buf)?;
        encoding::encode_vec(&self.levels, buf)?;
        self.crc.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for CatalogFile {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (magic, n) = <[u8; 4]>::decode_from(&buf[off..])?;
        off += n;
        let (version, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (clock, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (record_count, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (levels, n) = encoding::decode_vec::<CatalogLevel>(&buf[off..])?;
        off += n;
        let (crc, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                magic,
                version,
                clock,
                record_count,
                levels,
                crc,
            },
            off,
        ))
    }
}

fn catalog_path(dir: &Path) -> PathBuf {
    dir.join(CATALOG_FILE)
}

impl Catalog {
    /// Atomically writes the snapshot under `dir`.
    pub fn save(self, dir: &Path) -> Result<(), CatalogError> {
        let mut file = CatalogFile {
            magic: CATALOG_MAGIC,
            version: CATALOG_VERSION,
            clock: self.clock,
            record_count: self.record_count,
            levels: self.levels,
            crc: 0,
        };

        let body = encoding::encode_to_vec(&file)?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&body);
        file.crc = hasher.finalize();
        let bytes = encoding::encode_to_vec(&file)?;

        let tmp = dir.join(format!("{CATALOG_FILE}.tmp"));
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, catalog_path(dir))?;
        Ok(())
    }

    /// Loads and verifies a snapshot from `dir`.
    pub fn load(dir: &Path) -> Result<Self, CatalogError> {
        let bytes = std::fs::read(catalog_path(dir))?;
        let (file, _) = encoding::decode_from_slice::<CatalogFile>(&bytes)?;

        if file.magic != CATALOG_MAGIC {
            return Err(CatalogError::Corrupted("catalog magic mismatch".into()));
        }
        if file.version != CATALOG_VERSION {
            return Err(CatalogError::Corrupted("catalog version mismatch".into()));
        }

        let stored_crc = file.crc;
        let zeroed = CatalogFile { crc: 0, ..file };
        let body = encoding::encode_to_vec(&zeroed)?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&body);
        if hasher.finalize() != stored_crc {
            return Err(CatalogError::Corrupted("catalog checksum mismatch".into()));
        }

        Ok(Self {
            clock: zeroed.clock,
            record_count: zeroed.record_count,
            levels: zeroed.levels,
        })
    }

    /// True when a snapshot exists under `dir`.
    pub fn exists(dir: &Path) -> bool {
        catalog_path(dir).exists()
    }
}
