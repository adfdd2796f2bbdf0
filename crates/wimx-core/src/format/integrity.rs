use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use rayon::prelude::*;

use crate::error::WimError;
use crate::hash::{StreamHash, HASH_SIZE};
use crate::types::{ResourceFlags, ResourceRecord, Result};
use crate::writer::{IntegrityProgress, ProgressSink};

use super::{HEADER_SIZE, INTEGRITY_CHUNK_SIZE};

/// How many integrity chunks are read ahead of hashing; bounds the memory
/// spent on in-flight chunk buffers.
const HASH_BATCH: usize = 8;

/// Whole-archive integrity table: SHA-1 checksums over fixed-size spans of
/// the file, covering everything between the header and the end of the
/// lookup table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityTable {
    pub chunk_size: u32,
    pub entries: Vec<StreamHash>,
}

impl IntegrityTable {
    fn disk_size(&self) -> u64 {
        12 + (self.entries.len() * HASH_SIZE) as u64
    }

    /// Byte offset one past the last span this table covers.
    pub fn covered_end(&self) -> u64 {
        HEADER_SIZE as u64 + self.entries.len() as u64 * self.chunk_size as u64
    }

    /// Verifies the covered range of `file` against the stored checksums.
    pub fn verify(&self, file: &mut File, covered_end: u64, sink: &mut dyn ProgressSink) -> Result<bool> {
        let fresh = compute_entries(file, covered_end, self.chunk_size, 0, None, sink)?;
        Ok(fresh == self.entries)
    }
}

/// Reads an integrity table from an existing archive.
pub fn read_integrity_table(file: &mut File, record: &ResourceRecord) -> Result<IntegrityTable> {
    file.seek(SeekFrom::Start(record.offset))
        .map_err(WimError::Read)?;
    let mut fixed = [0u8; 12];
    file.read_exact(&mut fixed).map_err(WimError::Read)?;

    let table_size = u32::from_le_bytes(fixed[..4].try_into().expect("slice is 4 bytes"));
    let entry_count = u32::from_le_bytes(fixed[4..8].try_into().expect("slice is 4 bytes"));
    let chunk_size = u32::from_le_bytes(fixed[8..12].try_into().expect("slice is 4 bytes"));
    if chunk_size == 0 {
        return Err(WimError::InvalidFormat("integrity chunk size is zero"));
    }
    if table_size as u64 != 12 + entry_count as u64 * HASH_SIZE as u64 {
        return Err(WimError::InvalidFormat(
            "integrity table size disagrees with its entry count",
        ));
    }

    let mut entries = Vec::with_capacity(entry_count as usize);
    let mut raw = vec![0u8; entry_count as usize * HASH_SIZE];
    file.read_exact(&mut raw).map_err(WimError::Read)?;
    for hash in raw.chunks_exact(HASH_SIZE) {
        entries.push(StreamHash(hash.try_into().expect("20-byte hash")));
    }
    Ok(IntegrityTable {
        chunk_size,
        entries,
    })
}

/// Computes and appends the integrity table at the current end of the file.
///
/// Checksums cover `HEADER_SIZE..new_lut_end`. Spans that already lay fully
/// inside `..old_lut_end` can be reused from the previous table instead of
/// being rehashed, which keeps appends from rereading the whole archive.
pub fn write_integrity_table(
    out: &mut File,
    new_lut_end: u64,
    old_lut_end: u64,
    old_table: Option<&IntegrityTable>,
    sink: &mut dyn ProgressSink,
) -> Result<ResourceRecord> {
    let entries = compute_entries(
        out,
        new_lut_end,
        INTEGRITY_CHUNK_SIZE as u32,
        old_lut_end,
        old_table,
        sink,
    )?;
    let table = IntegrityTable {
        chunk_size: INTEGRITY_CHUNK_SIZE as u32,
        entries,
    };

    let offset = out.seek(SeekFrom::End(0)).map_err(WimError::Write)?;
    let mut bytes = Vec::with_capacity(table.disk_size() as usize);
    bytes.extend_from_slice(&(table.disk_size() as u32).to_le_bytes());
    bytes.extend_from_slice(&(table.entries.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&table.chunk_size.to_le_bytes());
    for entry in &table.entries {
        bytes.extend_from_slice(entry.as_bytes());
    }
    out.write_all(&bytes).map_err(WimError::Write)?;

    Ok(ResourceRecord {
        offset,
        size: bytes.len() as u64,
        original_size: bytes.len() as u64,
        flags: ResourceFlags::empty(),
    })
}

fn compute_entries(
    file: &mut File,
    covered_end: u64,
    chunk_size: u32,
    old_lut_end: u64,
    old_table: Option<&IntegrityTable>,
    sink: &mut dyn ProgressSink,
) -> Result<Vec<StreamHash>> {
    if covered_end < HEADER_SIZE as u64 {
        return Err(WimError::InvalidParam(
            "integrity range ends inside the header",
        ));
    }
    let covered = covered_end - HEADER_SIZE as u64;
    let total_chunks = covered.div_ceil(chunk_size as u64);

    let mut progress = IntegrityProgress {
        total_chunks,
        completed_chunks: 0,
    };
    sink.on_integrity(&progress);

    let span_end = |index: u64| (HEADER_SIZE as u64 + (index + 1) * chunk_size as u64).min(covered_end);
    // A span fully inside the previously covered range keeps its old checksum.
    let reusable = |index: u64| {
        old_table.is_some_and(|old| {
            old.chunk_size == chunk_size
                && span_end(index) <= old_lut_end
                && (index as usize) < old.entries.len()
        })
    };

    let mut entries: Vec<StreamHash> = Vec::with_capacity(total_chunks as usize);
    file.seek(SeekFrom::Start(HEADER_SIZE as u64))
        .map_err(WimError::Read)?;

    while (entries.len() as u64) < total_chunks {
        let index = entries.len() as u64;

        if reusable(index) {
            let old = old_table.expect("reusable implies an old table");
            file.seek(SeekFrom::Start(span_end(index)))
                .map_err(WimError::Read)?;
            entries.push(old.entries[index as usize]);
            progress.completed_chunks += 1;
            sink.on_integrity(&progress);
            continue;
        }

        // Read a batch sequentially, then hash it in parallel.
        let mut batch = Vec::with_capacity(HASH_BATCH);
        while batch.len() < HASH_BATCH {
            let batch_index = index + batch.len() as u64;
            if batch_index >= total_chunks || reusable(batch_index) {
                break;
            }
            let start = HEADER_SIZE as u64 + batch_index * chunk_size as u64;
            let mut buf = vec![0u8; (span_end(batch_index) - start) as usize];
            file.read_exact(&mut buf).map_err(WimError::Read)?;
            batch.push(buf);
        }

        let hashed: Vec<StreamHash> = batch.par_iter().map(|buf| StreamHash::of(buf)).collect();
        for hash in hashed {
            entries.push(hash);
            progress.completed_chunks += 1;
            sink.on_integrity(&progress);
        }
    }

    Ok(entries)
}
