use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::WimError;
use crate::format::CHUNK_SIZE;
use crate::types::{ResourceRecord, Result};

/// Chunk table of a compressed resource being written.
///
/// On disk the table is an array of byte offsets, one per chunk, located
/// before the chunk payloads. Each offset is relative to the end of the
/// table. The first offset is always zero and is omitted from the stored
/// form, so a single-chunk resource has an empty table.
#[derive(Debug)]
pub(crate) struct ChunkTable {
    file_offset: u64,
    num_chunks: u64,
    entry_width: u64,
    table_disk_size: u64,
    cur_offset: u64,
    offsets: Vec<u64>,
}

impl ChunkTable {
    /// Entries are 4 bytes wide unless the uncompressed size needs more.
    pub fn entry_width_for(original_size: u64) -> u64 {
        if original_size >= 1 << 32 { 8 } else { 4 }
    }

    pub fn chunk_count_for(original_size: u64) -> u64 {
        original_size.div_ceil(CHUNK_SIZE as u64)
    }

    /// Starts a chunk table at the current output position, reserving its
    /// stored size with zero bytes so the chunk payloads can follow
    /// immediately. The reserved bytes are patched by [`ChunkTable::finish`].
    pub fn begin(original_size: u64, out: &mut File) -> Result<Self> {
        let file_offset = out.stream_position().map_err(WimError::Write)?;
        let num_chunks = Self::chunk_count_for(original_size);
        let entry_width = Self::entry_width_for(original_size);
        let table_disk_size = entry_width * (num_chunks - 1);

        let zeros = [0u8; 4096];
        let mut remaining = table_disk_size;
        while remaining > 0 {
            let step = remaining.min(zeros.len() as u64) as usize;
            out.write_all(&zeros[..step]).map_err(WimError::Write)?;
            remaining -= step as u64;
        }

        Ok(Self {
            file_offset,
            num_chunks,
            entry_width,
            table_disk_size,
            cur_offset: 0,
            offsets: Vec::with_capacity(num_chunks as usize),
        })
    }

    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    pub fn num_chunks(&self) -> u64 {
        self.num_chunks
    }

    /// Records the stored size of the next chunk, in index order.
    pub fn record_chunk(&mut self, stored_size: u64) {
        debug_assert!((self.offsets.len() as u64) < self.num_chunks);
        self.offsets.push(self.cur_offset);
        self.cur_offset += stored_size;
    }

    /// Seeks back and patches the reserved table bytes, then returns to the
    /// end of the file. Returns the stored size of the whole resource (table
    /// plus payload).
    pub fn finish(&self, out: &mut File) -> Result<u64> {
        debug_assert_eq!(self.offsets.len() as u64, self.num_chunks);
        out.seek(SeekFrom::Start(self.file_offset))
            .map_err(WimError::Write)?;

        let mut encoded = Vec::with_capacity(self.table_disk_size as usize);
        for &offset in &self.offsets[1..] {
            match self.entry_width {
                4 => encoded.extend_from_slice(&(offset as u32).to_le_bytes()),
                _ => encoded.extend_from_slice(&offset.to_le_bytes()),
            }
        }
        out.write_all(&encoded).map_err(WimError::Write)?;
        out.seek(SeekFrom::End(0)).map_err(WimError::Write)?;
        Ok(self.cur_offset + self.table_disk_size)
    }
}

/// Parsed chunk boundaries of a compressed resource being read.
///
/// `bounds` has one entry per chunk plus a terminator, each relative to
/// `payload_start`, so chunk `i` occupies `bounds[i]..bounds[i + 1]`.
#[derive(Debug)]
pub(crate) struct ChunkOffsets {
    pub payload_start: u64,
    pub bounds: Vec<u64>,
}

impl ChunkOffsets {
    pub fn read(file: &mut File, record: &ResourceRecord) -> Result<Self> {
        let num_chunks = ChunkTable::chunk_count_for(record.original_size);
        let entry_width = ChunkTable::entry_width_for(record.original_size);
        let table_disk_size = entry_width * (num_chunks - 1);
        if table_disk_size > record.size {
            return Err(WimError::InvalidFormat(
                "resource is too small to hold its chunk table",
            ));
        }

        file.seek(SeekFrom::Start(record.offset))
            .map_err(WimError::Read)?;
        let mut raw = vec![0u8; table_disk_size as usize];
        file.read_exact(&mut raw).map_err(WimError::Read)?;

        let payload_size = record.size - table_disk_size;
        let mut bounds = Vec::with_capacity(num_chunks as usize + 1);
        bounds.push(0);
        for entry in raw.chunks_exact(entry_width as usize) {
            let offset = match entry_width {
                4 => u32::from_le_bytes(entry.try_into().expect("entry is 4 bytes")) as u64,
                _ => u64::from_le_bytes(entry.try_into().expect("entry is 8 bytes")),
            };
            bounds.push(offset);
        }
        bounds.push(payload_size);

        if bounds.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(WimError::InvalidFormat(
                "chunk offsets are not strictly increasing",
            ));
        }

        Ok(Self {
            payload_start: record.offset + table_disk_size,
            bounds,
        })
    }

    pub fn chunk_span(&self, index: usize) -> (u64, u64) {
        let start = self.bounds[index];
        (self.payload_start + start, self.bounds[index + 1] - start)
    }
}
