use std::cmp::min;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};

use crate::compression::compress_chunk;
use crate::error::WimError;
use crate::format::{StreamEntry, CHUNK_SIZE};
use crate::hash::StreamDigest;
use crate::types::{CompressionKind, ResourceFlags, ResourceRecord, Result};

use super::chunk_table::ChunkTable;
use super::reader::ResourceReader;

/// Writes one stream at the current output position and returns its resource
/// record.
///
/// The stream is read from its source in `CHUNK_SIZE` slices. With a
/// compressed output kind each slice is compressed independently and a chunk
/// table is patched in front of the payload once all chunk sizes are known.
/// A slice that does not shrink is stored raw; the on-disk format expresses
/// that purely through the chunk offsets, with no marker bit.
///
/// When the source already stores the stream in the requested kind (and no
/// recompression was asked for), the stored bytes are copied verbatim and
/// hashing is skipped entirely.
///
/// If the compressed form ends up at least as large as the original, the
/// stream is rewritten uncompressed in place and the file is truncated back;
/// the returned record then has the `COMPRESSED` flag clear.
pub(crate) fn write_stream(
    entry: &mut StreamEntry,
    out: &mut File,
    out_kind: CompressionKind,
    recompress: bool,
) -> Result<ResourceRecord> {
    let original_size = entry.size();
    let old_stored_size = entry.resource.size;

    let file_offset = out.stream_position().map_err(WimError::Write)?;

    let raw = entry.kind == out_kind && out_kind != CompressionKind::None && !recompress;
    let mut bytes_remaining = if raw { old_stored_size } else { original_size };

    // A zero-size stream writes no bytes; its record keeps the source's
    // offset untouched.
    if bytes_remaining == 0 {
        return Ok(ResourceRecord {
            offset: entry.resource.offset,
            size: 0,
            original_size: 0,
            flags: entry.resource.flags & !ResourceFlags::COMPRESSED,
        });
    }

    let mut chunk_table = if out_kind != CompressionKind::None && !raw {
        Some(ChunkTable::begin(original_size, out)?)
    } else {
        None
    };

    let mut reader = ResourceReader::open(&entry.source)?;
    let mut digest = StreamDigest::new();
    let mut buf = vec![0u8; min(CHUNK_SIZE as u64, bytes_remaining) as usize];
    let mut offset = 0u64;

    while bytes_remaining > 0 {
        let to_read = min(CHUNK_SIZE as u64, bytes_remaining) as usize;
        let chunk = &mut buf[..to_read];
        if raw {
            reader.read_raw(offset, chunk)?;
        } else {
            reader.read(offset, chunk)?;
            digest.update(chunk);
        }

        if let Some(table) = &mut chunk_table {
            match compress_chunk(chunk, out_kind) {
                Some(packed) => {
                    out.write_all(&packed).map_err(WimError::Write)?;
                    table.record_chunk(packed.len() as u64);
                }
                None => {
                    out.write_all(chunk).map_err(WimError::Write)?;
                    table.record_chunk(to_read as u64);
                }
            }
        } else {
            out.write_all(chunk).map_err(WimError::Write)?;
        }

        bytes_remaining -= to_read as u64;
        offset += to_read as u64;
    }

    let new_stored_size = match &chunk_table {
        Some(table) => table.finish(out)?,
        None if raw => old_stored_size,
        None => original_size,
    };

    if !raw {
        let actual = digest.finalize();
        if entry.hash.is_zero() {
            entry.hash = actual;
        } else if actual != entry.hash {
            return Err(WimError::InvalidResourceHash {
                expected: entry.hash,
                actual,
            });
        }
    }

    if !raw && out_kind != CompressionKind::None && new_stored_size >= original_size {
        return rewrite_stream_uncompressed(entry, out, file_offset);
    }

    let mut flags = entry.resource.flags & !ResourceFlags::COMPRESSED;
    if out_kind != CompressionKind::None {
        flags |= ResourceFlags::COMPRESSED;
    }
    Ok(ResourceRecord {
        offset: file_offset,
        size: new_stored_size,
        original_size,
        flags,
    })
}

/// Anti-expansion fallback: re-emits the stream uncompressed over the failed
/// compressed attempt and truncates the file back to the stream's end.
pub(crate) fn rewrite_stream_uncompressed(
    entry: &mut StreamEntry,
    out: &mut File,
    file_offset: u64,
) -> Result<ResourceRecord> {
    out.seek(SeekFrom::Start(file_offset))
        .map_err(WimError::Write)?;
    let record = write_stream(entry, out, CompressionKind::None, false)?;
    out.set_len(file_offset + entry.size())
        .map_err(WimError::Write)?;
    Ok(record)
}
