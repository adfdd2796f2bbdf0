use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;

use crate::compression::decompress_chunk;
use crate::error::WimError;
use crate::format::CHUNK_SIZE;
use crate::types::{CompressionKind, ResourceFlags, ResourceRecord, Result};

use super::chunk_table::ChunkOffsets;

/// Capability set for opaque stream sources outside the archive and the
/// local filesystem, such as native volume drivers. Implementations supply
/// the uncompressed bytes; the engine never interprets them.
pub trait StreamBackend: Send + Sync + fmt::Debug {
    /// Total number of bytes the stream holds.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fills `buf` with bytes starting at `offset`. Short reads are errors.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> anyhow::Result<()>;
}

/// Where a stream's bytes currently live.
#[derive(Debug, Clone)]
pub enum StreamSource {
    /// Embedded in an existing archive, possibly compressed.
    InArchive {
        path: PathBuf,
        record: ResourceRecord,
        kind: CompressionKind,
    },
    /// A plain file on disk.
    File { path: PathBuf },
    /// Held in memory.
    Memory(Bytes),
    /// Provided by an opaque backend.
    Backend(Arc<dyn StreamBackend>),
}

/// Cached read handle over one stream source.
///
/// Opening caches the backing file handle (and, for compressed in-archive
/// sources, the parsed chunk offsets and the most recently decompressed
/// chunk) so that the chunk-at-a-time read pattern of the writers does not
/// reopen or re-parse anything.
#[derive(Debug)]
pub struct ResourceReader {
    inner: Opened,
}

#[derive(Debug)]
enum Opened {
    File(File),
    Memory(Bytes),
    Backend(Arc<dyn StreamBackend>),
    Archive {
        file: File,
        record: ResourceRecord,
        kind: CompressionKind,
        offsets: Option<ChunkOffsets>,
        cached_chunk: Option<(usize, Vec<u8>)>,
    },
}

impl ResourceReader {
    pub fn open(source: &StreamSource) -> Result<Self> {
        let inner = match source {
            StreamSource::File { path } => {
                let file = File::open(path).map_err(|source| WimError::Open {
                    path: path.clone(),
                    source,
                })?;
                Opened::File(file)
            }
            StreamSource::Memory(data) => Opened::Memory(data.clone()),
            StreamSource::Backend(backend) => Opened::Backend(Arc::clone(backend)),
            StreamSource::InArchive { path, record, kind } => {
                let file = File::open(path).map_err(|source| WimError::Open {
                    path: path.clone(),
                    source,
                })?;
                Opened::Archive {
                    file,
                    record: *record,
                    kind: *kind,
                    offsets: None,
                    cached_chunk: None,
                }
            }
        };
        Ok(Self { inner })
    }

    /// Reads uncompressed stream bytes at `offset`, decompressing source
    /// chunks as needed. Fills all of `buf`; a short source is an error.
    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match &mut self.inner {
            Opened::File(file) => read_exact_at(file, offset, buf),
            Opened::Memory(data) => {
                let start = usize::try_from(offset)
                    .ok()
                    .filter(|start| {
                        start.checked_add(buf.len()).is_some_and(|end| end <= data.len())
                    })
                    .ok_or_else(short_read)?;
                buf.copy_from_slice(&data[start..start + buf.len()]);
                Ok(())
            }
            Opened::Backend(backend) => backend.read_at(offset, buf).map_err(WimError::Backend),
            Opened::Archive {
                file,
                record,
                kind,
                offsets,
                cached_chunk,
            } => {
                if *kind == CompressionKind::None
                    || !record.flags.contains(ResourceFlags::COMPRESSED)
                {
                    return read_exact_at(file, record.offset + offset, buf);
                }

                if offsets.is_none() {
                    *offsets = Some(ChunkOffsets::read(file, record)?);
                }
                let offsets = offsets.as_ref().expect("chunk offsets just loaded");

                let mut offset = offset;
                let mut filled = 0usize;
                while filled < buf.len() {
                    let index = (offset / CHUNK_SIZE as u64) as usize;
                    let within = (offset % CHUNK_SIZE as u64) as usize;
                    let chunk_len = chunk_uncompressed_size(record.original_size, index)
                        .ok_or_else(short_read)?;

                    if cached_chunk.as_ref().map(|(i, _)| *i) != Some(index) {
                        let (start, stored_size) = offsets.chunk_span(index);
                        let mut stored = vec![0u8; stored_size as usize];
                        read_exact_at(file, start, &mut stored)?;
                        let chunk = if stored.len() == chunk_len {
                            stored
                        } else {
                            decompress_chunk(&stored, chunk_len, *kind)?
                        };
                        *cached_chunk = Some((index, chunk));
                    }
                    let chunk = &cached_chunk.as_ref().expect("chunk just cached").1;

                    let take = (chunk_len - within).min(buf.len() - filled);
                    buf[filled..filled + take].copy_from_slice(&chunk[within..within + take]);
                    filled += take;
                    offset += take as u64;
                }
                Ok(())
            }
        }
    }

    /// Reads the stored (compressed) bytes of an in-archive stream verbatim,
    /// for raw copies between archives of the same compression kind.
    pub fn read_raw(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match &mut self.inner {
            Opened::Archive { file, record, .. } => {
                read_exact_at(file, record.offset + offset, buf)
            }
            _ => Err(WimError::InvalidParam(
                "raw reads require an archive-backed stream source",
            )),
        }
    }
}

/// Uncompressed size of chunk `index`, or `None` past the last chunk.
fn chunk_uncompressed_size(original_size: u64, index: usize) -> Option<usize> {
    let start = (index as u64).checked_mul(CHUNK_SIZE as u64)?;
    if start >= original_size {
        return None;
    }
    Some(((original_size - start).min(CHUNK_SIZE as u64)) as usize)
}

fn read_exact_at(file: &mut File, offset: u64, buf: &mut [u8]) -> Result<()> {
    file.seek(SeekFrom::Start(offset)).map_err(WimError::Read)?;
    file.read_exact(buf).map_err(WimError::Read)
}

fn short_read() -> WimError {
    WimError::Read(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "stream source ended early",
    ))
}
