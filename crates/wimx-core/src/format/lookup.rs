use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::WimError;
use crate::hash::{StreamDigest, StreamHash, HASH_SIZE};
use crate::resource::{ResourceReader, StreamBackend, StreamSource};
use crate::types::{CompressionKind, ResourceFlags, ResourceRecord, Result};

use super::LOOKUP_ENTRY_SIZE;

/// One content stream known to the archive: its identity, where its bytes
/// currently live, and (after a write) where they landed.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// SHA-1 of the uncompressed stream bytes.
    pub hash: StreamHash,
    /// The stream's current stored form on the source side.
    pub resource: ResourceRecord,
    /// Compression kind of the stored form.
    pub kind: CompressionKind,
    pub source: StreamSource,
    pub part_number: u16,
    /// Incoming references from image contents.
    pub refcnt: u32,
    /// References carried into the write being finalized.
    pub out_refcnt: u32,
    /// Stored form in the output archive, populated as the stream is written.
    pub out_resource: Option<ResourceRecord>,
}

impl StreamEntry {
    /// Builds an entry for a file on disk, streaming it through SHA-1.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = File::open(&path).map_err(|source| WimError::Open {
            path: path.clone(),
            source,
        })?;

        let mut digest = StreamDigest::new();
        let mut size = 0u64;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let read = file.read(&mut buf).map_err(WimError::Read)?;
            if read == 0 {
                break;
            }
            digest.update(&buf[..read]);
            size += read as u64;
        }

        Ok(Self::new(
            digest.finalize(),
            size,
            StreamSource::File { path },
        ))
    }

    /// Builds an entry for bytes held in memory.
    pub fn from_memory(data: Bytes) -> Self {
        let hash = StreamHash::of(&data);
        let size = data.len() as u64;
        Self::new(hash, size, StreamSource::Memory(data))
    }

    /// Builds an entry for an opaque backend, hashing through its reads.
    pub fn from_backend(backend: Arc<dyn StreamBackend>) -> Result<Self> {
        let size = backend.len();
        let source = StreamSource::Backend(backend);
        let mut reader = ResourceReader::open(&source)?;

        let mut digest = StreamDigest::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut offset = 0u64;
        while offset < size {
            let take = (size - offset).min(buf.len() as u64) as usize;
            reader.read(offset, &mut buf[..take])?;
            digest.update(&buf[..take]);
            offset += take as u64;
        }

        Ok(Self::new(digest.finalize(), size, source))
    }

    fn new(hash: StreamHash, size: u64, source: StreamSource) -> Self {
        Self {
            hash,
            resource: ResourceRecord {
                offset: 0,
                size,
                original_size: size,
                flags: ResourceFlags::empty(),
            },
            kind: CompressionKind::None,
            source,
            part_number: 1,
            refcnt: 1,
            out_refcnt: 0,
            out_resource: None,
        }
    }

    /// Uncompressed size of the stream.
    pub fn size(&self) -> u64 {
        self.resource.original_size
    }

    pub fn is_metadata(&self) -> bool {
        self.resource.flags.contains(ResourceFlags::METADATA)
    }

    /// The record this entry contributes to a lookup table being written.
    pub(crate) fn output_record(&self) -> ResourceRecord {
        self.out_resource.unwrap_or(self.resource)
    }
}

/// The archive's map from stream hash to stream entry.
///
/// Iteration follows insertion order, which is also the order streams are
/// handed to the writers; the serialized table is sorted by output offset so
/// the same inputs always produce the same bytes.
#[derive(Debug, Default)]
pub struct LookupTable {
    entries: HashMap<StreamHash, StreamEntry>,
    order: Vec<StreamHash>,
}

impl LookupTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry, or bumps the refcount of an existing one with the
    /// same hash. Returns the entry's hash.
    pub fn insert(&mut self, entry: StreamEntry) -> StreamHash {
        let hash = entry.hash;
        match self.entries.entry(hash) {
            std::collections::hash_map::Entry::Occupied(mut existing) => {
                existing.get_mut().refcnt += entry.refcnt.max(1);
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(entry);
                self.order.push(hash);
            }
        }
        hash
    }

    pub fn get(&self, hash: &StreamHash) -> Option<&StreamEntry> {
        self.entries.get(hash)
    }

    pub fn get_mut(&mut self, hash: &StreamHash) -> Option<&mut StreamEntry> {
        self.entries.get_mut(hash)
    }

    pub fn contains(&self, hash: &StreamHash) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &StreamEntry> {
        self.order.iter().filter_map(|hash| self.entries.get(hash))
    }

    /// Hashes in insertion order.
    pub(crate) fn order(&self) -> &[StreamHash] {
        &self.order
    }

    pub(crate) fn remove(&mut self, hash: &StreamHash) -> Option<StreamEntry> {
        let removed = self.entries.remove(hash);
        if removed.is_some() {
            self.order.retain(|h| h != hash);
        }
        removed
    }

    pub(crate) fn zero_out_refcnts(&mut self) {
        for entry in self.entries.values_mut() {
            entry.out_refcnt = 0;
        }
    }

    /// Retargets every written entry at the archive it just landed in, so
    /// later writes read (or raw-copy) from there.
    pub(crate) fn commit_written(&mut self, archive_path: &Path, archive_kind: CompressionKind) {
        for entry in self.entries.values_mut() {
            if entry.out_refcnt == 0 {
                continue;
            }
            if let Some(record) = entry.out_resource.take() {
                let kind = if record.flags.contains(ResourceFlags::COMPRESSED) {
                    archive_kind
                } else {
                    CompressionKind::None
                };
                entry.resource = record;
                entry.kind = kind;
                entry.source = StreamSource::InArchive {
                    path: archive_path.to_path_buf(),
                    record,
                    kind,
                };
            }
        }
    }

    /// Serializes all entries with a non-zero output refcount at the current
    /// position, sorted by output offset.
    pub(crate) fn write(&self, out: &mut File) -> Result<ResourceRecord> {
        let table_offset = out.stream_position().map_err(WimError::Write)?;

        let mut live: Vec<&StreamEntry> = self
            .iter()
            .filter(|entry| entry.out_refcnt > 0)
            .collect();
        live.sort_by_key(|entry| entry.output_record().offset);

        let mut bytes = Vec::with_capacity(live.len() * LOOKUP_ENTRY_SIZE);
        for entry in live {
            let record = entry.output_record();
            bytes.extend_from_slice(&record.to_bytes());
            bytes.extend_from_slice(&entry.part_number.to_le_bytes());
            bytes.extend_from_slice(&entry.out_refcnt.to_le_bytes());
            bytes.extend_from_slice(entry.hash.as_bytes());
        }
        out.write_all(&bytes).map_err(WimError::Write)?;

        Ok(ResourceRecord {
            offset: table_offset,
            size: bytes.len() as u64,
            original_size: bytes.len() as u64,
            flags: ResourceFlags::empty(),
        })
    }

    /// Reads a lookup table from an existing archive. Every entry's source
    /// points back into that archive.
    pub(crate) fn read(
        file: &mut File,
        record: &ResourceRecord,
        archive_path: &Path,
        archive_kind: CompressionKind,
    ) -> Result<Self> {
        if record.size % LOOKUP_ENTRY_SIZE as u64 != 0 {
            return Err(WimError::InvalidFormat(
                "lookup table size is not a multiple of the entry size",
            ));
        }

        file.seek(SeekFrom::Start(record.offset))
            .map_err(WimError::Read)?;
        let mut raw = vec![0u8; record.size as usize];
        file.read_exact(&mut raw).map_err(WimError::Read)?;

        let mut table = Self::new();
        for entry_bytes in raw.chunks_exact(LOOKUP_ENTRY_SIZE) {
            let resource =
                ResourceRecord::from_bytes(entry_bytes[..24].try_into().expect("24-byte record"))?;
            let part_number =
                u16::from_le_bytes(entry_bytes[24..26].try_into().expect("2-byte part"));
            let refcnt = u32::from_le_bytes(entry_bytes[26..30].try_into().expect("4-byte count"));
            let mut hash = [0u8; HASH_SIZE];
            hash.copy_from_slice(&entry_bytes[30..50]);

            let kind = if resource.flags.contains(ResourceFlags::COMPRESSED) {
                archive_kind
            } else {
                CompressionKind::None
            };
            table.insert(StreamEntry {
                hash: StreamHash(hash),
                resource,
                kind,
                source: StreamSource::InArchive {
                    path: archive_path.to_path_buf(),
                    record: resource,
                    kind,
                },
                part_number,
                refcnt,
                out_refcnt: 0,
                out_resource: None,
            });
        }
        Ok(table)
    }
}
