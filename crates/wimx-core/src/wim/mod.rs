mod finalize;
mod overwrite;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use log::warn;

use crate::error::WimError;
use crate::format::{
    parse_xml_data, read_integrity_table, ImageInfo, IntegrityTable, LookupTable, StreamEntry,
    WimHeader, WimInfo,
};
use crate::hash::StreamHash;
use crate::resource::{write_stream, ResourceReader, StreamBackend};
use crate::types::{CompressionKind, ImageSelect, ResourceFlags, Result, WriteFlags};
use crate::writer::{write_stream_list, ProgressSink};

/// One image of the archive: a name, a metadata blob (built by a capture
/// adapter; the engine never interprets it), and the content streams the
/// image references.
#[derive(Debug, Clone)]
pub struct ImageMetadata {
    pub name: String,
    /// Hash of the metadata stream in the lookup table.
    pub metadata_hash: StreamHash,
    /// Streams the image references, in capture order. `None` for images
    /// read back from an existing archive, whose contents stay untouched.
    pub streams: Option<Vec<StreamHash>>,
    /// Set for images created or changed since the archive was opened.
    pub modified: bool,
}

/// An archive being built or modified.
///
/// A `Wim` holds the header, the lookup table mapping stream hashes to
/// stream entries, the XML metadata, and the image list. Content enters
/// through the `add_stream_*` methods, images through [`Wim::add_image`],
/// and everything reaches disk through [`Wim::write`] (fresh file) or
/// [`Wim::overwrite`] (in-place append or rebuild of the backing file).
#[derive(Debug)]
pub struct Wim {
    hdr: WimHeader,
    kind: CompressionKind,
    lookup: LookupTable,
    info: WimInfo,
    images: Vec<ImageMetadata>,
    path: Option<PathBuf>,
    deletion_occurred: bool,
    old_integrity: Option<IntegrityTable>,
}

impl Wim {
    /// Creates an empty in-memory archive using the given compression kind.
    pub fn create(kind: CompressionKind) -> Self {
        Self {
            hdr: WimHeader::new(kind),
            kind,
            lookup: LookupTable::new(),
            info: WimInfo::default(),
            images: Vec::new(),
            path: None,
            deletion_occurred: false,
            old_integrity: None,
        }
    }

    /// Opens an existing archive, reading its header, lookup table, XML
    /// data, and integrity table.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = File::open(&path).map_err(|source| WimError::Open {
            path: path.clone(),
            source,
        })?;

        let hdr = WimHeader::read(&mut file)?;
        if hdr.total_parts != 1 {
            return Err(WimError::SplitUnsupported {
                parts: hdr.total_parts,
            });
        }
        let kind = hdr.compression()?;

        let lookup = if hdr.lookup_table.is_empty() {
            LookupTable::new()
        } else {
            LookupTable::read(&mut file, &hdr.lookup_table, &path, kind)?
        };

        let info = if hdr.xml_data.is_empty() {
            WimInfo::default()
        } else {
            file.seek(SeekFrom::Start(hdr.xml_data.offset))
                .map_err(WimError::Read)?;
            let mut raw = vec![0u8; hdr.xml_data.size as usize];
            file.read_exact(&mut raw).map_err(WimError::Read)?;
            parse_xml_data(&raw)?
        };

        let old_integrity = if hdr.integrity.is_empty() {
            None
        } else {
            Some(read_integrity_table(&mut file, &hdr.integrity)?)
        };

        let metadata_hashes: Vec<StreamHash> = lookup
            .iter()
            .filter(|entry| entry.is_metadata())
            .map(|entry| entry.hash)
            .collect();
        if metadata_hashes.len() != hdr.image_count as usize {
            return Err(WimError::InvalidFormat(
                "image count disagrees with metadata resources",
            ));
        }
        let images = metadata_hashes
            .into_iter()
            .enumerate()
            .map(|(i, metadata_hash)| ImageMetadata {
                name: info
                    .images
                    .get(i)
                    .map(|image| image.name.clone())
                    .unwrap_or_default(),
                metadata_hash,
                streams: None,
                modified: false,
            })
            .collect();

        Ok(Self {
            hdr,
            kind,
            lookup,
            info,
            images,
            path: Some(path),
            deletion_occurred: false,
            old_integrity,
        })
    }

    pub fn compression(&self) -> CompressionKind {
        self.kind
    }

    pub fn header(&self) -> &WimHeader {
        &self.hdr
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    pub fn images(&self) -> &[ImageMetadata] {
        &self.images
    }

    pub fn info(&self) -> &WimInfo {
        &self.info
    }

    pub fn lookup(&self) -> &LookupTable {
        &self.lookup
    }

    /// Registers a file on disk as a content stream. Returns its hash.
    pub fn add_stream_from_file(&mut self, path: impl Into<PathBuf>) -> Result<StreamHash> {
        let entry = StreamEntry::from_file(path)?;
        Ok(self.lookup.insert(entry))
    }

    /// Registers in-memory bytes as a content stream. Returns its hash.
    pub fn add_stream_from_memory(&mut self, data: Bytes) -> StreamHash {
        self.lookup.insert(StreamEntry::from_memory(data))
    }

    /// Registers a stream served by an opaque backend. Returns its hash.
    pub fn add_stream_from_backend(&mut self, backend: Arc<dyn StreamBackend>) -> Result<StreamHash> {
        let entry = StreamEntry::from_backend(backend)?;
        Ok(self.lookup.insert(entry))
    }

    /// Adds an image referencing previously registered streams. Returns the
    /// new image's 1-based index.
    pub fn add_image(
        &mut self,
        name: &str,
        metadata: Bytes,
        streams: &[StreamHash],
    ) -> Result<u32> {
        for hash in streams {
            if !self.lookup.contains(hash) {
                return Err(WimError::UnknownStream(*hash));
            }
        }

        let mut entry = StreamEntry::from_memory(metadata);
        entry.resource.flags |= ResourceFlags::METADATA;
        let metadata_hash = self.lookup.insert(entry);

        self.images.push(ImageMetadata {
            name: name.to_string(),
            metadata_hash,
            streams: Some(streams.to_vec()),
            modified: true,
        });
        let index = self.images.len() as u32;

        let total_bytes = streams
            .iter()
            .filter_map(|hash| self.lookup.get(hash))
            .map(StreamEntry::size)
            .sum();
        self.info.images.push(ImageInfo {
            index,
            name: name.to_string(),
            dir_count: 0,
            file_count: streams.len() as u64,
            total_bytes,
        });
        self.hdr.image_count = self.images.len() as u32;
        Ok(index)
    }

    /// Deletes an image. Later images shift down one index. In-place append
    /// is refused after a deletion unless the caller opts into
    /// [`WriteFlags::SOFT_DELETE`].
    pub fn delete_image(&mut self, index: u32) -> Result<()> {
        let position = index as usize;
        if position == 0 || position > self.images.len() {
            return Err(WimError::InvalidImage(index));
        }
        let image = self.images.remove(position - 1);

        self.release_stream(&image.metadata_hash);
        if let Some(streams) = image.streams {
            for hash in streams {
                self.release_stream(&hash);
            }
        }

        self.info.images.remove(position - 1);
        for (i, image_info) in self.info.images.iter_mut().enumerate() {
            image_info.index = i as u32 + 1;
        }
        self.hdr.image_count = self.images.len() as u32;
        if self.hdr.boot_index == index {
            self.hdr.boot_index = 0;
        } else if self.hdr.boot_index > index {
            self.hdr.boot_index -= 1;
        }
        self.deletion_occurred = true;
        Ok(())
    }

    /// Marks an image as the boot image, or clears the selection with 0.
    pub fn set_boot_index(&mut self, index: u32) -> Result<()> {
        if index as usize > self.images.len() {
            return Err(WimError::InvalidImage(index));
        }
        self.hdr.boot_index = index;
        Ok(())
    }

    /// Reads a stream's uncompressed bytes back out of its source and
    /// verifies them against the stored hash.
    pub fn extract_stream(&self, hash: &StreamHash) -> Result<Vec<u8>> {
        let entry = self
            .lookup
            .get(hash)
            .ok_or(WimError::UnknownStream(*hash))?;
        let mut reader = ResourceReader::open(&entry.source)?;
        let mut data = vec![0u8; entry.size() as usize];
        reader.read(0, &mut data)?;

        let actual = StreamHash::of(&data);
        if actual != entry.hash {
            return Err(WimError::InvalidResourceHash {
                expected: entry.hash,
                actual,
            });
        }
        Ok(data)
    }

    /// Checks the backing file against its stored integrity table. Returns
    /// `None` when the archive carries no integrity table.
    pub fn verify_integrity(&self, sink: &mut dyn ProgressSink) -> Result<Option<bool>> {
        let path = self.path.as_ref().ok_or(WimError::NoFilename)?;
        if self.hdr.integrity.is_empty() {
            return Ok(None);
        }
        let mut file = File::open(path).map_err(|source| WimError::Open {
            path: path.clone(),
            source,
        })?;
        let table = read_integrity_table(&mut file, &self.hdr.integrity)?;
        let ok = table.verify(&mut file, self.hdr.lookup_table.end(), sink)?;
        Ok(Some(ok))
    }

    /// Writes the archive to a fresh file.
    ///
    /// Streams land first, then each selected image's metadata resource,
    /// then the lookup table, XML data, and optional integrity table; the
    /// final header is overwritten last.
    pub fn write(
        &mut self,
        path: impl AsRef<Path>,
        image: ImageSelect,
        flags: WriteFlags,
        num_threads: usize,
        sink: &mut dyn ProgressSink,
    ) -> Result<()> {
        let flags = flags & WriteFlags::PUBLIC;
        self.write_to_path(path.as_ref(), image, flags, num_threads, sink)?;
        Ok(())
    }

    /// Rewrites the backing file, appending in place when layout and history
    /// allow it and rebuilding through a temporary file otherwise.
    pub fn overwrite(
        &mut self,
        flags: WriteFlags,
        num_threads: usize,
        sink: &mut dyn ProgressSink,
    ) -> Result<()> {
        let flags = flags & WriteFlags::PUBLIC;
        if self.path.is_none() {
            return Err(WimError::NoFilename);
        }

        if (!self.deletion_occurred || flags.contains(WriteFlags::SOFT_DELETE))
            && !flags.contains(WriteFlags::REBUILD)
        {
            match overwrite::overwrite_inplace(self, flags, num_threads, sink) {
                Err(WimError::ResourceOrder(reason)) => {
                    warn!("{reason}; rebuilding the entire archive");
                }
                other => return other,
            }
        }
        overwrite::overwrite_via_tmpfile(self, flags, num_threads, sink)
    }

    pub(crate) fn any_images_modified(&self) -> bool {
        self.images.iter().any(|image| image.modified)
    }

    /// Full write to `path`: placeholder header, streams, metadata
    /// resources, then the finalization tail. Returns the final header.
    pub(crate) fn write_to_path(
        &mut self,
        path: &Path,
        image: ImageSelect,
        flags: WriteFlags,
        num_threads: usize,
        sink: &mut dyn ProgressSink,
    ) -> Result<WimHeader> {
        if let ImageSelect::Index(index) = image {
            if index == 0 || index as usize > self.images.len() {
                return Err(WimError::InvalidImage(index));
            }
        }
        if self.path.as_deref() == Some(path) {
            return Err(WimError::InvalidParam(
                "cannot write an archive over its own backing file; use overwrite",
            ));
        }

        let mut out = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .read(true)
            .open(path)
            .map_err(|source| WimError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        // Placeholder header; overwritten with final offsets at the end.
        self.hdr.write(&mut out)?;

        let selected: Vec<usize> = match image {
            ImageSelect::All => (0..self.images.len()).collect(),
            ImageSelect::Index(index) => vec![index as usize - 1],
        };

        // Gather content streams in first-reference order.
        self.lookup.zero_out_refcnts();
        let mut order: Vec<StreamHash> = Vec::new();
        for &image_index in &selected {
            let image_streams = match &self.images[image_index].streams {
                Some(streams) => streams.clone(),
                None => self
                    .lookup
                    .iter()
                    .filter(|entry| !entry.is_metadata())
                    .map(|entry| entry.hash)
                    .collect(),
            };
            for hash in image_streams {
                let entry = self
                    .lookup
                    .get_mut(&hash)
                    .ok_or(WimError::UnknownStream(hash))?;
                if entry.is_metadata() {
                    continue;
                }
                if entry.out_refcnt == 0 {
                    order.push(hash);
                }
                entry.out_refcnt += 1;
            }
        }

        write_stream_list(
            &mut self.lookup,
            &order,
            &mut out,
            self.kind,
            flags,
            num_threads,
            sink,
        )?;

        // Metadata resources follow the content streams, in image order.
        for &image_index in &selected {
            let hash = self.images[image_index].metadata_hash;
            let entry = self
                .lookup
                .get_mut(&hash)
                .ok_or(WimError::UnknownStream(hash))?;
            entry.out_refcnt += 1;
            let record = write_stream(
                entry,
                &mut out,
                self.kind,
                flags.contains(WriteFlags::RECOMPRESS),
            )?;
            entry.out_resource = Some(record);
        }

        finalize::finish_write(self, &mut out, image, flags, sink)
    }

    fn release_stream(&mut self, hash: &StreamHash) {
        if let Some(entry) = self.lookup.get_mut(hash) {
            entry.refcnt = entry.refcnt.saturating_sub(1);
            if entry.refcnt == 0 {
                self.lookup.remove(hash);
            }
        }
    }
}
