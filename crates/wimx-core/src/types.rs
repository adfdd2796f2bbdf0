use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::WimError;

pub type Result<T> = std::result::Result<T, WimError>;

/// Compression kind applied to stream chunks.
///
/// The kind is archive-wide: every compressed resource in a WIM uses the
/// compression selected in the header. Individual chunks may still be stored
/// raw when compression does not shrink them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompressionKind {
    None,
    Xpress,
    Lzx,
}

impl CompressionKind {
    /// Header flag bits identifying this kind.
    pub fn header_flag_bits(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Xpress => crate::format::HDR_FLAG_COMPRESSION | crate::format::HDR_FLAG_COMPRESS_XPRESS,
            Self::Lzx => crate::format::HDR_FLAG_COMPRESSION | crate::format::HDR_FLAG_COMPRESS_LZX,
        }
    }

    /// Decodes the compression kind from header flags.
    pub fn from_header_flags(flags: u32) -> Result<Self> {
        if flags & crate::format::HDR_FLAG_COMPRESSION == 0 {
            return Ok(Self::None);
        }
        match flags & (crate::format::HDR_FLAG_COMPRESS_XPRESS | crate::format::HDR_FLAG_COMPRESS_LZX) {
            crate::format::HDR_FLAG_COMPRESS_XPRESS => Ok(Self::Xpress),
            crate::format::HDR_FLAG_COMPRESS_LZX => Ok(Self::Lzx),
            _ => Err(WimError::InvalidFormat("unrecognized compression flag bits")),
        }
    }
}

impl std::fmt::Display for CompressionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Xpress => f.write_str("xpress"),
            Self::Lzx => f.write_str("lzx"),
        }
    }
}

bitflags! {
    /// Per-resource flag byte stored in resource records.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ResourceFlags: u8 {
        /// The resource is an image metadata blob, not file content.
        const METADATA = 0x02;
        /// The resource is chunk-compressed and carries a chunk table.
        const COMPRESSED = 0x04;
    }
}

bitflags! {
    /// Behavior flags accepted by [`Wim::write`](crate::Wim::write) and
    /// [`Wim::overwrite`](crate::Wim::overwrite).
    ///
    /// Only the bits in [`WriteFlags::PUBLIC`] are accepted from callers; the
    /// remaining bits are set internally by the finalization paths.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WriteFlags: u32 {
        /// Append an integrity table of SHA-1 checksums over the archive.
        const CHECK_INTEGRITY = 1 << 0;
        /// Recompress streams even when the source already uses the target kind.
        const RECOMPRESS = 1 << 1;
        /// Force overwrite to rebuild the whole archive in a temporary file.
        const REBUILD = 1 << 2;
        /// Allow in-place append even after image deletions.
        const SOFT_DELETE = 1 << 3;
        /// fsync the output file before the write is reported complete.
        const FSYNC = 1 << 4;

        /// Keep the existing lookup table instead of writing a new one.
        const NO_LOOKUP_TABLE = 1 << 8;
        /// Reuse entries of the previous integrity table where still valid.
        const REUSE_INTEGRITY_TABLE = 1 << 9;
        /// Write a temporary header after the XML data, before the integrity
        /// table, so a crash mid-integrity leaves a readable archive.
        const CHECKPOINT_AFTER_XML = 1 << 10;
    }
}

impl WriteFlags {
    /// Bits callers may pass in; everything else is managed internally.
    pub const PUBLIC: WriteFlags = WriteFlags::CHECK_INTEGRITY
        .union(WriteFlags::RECOMPRESS)
        .union(WriteFlags::REBUILD)
        .union(WriteFlags::SOFT_DELETE)
        .union(WriteFlags::FSYNC);
}

/// Which images of the archive a write covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSelect {
    All,
    /// A single 1-based image index.
    Index(u32),
}

/// Lookup-table view of one written stream: where it landed and in what form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceRecord {
    /// Absolute byte offset of the resource in the archive.
    pub offset: u64,
    /// Stored size (chunk table plus payload for compressed resources).
    pub size: u64,
    /// Uncompressed size of the stream.
    pub original_size: u64,
    pub flags: ResourceFlags,
}

impl ResourceRecord {
    pub const DISK_SIZE: usize = 24;

    pub fn is_empty(&self) -> bool {
        self.offset == 0 && self.size == 0 && self.original_size == 0
    }

    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Serializes the record: 56-bit stored size, flag byte, offset,
    /// original size, all little-endian.
    pub fn to_bytes(&self) -> [u8; Self::DISK_SIZE] {
        let mut bytes = [0u8; Self::DISK_SIZE];
        bytes[..7].copy_from_slice(&self.size.to_le_bytes()[..7]);
        bytes[7] = self.flags.bits();
        bytes[8..16].copy_from_slice(&self.offset.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.original_size.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::DISK_SIZE]) -> Result<Self> {
        let mut size = [0u8; 8];
        size[..7].copy_from_slice(&bytes[..7]);
        let flags = ResourceFlags::from_bits(bytes[7])
            .ok_or(WimError::InvalidFormat("unrecognized resource flag bits"))?;
        Ok(Self {
            offset: u64::from_le_bytes(bytes[8..16].try_into().expect("slice is 8 bytes")),
            size: u64::from_le_bytes(size),
            original_size: u64::from_le_bytes(bytes[16..24].try_into().expect("slice is 8 bytes")),
            flags,
        })
    }
}
