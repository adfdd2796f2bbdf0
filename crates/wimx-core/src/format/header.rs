use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use rand::RngCore;

use crate::error::WimError;
use crate::types::{CompressionKind, ResourceRecord, Result};

use super::{HEADER_SIZE, WIM_MAGIC, WIM_VERSION};

/// The fixed 212-byte archive header.
///
/// The header is the only part of the file that is ever overwritten in place:
/// a placeholder goes out first, and the final header -- pointing at the
/// lookup table, XML data, and integrity table -- lands only after everything
/// it references has been written. Appends rely on that ordering for crash
/// safety.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WimHeader {
    pub flags: u32,
    pub guid: [u8; 16],
    pub part_number: u16,
    pub total_parts: u16,
    pub image_count: u32,
    pub lookup_table: ResourceRecord,
    pub xml_data: ResourceRecord,
    pub boot_metadata: ResourceRecord,
    pub boot_index: u32,
    pub integrity: ResourceRecord,
}

impl WimHeader {
    /// Creates a header for a fresh archive using the given compression kind.
    pub fn new(kind: CompressionKind) -> Self {
        let mut guid = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut guid);
        Self {
            flags: kind.header_flag_bits(),
            guid,
            part_number: 1,
            total_parts: 1,
            image_count: 0,
            lookup_table: ResourceRecord::default(),
            xml_data: ResourceRecord::default(),
            boot_metadata: ResourceRecord::default(),
            boot_index: 0,
            integrity: ResourceRecord::default(),
        }
    }

    /// The compression kind encoded in the header flags.
    pub fn compression(&self) -> Result<CompressionKind> {
        CompressionKind::from_header_flags(self.flags)
    }

    /// Writes the header at the start of the file, restoring the previous
    /// position afterwards.
    pub fn overwrite(&self, out: &mut File) -> Result<()> {
        let pos = out.stream_position().map_err(WimError::Write)?;
        out.seek(SeekFrom::Start(0)).map_err(WimError::Write)?;
        out.write_all(&self.to_bytes()).map_err(WimError::Write)?;
        out.seek(SeekFrom::Start(pos)).map_err(WimError::Write)?;
        Ok(())
    }

    /// Writes the header at the current position.
    pub fn write(&self, out: &mut File) -> Result<()> {
        out.write_all(&self.to_bytes()).map_err(WimError::Write)
    }

    /// Reads and validates a header from the start of the file.
    pub fn read(file: &mut File) -> Result<Self> {
        file.seek(SeekFrom::Start(0)).map_err(WimError::Read)?;
        let mut bytes = [0u8; HEADER_SIZE];
        file.read_exact(&mut bytes).map_err(WimError::Read)?;
        Self::from_bytes(&bytes)
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[..8].copy_from_slice(&WIM_MAGIC);
        bytes[8..12].copy_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
        bytes[12..16].copy_from_slice(&WIM_VERSION.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.flags.to_le_bytes());
        bytes[20..24].copy_from_slice(&(super::CHUNK_SIZE as u32).to_le_bytes());
        bytes[24..40].copy_from_slice(&self.guid);
        bytes[40..42].copy_from_slice(&self.part_number.to_le_bytes());
        bytes[42..44].copy_from_slice(&self.total_parts.to_le_bytes());
        bytes[44..48].copy_from_slice(&self.image_count.to_le_bytes());
        bytes[48..72].copy_from_slice(&self.lookup_table.to_bytes());
        bytes[72..96].copy_from_slice(&self.xml_data.to_bytes());
        bytes[96..120].copy_from_slice(&self.boot_metadata.to_bytes());
        bytes[120..124].copy_from_slice(&self.boot_index.to_le_bytes());
        bytes[124..148].copy_from_slice(&self.integrity.to_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Result<Self> {
        if bytes[..8] != WIM_MAGIC {
            return Err(WimError::InvalidFormat("bad archive magic"));
        }
        let hdr_size = u32::from_le_bytes(bytes[8..12].try_into().expect("slice is 4 bytes"));
        if hdr_size != HEADER_SIZE as u32 {
            return Err(WimError::InvalidFormat("unexpected header size"));
        }
        let version = u32::from_le_bytes(bytes[12..16].try_into().expect("slice is 4 bytes"));
        if version != WIM_VERSION {
            return Err(WimError::InvalidFormat("unsupported format version"));
        }
        let chunk_size = u32::from_le_bytes(bytes[20..24].try_into().expect("slice is 4 bytes"));
        if chunk_size != super::CHUNK_SIZE as u32 {
            return Err(WimError::InvalidFormat("unsupported chunk size"));
        }

        let mut guid = [0u8; 16];
        guid.copy_from_slice(&bytes[24..40]);

        let header = Self {
            flags: u32::from_le_bytes(bytes[16..20].try_into().expect("slice is 4 bytes")),
            guid,
            part_number: u16::from_le_bytes(bytes[40..42].try_into().expect("slice is 2 bytes")),
            total_parts: u16::from_le_bytes(bytes[42..44].try_into().expect("slice is 2 bytes")),
            image_count: u32::from_le_bytes(bytes[44..48].try_into().expect("slice is 4 bytes")),
            lookup_table: ResourceRecord::from_bytes(
                bytes[48..72].try_into().expect("slice is 24 bytes"),
            )?,
            xml_data: ResourceRecord::from_bytes(
                bytes[72..96].try_into().expect("slice is 24 bytes"),
            )?,
            boot_metadata: ResourceRecord::from_bytes(
                bytes[96..120].try_into().expect("slice is 24 bytes"),
            )?,
            boot_index: u32::from_le_bytes(bytes[120..124].try_into().expect("slice is 4 bytes")),
            integrity: ResourceRecord::from_bytes(
                bytes[124..148].try_into().expect("slice is 24 bytes"),
            )?,
        };
        header.compression()?;
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceFlags;

    #[test]
    fn header_round_trips() {
        let mut header = WimHeader::new(CompressionKind::Lzx);
        header.image_count = 3;
        header.boot_index = 2;
        header.lookup_table = ResourceRecord {
            offset: 4096,
            size: 150,
            original_size: 150,
            flags: ResourceFlags::empty(),
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(WimHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = WimHeader::new(CompressionKind::None).to_bytes();
        bytes[0] ^= 0xFF;
        assert!(WimHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn compression_kind_survives_flag_encoding() {
        for kind in [
            CompressionKind::None,
            CompressionKind::Xpress,
            CompressionKind::Lzx,
        ] {
            let header = WimHeader::new(kind);
            assert_eq!(header.compression().unwrap(), kind);
        }
    }
}
