mod header;
mod integrity;
mod lookup;
mod xml;

pub use header::WimHeader;
pub use integrity::{read_integrity_table, write_integrity_table, IntegrityTable};
pub use lookup::{LookupTable, StreamEntry};
pub use xml::{parse_xml_data, write_xml_data, ImageInfo, WimInfo};

/// Magic bytes at the start of an archive.
pub const WIM_MAGIC: [u8; 8] = *b"MSWIM\0\0\0";
/// Format version stamped into the header.
pub const WIM_VERSION: u32 = 0x10d00;

/// Fixed size of the archive header in bytes. A placeholder header is written
/// first and overwritten with final offsets as the last step of a write.
pub const HEADER_SIZE: usize = 212;
/// Fixed size of one lookup-table entry in bytes.
pub const LOOKUP_ENTRY_SIZE: usize = 50;

/// Streams are compressed in independent slices of this many bytes.
pub const CHUNK_SIZE: usize = 32 * 1024;
/// Size of the byte ranges covered by one integrity-table checksum.
pub const INTEGRITY_CHUNK_SIZE: usize = 10 * 1024 * 1024;

/// Header flag: the archive's resources are chunk-compressed.
pub const HDR_FLAG_COMPRESSION: u32 = 0x0000_0002;
/// Header flag: compressed resources use the XPRESS-style codec.
pub const HDR_FLAG_COMPRESS_XPRESS: u32 = 0x0002_0000;
/// Header flag: compressed resources use the LZX-style codec.
pub const HDR_FLAG_COMPRESS_LZX: u32 = 0x0004_0000;
