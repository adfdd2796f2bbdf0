pub mod compression;
pub mod error;
pub mod format;
pub mod hash;
pub mod resource;
pub mod types;
pub mod wim;
pub mod writer;

pub use error::WimError;
pub use format::{
    ImageInfo, IntegrityTable, LookupTable, StreamEntry, WimHeader, WimInfo, CHUNK_SIZE,
    HEADER_SIZE, INTEGRITY_CHUNK_SIZE, LOOKUP_ENTRY_SIZE,
};
pub use hash::{StreamDigest, StreamHash, HASH_SIZE};
pub use resource::{ResourceReader, StreamBackend, StreamSource};
pub use types::{
    CompressionKind, ImageSelect, ResourceFlags, ResourceRecord, Result, WriteFlags,
};
pub use wim::{ImageMetadata, Wim};
pub use writer::{
    FnProgressSink, IntegrityProgress, NoopProgress, ProgressSink, WriteProgress,
};
