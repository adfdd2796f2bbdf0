mod chunk_table;
mod codec;
mod reader;

pub(crate) use chunk_table::{ChunkOffsets, ChunkTable};
pub(crate) use codec::{rewrite_stream_uncompressed, write_stream};
pub use reader::{ResourceReader, StreamBackend, StreamSource};
