use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::hash::StreamHash;

#[derive(Debug, Error)]
pub enum WimError {
    #[error("failed to open `{path}`: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read stream source: {0}")]
    Read(#[source] io::Error),
    #[error("failed to write output archive: {0}")]
    Write(#[source] io::Error),
    #[error("stream has incorrect hash (expected {expected}, actual {actual})")]
    InvalidResourceHash {
        expected: StreamHash,
        actual: StreamHash,
    },
    #[error("failed to decompress resource chunk: {0}")]
    Decompression(String),
    #[error("compressor pool failed: {0}")]
    Compression(String),
    #[error("invalid archive format: {0}")]
    InvalidFormat(&'static str),
    #[error("archive layout does not permit in-place append: {0}")]
    ResourceOrder(&'static str),
    #[error("`{0}` is already locked by another process")]
    AlreadyLocked(PathBuf),
    #[error("archive has {parts} parts; split archives are not supported")]
    SplitUnsupported { parts: u16 },
    #[error("failed to rename `{from}` to `{to}`: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to re-open `{path}` read-only: {source}")]
    Reopen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),
    #[error("image index {0} does not exist")]
    InvalidImage(u32),
    #[error("archive has no backing filename; write it to a path first")]
    NoFilename,
    #[error("stream {0} is not present in the lookup table")]
    UnknownStream(StreamHash),
    #[error("stream backend error: {0}")]
    Backend(#[from] anyhow::Error),
}
