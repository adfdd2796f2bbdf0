#![allow(dead_code)]

use std::fs;
use std::path::Path;

use bytes::Bytes;
use wimx_core::{
    CompressionKind, ImageSelect, NoopProgress, Result, StreamHash, Wim, WriteFlags,
};

/// Deterministic noise; compresses to nothing useful.
pub fn xorshift_bytes(mut seed: u64, len: usize) -> Vec<u8> {
    assert_ne!(seed, 0);
    (0..len)
        .map(|_| {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed as u8
        })
        .collect()
}

/// Structured data with plenty of repeated phrases; compresses well.
pub fn patterned_bytes(len: usize, phase: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(len + 64);
    let mut i = phase;
    while data.len() < len {
        data.extend_from_slice(format!("record {:08} status=ok payload=", i % 977).as_bytes());
        data.extend_from_slice(&(i % 251).to_le_bytes());
        i += 1;
    }
    data.truncate(len);
    data
}

/// Builds an unwritten archive holding one image over the given payloads.
pub fn build_wim(kind: CompressionKind, payloads: &[Vec<u8>]) -> (Wim, Vec<StreamHash>) {
    let mut wim = Wim::create(kind);
    let hashes: Vec<StreamHash> = payloads
        .iter()
        .map(|payload| wim.add_stream_from_memory(Bytes::from(payload.clone())))
        .collect();
    wim.add_image("test", Bytes::from_static(b"metadata"), &hashes)
        .expect("streams were just added");
    (wim, hashes)
}

pub fn write_wim(
    wim: &mut Wim,
    path: &Path,
    flags: WriteFlags,
    threads: usize,
) -> Result<()> {
    wim.write(path, ImageSelect::All, flags, threads, &mut NoopProgress)
}

pub fn read_file(path: &Path) -> Vec<u8> {
    fs::read(path).expect("file exists")
}
