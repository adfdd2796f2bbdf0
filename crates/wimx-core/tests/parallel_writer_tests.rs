mod common;

use std::fs;

use bytes::Bytes;
use common::{build_wim, patterned_bytes, read_file, write_wim, xorshift_bytes};
use wimx_core::{
    CompressionKind, ImageSelect, NoopProgress, Wim, WimError, WriteFlags,
};

/// Enough compressible volume to cross the parallel threshold, mixed with
/// streams that take the direct path (empty, tiny, incompressible).
fn mixed_payloads() -> Vec<Vec<u8>> {
    let mut payloads = Vec::new();
    for i in 0..12 {
        payloads.push(patterned_bytes(120_000 + i as usize * 1_000, i));
    }
    payloads.push(Vec::new());
    payloads.push(b"x".to_vec());
    payloads.push(xorshift_bytes(0xdead_beef, 60_000));
    payloads.push(xorshift_bytes(0xfeed_f00d, 48_000));
    payloads.push(Vec::new());
    payloads
}

#[test]
fn parallel_output_is_byte_identical_to_serial() {
    let payloads = mixed_payloads();
    let (mut wim, _) = build_wim(CompressionKind::Lzx, &payloads);

    let dir = tempfile::tempdir().unwrap();
    let serial = dir.path().join("serial.wim");
    let parallel = dir.path().join("parallel.wim");
    let parallel_again = dir.path().join("parallel2.wim");

    write_wim(&mut wim, &serial, WriteFlags::empty(), 1).unwrap();
    write_wim(&mut wim, &parallel, WriteFlags::empty(), 4).unwrap();
    write_wim(&mut wim, &parallel_again, WriteFlags::empty(), 4).unwrap();

    assert_eq!(read_file(&serial), read_file(&parallel));
    assert_eq!(read_file(&parallel), read_file(&parallel_again));
}

#[test]
fn parallel_writes_round_trip() {
    let payloads = mixed_payloads();
    let (mut wim, hashes) = build_wim(CompressionKind::Xpress, &payloads);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("parallel.wim");
    write_wim(&mut wim, &path, WriteFlags::empty(), 4).unwrap();

    let reopened = Wim::open(&path).unwrap();
    for (payload, hash) in payloads.iter().zip(&hashes) {
        assert_eq!(&reopened.extract_stream(hash).unwrap(), payload);
    }
}

#[test]
fn parallel_write_mixes_raw_copies_with_fresh_streams() {
    // Streams already stored in the target kind are copied verbatim by the
    // coordinator while the workers compress the new material.
    let old_payloads = vec![patterned_bytes(70_000, 40), patterned_bytes(30_000, 41)];
    let (mut wim, old_hashes) = build_wim(CompressionKind::Xpress, &old_payloads);

    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.wim");
    write_wim(&mut wim, &first, WriteFlags::empty(), 1).unwrap();

    let mut reopened = Wim::open(&first).unwrap();
    let new_payloads: Vec<Vec<u8>> = (0..10)
        .map(|i| patterned_bytes(130_000, 100 + i))
        .collect();
    let mut new_hashes = Vec::new();
    for payload in &new_payloads {
        new_hashes.push(reopened.add_stream_from_memory(Bytes::from(payload.clone())));
    }
    let mut all = old_hashes.clone();
    all.extend(new_hashes.iter().copied());
    reopened
        .add_image("combined", Bytes::from_static(b"meta2"), &all)
        .unwrap();

    let second = dir.path().join("second.wim");
    write_wim(&mut reopened, &second, WriteFlags::empty(), 4).unwrap();

    let combined = Wim::open(&second).unwrap();
    for (payload, hash) in old_payloads.iter().zip(&old_hashes) {
        assert_eq!(&combined.extract_stream(hash).unwrap(), payload);
    }
    for (payload, hash) in new_payloads.iter().zip(&new_hashes) {
        assert_eq!(&combined.extract_stream(hash).unwrap(), payload);
    }
}

#[test]
fn source_tampering_fails_the_parallel_write() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.bin");
    fs::write(&source, patterned_bytes(2_000_000, 7)).unwrap();

    let mut wim = Wim::create(CompressionKind::Lzx);
    let hash = wim.add_stream_from_file(&source).unwrap();
    wim.add_image("img", Bytes::from_static(b"meta"), &[hash])
        .unwrap();

    // Same size, different bytes: only the hash check can catch this.
    fs::write(&source, patterned_bytes(2_000_000, 8)).unwrap();

    let out = dir.path().join("out.wim");
    let err = wim
        .write(&out, ImageSelect::All, WriteFlags::empty(), 4, &mut NoopProgress)
        .unwrap_err();
    assert!(matches!(err, WimError::InvalidResourceHash { .. }));
}
