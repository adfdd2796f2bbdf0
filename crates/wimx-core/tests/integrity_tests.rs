mod common;

use std::fs;

use bytes::Bytes;
use common::{patterned_bytes, read_file, write_wim};
use wimx_core::{CompressionKind, NoopProgress, Wim, WimError, WriteFlags};

#[test]
fn archives_without_integrity_report_none() {
    let mut wim = Wim::create(CompressionKind::None);
    let hash = wim.add_stream_from_memory(Bytes::from_static(b"content"));
    wim.add_image("img", Bytes::from_static(b"m"), &[hash]).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plain.wim");
    write_wim(&mut wim, &path, WriteFlags::empty(), 1).unwrap();

    let reopened = Wim::open(&path).unwrap();
    assert_eq!(reopened.verify_integrity(&mut NoopProgress).unwrap(), None);
}

#[test]
fn integrity_catches_payload_corruption() {
    let payload = patterned_bytes(120_000, 17);
    let mut wim = Wim::create(CompressionKind::Lzx);
    let hash = wim.add_stream_from_memory(Bytes::from(payload.clone()));
    wim.add_image("img", Bytes::from_static(b"m"), &[hash]).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checked.wim");
    write_wim(&mut wim, &path, WriteFlags::CHECK_INTEGRITY, 1).unwrap();

    let reopened = Wim::open(&path).unwrap();
    assert_eq!(reopened.verify_integrity(&mut NoopProgress).unwrap(), Some(true));

    // Flip one byte inside the stream payload.
    let record = reopened.lookup().get(&hash).unwrap().resource;
    let mut bytes = read_file(&path);
    let target = record.offset as usize + record.size as usize / 2;
    bytes[target] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let corrupted = Wim::open(&path).unwrap();
    assert_eq!(
        corrupted.verify_integrity(&mut NoopProgress).unwrap(),
        Some(false)
    );
    assert!(matches!(
        corrupted.extract_stream(&hash),
        Err(WimError::InvalidResourceHash { .. }) | Err(WimError::Decompression(_))
    ));
}

#[test]
fn reused_integrity_entries_still_cover_the_old_region() {
    let old_payload = patterned_bytes(200_000, 30);
    let mut wim = Wim::create(CompressionKind::Xpress);
    let old_hash = wim.add_stream_from_memory(Bytes::from(old_payload));
    wim.add_image("base", Bytes::from_static(b"m1"), &[old_hash])
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reuse.wim");
    write_wim(&mut wim, &path, WriteFlags::CHECK_INTEGRITY, 1).unwrap();

    let mut reopened = Wim::open(&path).unwrap();
    let new_hash = reopened.add_stream_from_memory(Bytes::from(patterned_bytes(60_000, 31)));
    reopened
        .add_image("extra", Bytes::from_static(b"m2"), &[new_hash])
        .unwrap();
    reopened
        .overwrite(WriteFlags::CHECK_INTEGRITY, 1, &mut NoopProgress)
        .unwrap();

    let grown = Wim::open(&path).unwrap();
    assert_eq!(grown.verify_integrity(&mut NoopProgress).unwrap(), Some(true));

    // Corrupting a byte in the pre-append region must still be detected.
    let record = grown.lookup().get(&old_hash).unwrap().resource;
    let mut bytes = read_file(&path);
    bytes[record.offset as usize + 3] ^= 0x01;
    fs::write(&path, &bytes).unwrap();

    let corrupted = Wim::open(&path).unwrap();
    assert_eq!(
        corrupted.verify_integrity(&mut NoopProgress).unwrap(),
        Some(false)
    );
}
