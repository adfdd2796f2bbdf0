mod common;

use std::fs;

use bytes::Bytes;
use common::{patterned_bytes, read_file, write_wim};
use wimx_core::{
    CompressionKind, NoopProgress, Wim, WimError, WimHeader, WriteFlags, HEADER_SIZE,
};

fn parse_header(bytes: &[u8]) -> WimHeader {
    WimHeader::from_bytes(bytes[..HEADER_SIZE].try_into().unwrap()).unwrap()
}

#[test]
fn append_preserves_existing_bytes_and_links_new_sections() {
    let mut wim = Wim::create(CompressionKind::Xpress);
    let old_payload = patterned_bytes(150_000, 1);
    let old_hash = wim.add_stream_from_memory(Bytes::from(old_payload.clone()));
    wim.add_image("base", Bytes::from_static(b"m1"), &[old_hash])
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grow.wim");
    write_wim(&mut wim, &path, WriteFlags::CHECK_INTEGRITY, 1).unwrap();
    let before = read_file(&path);
    let old_hdr = parse_header(&before);
    let old_end = old_hdr.integrity.end();
    assert_eq!(before.len() as u64, old_end);

    let mut reopened = Wim::open(&path).unwrap();
    let new_payload = patterned_bytes(1_500_000, 2);
    let new_hash = reopened.add_stream_from_memory(Bytes::from(new_payload.clone()));
    reopened
        .add_image("extra", Bytes::from_static(b"m2"), &[new_hash])
        .unwrap();
    reopened
        .overwrite(WriteFlags::CHECK_INTEGRITY, 4, &mut NoopProgress)
        .unwrap();

    let after = read_file(&path);
    assert!(after.len() as u64 > old_end);
    // Everything below the old end except the header is untouched.
    assert_eq!(
        &after[HEADER_SIZE..old_end as usize],
        &before[HEADER_SIZE..old_end as usize],
    );

    let grown = Wim::open(&path).unwrap();
    assert_eq!(grown.image_count(), 2);
    let new_record = grown.lookup().get(&new_hash).unwrap().resource;
    assert!(new_record.offset >= old_end);
    assert!(grown.header().lookup_table.offset > new_record.offset);
    assert_eq!(grown.extract_stream(&old_hash).unwrap(), old_payload);
    assert_eq!(grown.extract_stream(&new_hash).unwrap(), new_payload);
    assert_eq!(grown.verify_integrity(&mut NoopProgress).unwrap(), Some(true));
}

#[test]
fn untouched_archive_keeps_its_lookup_table_on_overwrite() {
    let mut wim = Wim::create(CompressionKind::None);
    let hash = wim.add_stream_from_memory(Bytes::from(patterned_bytes(30_000, 9)));
    wim.add_image("img", Bytes::from_static(b"m"), &[hash]).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stable.wim");
    write_wim(&mut wim, &path, WriteFlags::empty(), 1).unwrap();
    let old_hdr = parse_header(&read_file(&path));

    let mut reopened = Wim::open(&path).unwrap();
    reopened
        .overwrite(WriteFlags::CHECK_INTEGRITY, 1, &mut NoopProgress)
        .unwrap();

    let new_hdr = parse_header(&read_file(&path));
    assert_eq!(new_hdr.lookup_table, old_hdr.lookup_table);
    // The XML data is rewritten in place, directly after the lookup table.
    assert_eq!(new_hdr.xml_data.offset, old_hdr.lookup_table.end());
    assert!(!new_hdr.integrity.is_empty());

    let checked = Wim::open(&path).unwrap();
    assert_eq!(checked.verify_integrity(&mut NoopProgress).unwrap(), Some(true));
    assert_eq!(
        checked.extract_stream(&hash).unwrap(),
        patterned_bytes(30_000, 9)
    );
}

#[test]
fn failed_append_truncates_back_to_the_original_archive() {
    let mut wim = Wim::create(CompressionKind::Xpress);
    let hash = wim.add_stream_from_memory(Bytes::from(patterned_bytes(50_000, 4)));
    wim.add_image("base", Bytes::from_static(b"m"), &[hash]).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rollback.wim");
    write_wim(&mut wim, &path, WriteFlags::empty(), 1).unwrap();
    let before = read_file(&path);

    let source = dir.path().join("source.bin");
    fs::write(&source, patterned_bytes(80_000, 5)).unwrap();

    let mut reopened = Wim::open(&path).unwrap();
    let tampered = reopened.add_stream_from_file(&source).unwrap();
    reopened
        .add_image("broken", Bytes::from_static(b"m2"), &[tampered])
        .unwrap();

    // Same length, different content; caught only by the hash check.
    fs::write(&source, patterned_bytes(80_000, 6)).unwrap();

    let err = reopened
        .overwrite(WriteFlags::empty(), 1, &mut NoopProgress)
        .unwrap_err();
    assert!(matches!(err, WimError::InvalidResourceHash { .. }));
    assert_eq!(read_file(&path), before, "append must roll back completely");
}

#[test]
fn failed_rebuild_unlinks_the_temporary_file() {
    let mut wim = Wim::create(CompressionKind::Xpress);
    let hash = wim.add_stream_from_memory(Bytes::from(patterned_bytes(50_000, 4)));
    wim.add_image("base", Bytes::from_static(b"m"), &[hash]).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rebuild.wim");
    write_wim(&mut wim, &path, WriteFlags::empty(), 1).unwrap();
    let before = read_file(&path);

    let source = dir.path().join("source.bin");
    fs::write(&source, patterned_bytes(64_000, 5)).unwrap();

    let mut reopened = Wim::open(&path).unwrap();
    let tampered = reopened.add_stream_from_file(&source).unwrap();
    reopened
        .add_image("broken", Bytes::from_static(b"m2"), &[tampered])
        .unwrap();
    fs::write(&source, patterned_bytes(64_000, 6)).unwrap();

    let err = reopened
        .overwrite(WriteFlags::REBUILD, 1, &mut NoopProgress)
        .unwrap_err();
    assert!(matches!(err, WimError::InvalidResourceHash { .. }));

    assert_eq!(read_file(&path), before, "the original archive is untouched");
    let survivors: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert_eq!(survivors.len(), 2, "only the archive and the source remain");
}

#[cfg(unix)]
#[test]
fn concurrent_appends_are_refused() {
    use nix::fcntl::{Flock, FlockArg};

    let mut wim = Wim::create(CompressionKind::None);
    let hash = wim.add_stream_from_memory(Bytes::from_static(b"content"));
    wim.add_image("img", Bytes::from_static(b"m"), &[hash]).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("locked.wim");
    write_wim(&mut wim, &path, WriteFlags::empty(), 1).unwrap();

    let holder = fs::File::open(&path).unwrap();
    let _lock = Flock::lock(holder, FlockArg::LockExclusiveNonblock).unwrap();

    let mut reopened = Wim::open(&path).unwrap();
    let err = reopened
        .overwrite(WriteFlags::empty(), 1, &mut NoopProgress)
        .unwrap_err();
    assert!(matches!(err, WimError::AlreadyLocked(_)));
}
