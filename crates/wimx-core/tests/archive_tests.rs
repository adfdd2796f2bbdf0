mod common;

use bytes::Bytes;
use common::{patterned_bytes, write_wim};
use wimx_core::{
    CompressionKind, ImageSelect, NoopProgress, Wim, WimError, WriteFlags,
};

#[test]
fn multi_image_archives_share_streams() {
    let shared = patterned_bytes(64_000, 1);
    let only_a = patterned_bytes(20_000, 2);
    let only_b = patterned_bytes(24_000, 3);

    let mut wim = Wim::create(CompressionKind::Xpress);
    let shared_hash = wim.add_stream_from_memory(Bytes::from(shared.clone()));
    let a_hash = wim.add_stream_from_memory(Bytes::from(only_a.clone()));
    let b_hash = wim.add_stream_from_memory(Bytes::from(only_b.clone()));
    wim.add_image("alpha", Bytes::from_static(b"alpha-meta"), &[shared_hash, a_hash])
        .unwrap();
    wim.add_image("beta", Bytes::from_static(b"beta-meta"), &[shared_hash, b_hash])
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("multi.wim");
    write_wim(&mut wim, &path, WriteFlags::empty(), 1).unwrap();

    let reopened = Wim::open(&path).unwrap();
    assert_eq!(reopened.image_count(), 2);
    assert_eq!(reopened.images()[0].name, "alpha");
    assert_eq!(reopened.images()[1].name, "beta");
    assert_eq!(reopened.info().images[0].file_count, 2);

    // 3 content streams + 2 metadata streams; the shared one is stored once.
    assert_eq!(reopened.lookup().len(), 5);
    assert_eq!(reopened.extract_stream(&shared_hash).unwrap(), shared);
    assert_eq!(reopened.extract_stream(&a_hash).unwrap(), only_a);
    assert_eq!(reopened.extract_stream(&b_hash).unwrap(), only_b);
}

#[test]
fn single_image_write_selects_only_that_image() {
    let mut wim = Wim::create(CompressionKind::None);
    let a = wim.add_stream_from_memory(Bytes::from(patterned_bytes(10_000, 1)));
    let b = wim.add_stream_from_memory(Bytes::from(patterned_bytes(12_000, 2)));
    wim.add_image("first", Bytes::from_static(b"m1"), &[a]).unwrap();
    wim.add_image("second", Bytes::from_static(b"m2"), &[b]).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("single.wim");
    wim.write(
        &path,
        ImageSelect::Index(2),
        WriteFlags::empty(),
        1,
        &mut NoopProgress,
    )
    .unwrap();

    let reopened = Wim::open(&path).unwrap();
    assert_eq!(reopened.image_count(), 1);
    assert_eq!(reopened.images()[0].name, "second");
    assert!(reopened.lookup().get(&b).is_some());
    assert!(reopened.lookup().get(&a).is_none());
}

#[test]
fn boot_image_metadata_is_mirrored_in_the_header() {
    let mut wim = Wim::create(CompressionKind::None);
    let a = wim.add_stream_from_memory(Bytes::from_static(b"content"));
    wim.add_image("bootable", Bytes::from_static(b"boot-meta"), &[a])
        .unwrap();
    wim.set_boot_index(1).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("boot.wim");
    write_wim(&mut wim, &path, WriteFlags::empty(), 1).unwrap();

    let reopened = Wim::open(&path).unwrap();
    assert_eq!(reopened.header().boot_index, 1);
    let metadata_entry = reopened
        .lookup()
        .get(&reopened.images()[0].metadata_hash)
        .unwrap();
    assert_eq!(
        reopened.header().boot_metadata,
        metadata_entry.resource,
        "boot metadata record must mirror the boot image's metadata resource"
    );
}

#[test]
fn image_validation_errors() {
    let mut wim = Wim::create(CompressionKind::None);
    let missing = wimx_core::StreamHash::of(b"never added");
    assert!(matches!(
        wim.add_image("broken", Bytes::from_static(b"m"), &[missing]),
        Err(WimError::UnknownStream(_))
    ));

    let a = wim.add_stream_from_memory(Bytes::from_static(b"content"));
    wim.add_image("ok", Bytes::from_static(b"m"), &[a]).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad-image.wim");
    assert!(matches!(
        wim.write(&path, ImageSelect::Index(5), WriteFlags::empty(), 1, &mut NoopProgress),
        Err(WimError::InvalidImage(5))
    ));
    assert!(matches!(
        wim.delete_image(0),
        Err(WimError::InvalidImage(0))
    ));
}

#[test]
fn deleting_an_image_forces_a_rebuild() {
    let mut wim = Wim::create(CompressionKind::Xpress);
    let a = wim.add_stream_from_memory(Bytes::from(patterned_bytes(40_000, 1)));
    let b = wim.add_stream_from_memory(Bytes::from(patterned_bytes(40_000, 2)));
    wim.add_image("keep", Bytes::from_static(b"m1"), &[a]).unwrap();
    wim.add_image("drop", Bytes::from_static(b"m2"), &[b]).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("delete.wim");
    write_wim(&mut wim, &path, WriteFlags::empty(), 1).unwrap();

    let mut reopened = Wim::open(&path).unwrap();
    reopened.delete_image(2).unwrap();
    reopened
        .overwrite(WriteFlags::empty(), 1, &mut NoopProgress)
        .unwrap();

    let rebuilt = Wim::open(&path).unwrap();
    assert_eq!(rebuilt.image_count(), 1);
    assert_eq!(rebuilt.images()[0].name, "keep");
    assert_eq!(rebuilt.extract_stream(&a).unwrap(), patterned_bytes(40_000, 1));
}

#[test]
fn writing_over_the_backing_file_is_refused() {
    let mut wim = Wim::create(CompressionKind::None);
    let a = wim.add_stream_from_memory(Bytes::from_static(b"content"));
    wim.add_image("img", Bytes::from_static(b"m"), &[a]).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("self.wim");
    write_wim(&mut wim, &path, WriteFlags::empty(), 1).unwrap();

    let mut reopened = Wim::open(&path).unwrap();
    assert!(matches!(
        reopened.write(&path, ImageSelect::All, WriteFlags::empty(), 1, &mut NoopProgress),
        Err(WimError::InvalidParam(_))
    ));
}
