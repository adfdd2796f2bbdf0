use std::fs::File;
use std::io::{Seek, SeekFrom};

use crate::error::WimError;
use crate::format::{write_integrity_table, write_xml_data, WimHeader};
use crate::types::{ImageSelect, ResourceRecord, Result, WriteFlags};
use crate::writer::ProgressSink;

use super::Wim;

/// Finishes a write: lookup table, XML data, optional integrity table, then
/// the header, overwritten last so the file never references unwritten data.
///
/// With [`WriteFlags::NO_LOOKUP_TABLE`] the existing lookup table stays
/// authoritative (nothing new was added) and only the trailing sections are
/// rewritten. [`WriteFlags::CHECKPOINT_AFTER_XML`] flushes a temporary
/// header with a zeroed integrity record before the integrity table is
/// computed, bounding the damage if the process dies mid-computation.
pub(super) fn finish_write(
    wim: &mut Wim,
    out: &mut File,
    image: ImageSelect,
    flags: WriteFlags,
    sink: &mut dyn ProgressSink,
) -> Result<WimHeader> {
    let mut hdr = wim.hdr.clone();

    if !flags.contains(WriteFlags::NO_LOOKUP_TABLE) {
        hdr.lookup_table = wim.lookup.write(out)?;
        // Stream payloads end where the lookup table begins.
        wim.info.total_bytes = hdr.lookup_table.offset;
    }
    let total_bytes_override = if flags.contains(WriteFlags::NO_LOOKUP_TABLE) {
        wim.info.total_bytes
    } else {
        0
    };
    hdr.xml_data = write_xml_data(&wim.info, image, out, total_bytes_override)?;

    if flags.contains(WriteFlags::CHECK_INTEGRITY) {
        if flags.contains(WriteFlags::CHECKPOINT_AFTER_XML) {
            let mut checkpoint = hdr.clone();
            checkpoint.integrity = ResourceRecord::default();
            checkpoint.overwrite(out)?;
            out.sync_data().map_err(WimError::Write)?;
            out.seek(SeekFrom::End(0)).map_err(WimError::Write)?;
        }

        let old_lut_end = if flags.contains(WriteFlags::REUSE_INTEGRITY_TABLE) {
            wim.hdr.lookup_table.end()
        } else {
            0
        };
        let old_table = if flags.contains(WriteFlags::REUSE_INTEGRITY_TABLE) {
            wim.old_integrity.as_ref()
        } else {
            None
        };
        hdr.integrity = write_integrity_table(
            out,
            hdr.lookup_table.end(),
            old_lut_end,
            old_table,
            sink,
        )?;
    } else {
        hdr.integrity = ResourceRecord::default();
    }

    // Single-image writes produce a one-image archive.
    match image {
        ImageSelect::All => hdr.image_count = wim.images.len() as u32,
        ImageSelect::Index(index) => {
            hdr.image_count = 1;
            hdr.boot_index = if wim.hdr.boot_index == index { 1 } else { 0 };
        }
    }

    // The boot-metadata record mirrors the boot image's metadata resource.
    let boot_image = match image {
        ImageSelect::All => hdr.boot_index,
        ImageSelect::Index(index) if hdr.boot_index != 0 => index,
        ImageSelect::Index(_) => 0,
    };
    hdr.boot_metadata = if boot_image == 0 {
        ResourceRecord::default()
    } else {
        let image = wim
            .images
            .get(boot_image as usize - 1)
            .ok_or(WimError::InvalidImage(boot_image))?;
        wim.lookup
            .get(&image.metadata_hash)
            .ok_or(WimError::UnknownStream(image.metadata_hash))?
            .output_record()
    };

    out.seek(SeekFrom::Start(0)).map_err(WimError::Write)?;
    hdr.write(out)?;

    if flags.contains(WriteFlags::FSYNC) {
        out.sync_all().map_err(WimError::Write)?;
    }
    Ok(hdr)
}
