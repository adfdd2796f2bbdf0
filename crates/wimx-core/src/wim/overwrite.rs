use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::Path;

use log::warn;

use crate::error::WimError;
use crate::format::read_integrity_table;
use crate::hash::StreamHash;
use crate::resource::{write_stream, StreamSource};
use crate::types::{ImageSelect, Result, WriteFlags};
use crate::writer::{write_stream_list, ProgressSink};

use super::{finalize, Wim};

/// Appends new streams and metadata past the end of the existing archive,
/// then rewrites the trailing sections and finally the header.
///
/// Until the header goes out, nothing in the file references the appended
/// data, so truncating back to the original end at any point recovers the
/// archive exactly. On failure that truncation is attempted here.
pub(super) fn overwrite_inplace(
    wim: &mut Wim,
    flags: WriteFlags,
    num_threads: usize,
    sink: &mut dyn ProgressSink,
) -> Result<()> {
    let path = wim.path.clone().ok_or(WimError::NoFilename)?;

    // The append point must not sit in front of live sections.
    if !wim.hdr.integrity.is_empty() && wim.hdr.integrity.offset < wim.hdr.xml_data.offset {
        return Err(WimError::ResourceOrder(
            "integrity table lies before the XML data",
        ));
    }
    if wim.hdr.lookup_table.offset > wim.hdr.xml_data.offset {
        return Err(WimError::ResourceOrder(
            "lookup table lies after the XML data",
        ));
    }

    let mut flags = flags;
    let mut old_end = if !wim.hdr.integrity.is_empty() {
        wim.hdr.integrity.end()
    } else {
        wim.hdr.xml_data.end()
    };
    if !wim.deletion_occurred && !wim.any_images_modified() {
        // Nothing changed, so the old lookup table stays authoritative and
        // only the sections after it are rewritten.
        old_end = wim.hdr.lookup_table.end();
        flags |= WriteFlags::NO_LOOKUP_TABLE | WriteFlags::CHECKPOINT_AFTER_XML;
    }

    // Every entry carries its current record into the new lookup table;
    // streams not yet in this archive queue up for appending.
    let mut new_streams: Vec<StreamHash> = Vec::new();
    for hash in wim.lookup.order().to_vec() {
        let entry = wim
            .lookup
            .get_mut(&hash)
            .ok_or(WimError::UnknownStream(hash))?;

        let in_this_archive = match &entry.source {
            StreamSource::InArchive { path: source, record, .. } => {
                if source == &path && record.end() > old_end {
                    return Err(WimError::ResourceOrder(
                        "a resource lies beyond the append point",
                    ));
                }
                source == &path
            }
            _ => false,
        };

        entry.out_refcnt = entry.refcnt;
        entry.out_resource = Some(entry.resource);
        if !entry.is_metadata() && !in_this_archive {
            new_streams.push(hash);
        }
    }

    let mut out = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|source| WimError::Open {
            path: path.clone(),
            source,
        })?;
    let _lock = lock::acquire(&out, &path)?;

    out.seek(SeekFrom::Start(old_end)).map_err(WimError::Write)?;

    let result = append_and_finish(wim, &mut out, &path, flags, num_threads, sink, &new_streams);
    if result.is_err() && !flags.contains(WriteFlags::NO_LOOKUP_TABLE) {
        warn!(
            "truncating `{}` back to its previous {} bytes",
            path.display(),
            old_end
        );
        let _ = out.set_len(old_end);
    }
    result
}

fn append_and_finish(
    wim: &mut Wim,
    out: &mut File,
    path: &Path,
    flags: WriteFlags,
    num_threads: usize,
    sink: &mut dyn ProgressSink,
    new_streams: &[StreamHash],
) -> Result<()> {
    if !new_streams.is_empty() {
        write_stream_list(
            &mut wim.lookup,
            new_streams,
            out,
            wim.kind,
            flags,
            num_threads,
            sink,
        )?;
    }

    // Metadata resources keep their relative order in the file, so the
    // first modified image forces every later one to be rewritten too.
    let mut found_modified = false;
    for i in 0..wim.images.len() {
        found_modified |= wim.images[i].modified;
        if !found_modified {
            continue;
        }
        let hash = wim.images[i].metadata_hash;
        let entry = wim
            .lookup
            .get_mut(&hash)
            .ok_or(WimError::UnknownStream(hash))?;
        let record = write_stream(
            entry,
            out,
            wim.kind,
            flags.contains(WriteFlags::RECOMPRESS),
        )?;
        entry.out_resource = Some(record);
    }

    let final_hdr = finalize::finish_write(
        wim,
        out,
        ImageSelect::All,
        flags | WriteFlags::REUSE_INTEGRITY_TABLE,
        sink,
    )?;

    wim.hdr = final_hdr;
    wim.old_integrity = if wim.hdr.integrity.is_empty() {
        None
    } else {
        read_integrity_table(out, &wim.hdr.integrity).ok()
    };
    wim.lookup.commit_written(path, wim.kind);
    for image in &mut wim.images {
        image.modified = false;
    }
    wim.deletion_occurred = false;
    Ok(())
}

/// Writes a complete replacement archive next to the original and renames it
/// into place. The temporary file is unlinked on any failure.
pub(super) fn overwrite_via_tmpfile(
    wim: &mut Wim,
    flags: WriteFlags,
    num_threads: usize,
    sink: &mut dyn ProgressSink,
) -> Result<()> {
    let path = wim.path.clone().ok_or(WimError::NoFilename)?;
    let file_name = path
        .file_name()
        .ok_or(WimError::InvalidParam("archive path has no file name"))?;
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let dir = dir.unwrap_or_else(|| Path::new("."));

    let temp = tempfile::Builder::new()
        .prefix(file_name)
        .rand_bytes(9)
        .tempfile_in(dir)
        .map_err(|source| WimError::Open {
            path: dir.to_path_buf(),
            source,
        })?;
    let temp_path = temp.path().to_path_buf();

    let final_hdr = wim.write_to_path(
        &temp_path,
        ImageSelect::All,
        (flags & WriteFlags::PUBLIC) | WriteFlags::FSYNC,
        num_threads,
        sink,
    )?;

    temp.persist(&path).map_err(|err| WimError::Rename {
        from: temp_path.clone(),
        to: path.clone(),
        source: err.error,
    })?;
    sink.on_rename(&temp_path, &path);

    let mut file = File::open(&path).map_err(|source| {
        warn!("rebuilt archive `{}` cannot be re-opened", path.display());
        WimError::Reopen {
            path: path.clone(),
            source,
        }
    })?;
    wim.hdr = final_hdr;
    wim.old_integrity = if wim.hdr.integrity.is_empty() {
        None
    } else {
        read_integrity_table(&mut file, &wim.hdr.integrity).ok()
    };
    wim.lookup.commit_written(&path, wim.kind);
    for image in &mut wim.images {
        image.modified = false;
    }
    wim.deletion_occurred = false;
    Ok(())
}

#[cfg(unix)]
mod lock {
    use std::fs::File;
    use std::path::Path;

    use nix::errno::Errno;
    use nix::fcntl::{Flock, FlockArg};

    use crate::error::WimError;
    use crate::types::Result;

    /// Advisory exclusive lock held for the duration of an in-place append.
    pub struct AppendLock {
        _flock: Flock<File>,
    }

    pub fn acquire(file: &File, path: &Path) -> Result<AppendLock> {
        let dup = file.try_clone().map_err(|source| WimError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        match Flock::lock(dup, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(AppendLock { _flock: flock }),
            Err((_, Errno::EWOULDBLOCK)) => Err(WimError::AlreadyLocked(path.to_path_buf())),
            Err((_, errno)) => Err(WimError::Open {
                path: path.to_path_buf(),
                source: std::io::Error::from_raw_os_error(errno as i32),
            }),
        }
    }
}

#[cfg(not(unix))]
mod lock {
    use std::fs::File;
    use std::path::Path;

    use crate::types::Result;

    pub struct AppendLock;

    pub fn acquire(_file: &File, _path: &Path) -> Result<AppendLock> {
        Ok(AppendLock)
    }
}
