use std::fs::File;

use crate::error::WimError;
use crate::format::LookupTable;
use crate::hash::StreamHash;
use crate::resource::write_stream;
use crate::types::{CompressionKind, Result};

use super::progress::{ProgressSink, WriteProgress};

/// Writes each stream in the calling thread, one after another.
///
/// Also the fallback when the parallel writer cannot start its workers.
pub(super) fn write_stream_list_serial(
    lookup: &mut LookupTable,
    order: &[StreamHash],
    out: &mut File,
    out_kind: CompressionKind,
    recompress: bool,
    progress: &mut WriteProgress,
    sink: &mut dyn ProgressSink,
) -> Result<()> {
    progress.num_threads = 1;
    sink.on_write_streams(progress);

    for hash in order {
        let entry = lookup
            .get_mut(hash)
            .ok_or(WimError::UnknownStream(*hash))?;
        let record = write_stream(entry, out, out_kind, recompress)?;
        entry.out_resource = Some(record);

        progress.completed_bytes += entry.size();
        progress.completed_streams += 1;
        sink.on_write_streams(progress);
    }
    Ok(())
}
