mod parallel;
mod progress;
mod serial;

use std::fs::File;

use crate::format::LookupTable;
use crate::hash::StreamHash;
use crate::types::{CompressionKind, Result, WriteFlags};

pub use progress::{FnProgressSink, IntegrityProgress, NoopProgress, ProgressSink, WriteProgress};

/// Compressible volume below which threading overhead outweighs the win and
/// the serial writer is used instead.
const PARALLEL_THRESHOLD: u64 = 1_000_000;

/// Writes the listed streams to the output file in order.
///
/// Streams whose bytes actually need compressing are counted first; when
/// enough compressible volume exists and more than one thread is allowed,
/// the parallel writer takes over. Either way the streams land in the output
/// in exactly the order of `order`, and each entry's `out_resource` is
/// populated as it completes.
pub(crate) fn write_stream_list(
    lookup: &mut LookupTable,
    order: &[StreamHash],
    out: &mut File,
    out_kind: CompressionKind,
    flags: WriteFlags,
    num_threads: usize,
    sink: &mut dyn ProgressSink,
) -> Result<()> {
    let recompress = flags.contains(WriteFlags::RECOMPRESS);
    let num_threads = if num_threads == 0 {
        num_cpus::get()
    } else {
        num_threads
    };

    let mut total_bytes = 0u64;
    let mut compression_bytes = 0u64;
    for hash in order {
        if let Some(entry) = lookup.get(hash) {
            total_bytes += entry.size();
            if out_kind != CompressionKind::None && (entry.kind != out_kind || recompress) {
                compression_bytes += entry.size();
            }
        }
    }

    let mut progress = WriteProgress {
        total_bytes,
        total_streams: order.len() as u64,
        completed_bytes: 0,
        completed_streams: 0,
        num_threads,
        kind: out_kind,
    };

    if compression_bytes >= PARALLEL_THRESHOLD && num_threads != 1 {
        parallel::write_stream_list_parallel(
            lookup,
            order,
            out,
            out_kind,
            recompress,
            num_threads,
            &mut progress,
            sink,
        )
    } else {
        serial::write_stream_list_serial(
            lookup,
            order,
            out,
            out_kind,
            recompress,
            &mut progress,
            sink,
        )
    }
}
