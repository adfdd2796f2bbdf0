use std::path::Path;

use serde::Serialize;

use crate::types::CompressionKind;

/// Running totals for a stream-writing pass.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct WriteProgress {
    pub total_bytes: u64,
    pub total_streams: u64,
    pub completed_bytes: u64,
    pub completed_streams: u64,
    /// Worker threads in use; 1 for serial writes.
    pub num_threads: usize,
    pub kind: CompressionKind,
}

/// Progress of an integrity-table computation.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct IntegrityProgress {
    pub total_chunks: u64,
    pub completed_chunks: u64,
}

/// Receives progress events during writes. All methods default to no-ops so
/// sinks implement only what they display.
pub trait ProgressSink {
    fn on_write_streams(&mut self, _progress: &WriteProgress) {}

    fn on_integrity(&mut self, _progress: &IntegrityProgress) {}

    /// A rebuild finished and the temporary file replaced the original.
    fn on_rename(&mut self, _from: &Path, _to: &Path) {}
}

/// Sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {}

/// Adapts a closure into a write-streams progress sink.
pub struct FnProgressSink<F: FnMut(&WriteProgress)> {
    pub callback: F,
}

impl<F: FnMut(&WriteProgress)> ProgressSink for FnProgressSink<F> {
    fn on_write_streams(&mut self, progress: &WriteProgress) {
        (self.callback)(progress);
    }
}
