//! Parallel stream writer: one coordinator thread (the caller) feeding a
//! pool of compressor workers over two bounded queues.
//!
//! The coordinator does all reading and all writing. Workers only compress
//! in-memory chunk groups and never touch shared state beyond the queues, so
//! they may finish in any order; the coordinator reassembles per-stream chunk
//! order through a pending map and never starts writing a stream before every
//! earlier stream in the input list has been fully written.

use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::io::Write;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::warn;

use crate::compression::compress_chunk;
use crate::error::WimError;
use crate::format::{LookupTable, CHUNK_SIZE};
use crate::hash::{StreamDigest, StreamHash};
use crate::resource::{rewrite_stream_uncompressed, write_stream, ChunkTable, ResourceReader};
use crate::types::{CompressionKind, ResourceFlags, ResourceRecord, Result};

use super::progress::{ProgressSink, WriteProgress};
use super::serial::write_stream_list_serial;

/// Chunk groups per message handed to a worker.
const MAX_CHUNKS_PER_MESSAGE: usize = 2;
/// Messages (and queue slots) allocated per worker thread.
const MESSAGES_PER_THREAD: usize = 2;

/// One unit of compression work. The pool of messages is allocated once and
/// recycled through the coordinator's free list, so peak memory stays
/// proportional to the thread count no matter how large the streams are.
struct ChunkMessage {
    stream_seq: u64,
    begin_chunk: u64,
    num_chunks: usize,
    uncompressed: [Vec<u8>; MAX_CHUNKS_PER_MESSAGE],
    stored: [Vec<u8>; MAX_CHUNKS_PER_MESSAGE],
    uncompressed_sizes: [usize; MAX_CHUNKS_PER_MESSAGE],
    /// Stored size per chunk. Equal to the uncompressed size when the chunk
    /// did not shrink, which also selects the uncompressed buffer for the
    /// write; there is no separate marker, matching the on-disk format.
    stored_sizes: [usize; MAX_CHUNKS_PER_MESSAGE],
}

impl ChunkMessage {
    fn new() -> Self {
        Self {
            stream_seq: 0,
            begin_chunk: 0,
            num_chunks: 0,
            uncompressed: std::array::from_fn(|_| vec![0u8; CHUNK_SIZE]),
            stored: std::array::from_fn(|_| vec![0u8; CHUNK_SIZE]),
            uncompressed_sizes: [0; MAX_CHUNKS_PER_MESSAGE],
            stored_sizes: [0; MAX_CHUNKS_PER_MESSAGE],
        }
    }
}

/// Compressor worker loop. A `None` message is the shutdown sentinel.
fn compressor_worker(
    work_rx: Receiver<Option<ChunkMessage>>,
    done_tx: Sender<ChunkMessage>,
    kind: CompressionKind,
) {
    while let Ok(Some(mut msg)) = work_rx.recv() {
        for i in 0..msg.num_chunks {
            let len = msg.uncompressed_sizes[i];
            match compress_chunk(&msg.uncompressed[i][..len], kind) {
                Some(packed) => {
                    msg.stored[i][..packed.len()].copy_from_slice(&packed);
                    msg.stored_sizes[i] = packed.len();
                }
                None => msg.stored_sizes[i] = len,
            }
        }
        if done_tx.send(msg).is_err() {
            break;
        }
    }
}

/// A stream currently being read and fed to the workers.
struct ReadCursor {
    seq: u64,
    hash: StreamHash,
    size: u64,
    num_chunks: u64,
    next_chunk: u64,
    reader: ResourceReader,
    digest: StreamDigest,
}

/// A stream with chunks dispatched but not yet fully written. The front of
/// the outstanding queue is the stream currently being written.
struct InFlightStream {
    seq: u64,
    hash: StreamHash,
    size: u64,
    num_chunks: u64,
    next_write_chunk: u64,
    /// Compressed messages waiting for their turn, keyed by begin chunk.
    pending: BTreeMap<u64, ChunkMessage>,
    chunk_table: Option<ChunkTable>,
}

struct Coordinator<'a> {
    lookup: &'a mut LookupTable,
    order: &'a [StreamHash],
    out: &'a mut File,
    out_kind: CompressionKind,
    recompress: bool,
    work_tx: &'a Sender<Option<ChunkMessage>>,
    done_rx: &'a Receiver<ChunkMessage>,
    free: Vec<ChunkMessage>,
    outstanding: VecDeque<InFlightStream>,
    /// Streams that need no compression; written by the coordinator itself
    /// between finished parallel streams.
    direct: Vec<StreamHash>,
    reading: Option<ReadCursor>,
    next_index: usize,
    next_seq: u64,
    in_flight_msgs: usize,
    progress: &'a mut WriteProgress,
    sink: &'a mut dyn ProgressSink,
}

impl Coordinator<'_> {
    fn run(&mut self) -> Result<()> {
        loop {
            self.dispatch()?;

            if self.outstanding.is_empty() {
                break;
            }

            let msg = self
                .done_rx
                .recv()
                .map_err(|_| worker_lost())?;
            self.in_flight_msgs -= 1;
            self.route_completed(msg)?;
            self.write_ready()?;
        }

        self.write_direct()
    }

    /// Phase A: fill free messages with chunks of the stream being read and
    /// hand them to the workers, advancing across streams as each one's
    /// chunks are exhausted.
    fn dispatch(&mut self) -> Result<()> {
        while let Some(mut msg) = self.free.pop() {
            if self.reading.is_none() && !self.advance_reading()? {
                self.free.push(msg);
                break;
            }

            let cursor = self.reading.as_mut().expect("advance_reading set a cursor");
            let begin_chunk = cursor.next_chunk;
            let num_chunks =
                ((cursor.num_chunks - begin_chunk) as usize).min(MAX_CHUNKS_PER_MESSAGE);
            for i in 0..num_chunks {
                let offset = cursor.next_chunk * CHUNK_SIZE as u64;
                let to_read = ((cursor.size - offset).min(CHUNK_SIZE as u64)) as usize;
                cursor.reader.read(offset, &mut msg.uncompressed[i][..to_read])?;
                cursor.digest.update(&msg.uncompressed[i][..to_read]);
                msg.uncompressed_sizes[i] = to_read;
                cursor.next_chunk += 1;
            }
            msg.stream_seq = cursor.seq;
            msg.begin_chunk = begin_chunk;
            msg.num_chunks = num_chunks;

            let finished_reading = cursor.next_chunk == cursor.num_chunks;
            self.work_tx
                .send(Some(msg))
                .map_err(|_| worker_lost())?;
            self.in_flight_msgs += 1;

            if finished_reading {
                let cursor = self.reading.take().expect("cursor still present");
                let actual = cursor.digest.finalize();
                let entry = self
                    .lookup
                    .get_mut(&cursor.hash)
                    .ok_or(WimError::UnknownStream(cursor.hash))?;
                if actual != entry.hash {
                    return Err(WimError::InvalidResourceHash {
                        expected: entry.hash,
                        actual,
                    });
                }
            }
        }
        Ok(())
    }

    /// Advances the input cursor to the next stream that needs compression,
    /// setting it up for reading. Streams that need none are queued for
    /// direct writing. Returns false once the input list is exhausted.
    fn advance_reading(&mut self) -> Result<bool> {
        while self.next_index < self.order.len() {
            let hash = self.order[self.next_index];
            self.next_index += 1;

            let entry = self
                .lookup
                .get(&hash)
                .ok_or(WimError::UnknownStream(hash))?;
            if entry.size() == 0 || (!self.recompress && entry.kind == self.out_kind) {
                self.direct.push(hash);
                continue;
            }

            let reader = ResourceReader::open(&entry.source)?;
            let size = entry.size();
            let num_chunks = ChunkTable::chunk_count_for(size);
            let seq = self.next_seq;
            self.next_seq += 1;

            self.reading = Some(ReadCursor {
                seq,
                hash,
                size,
                num_chunks,
                next_chunk: 0,
                reader,
                digest: StreamDigest::new(),
            });
            self.outstanding.push_back(InFlightStream {
                seq,
                hash,
                size,
                num_chunks,
                next_write_chunk: 0,
                pending: BTreeMap::new(),
                chunk_table: None,
            });
            return Ok(true);
        }
        Ok(false)
    }

    /// Files a compressed message under its stream, keyed by begin chunk.
    fn route_completed(&mut self, msg: ChunkMessage) -> Result<()> {
        let stream = self
            .outstanding
            .iter_mut()
            .find(|stream| stream.seq == msg.stream_seq)
            .ok_or(WimError::Compression(
                "worker returned a message for an unknown stream".to_string(),
            ))?;
        stream.pending.insert(msg.begin_chunk, msg);
        Ok(())
    }

    /// Phase B: write every contiguous run of completed chunks available at
    /// the head of the outstanding queue, finalizing streams as they close.
    fn write_ready(&mut self) -> Result<()> {
        loop {
            let Some(head) = self.outstanding.front_mut() else {
                break;
            };
            let Some(msg) = head.pending.remove(&head.next_write_chunk) else {
                break;
            };

            if msg.begin_chunk == 0 {
                head.chunk_table = Some(ChunkTable::begin(head.size, self.out)?);
            }
            let chunk_table = head
                .chunk_table
                .as_mut()
                .expect("chunk table starts with chunk 0");

            for i in 0..msg.num_chunks {
                let stored = msg.stored_sizes[i];
                let buf = if stored == msg.uncompressed_sizes[i] {
                    &msg.uncompressed[i][..stored]
                } else {
                    &msg.stored[i][..stored]
                };
                self.out.write_all(buf).map_err(WimError::Write)?;
                chunk_table.record_chunk(stored as u64);
            }
            head.next_write_chunk += msg.num_chunks as u64;

            let finished = head.next_write_chunk == head.num_chunks;
            self.free.push(msg);

            if finished {
                let stream = self
                    .outstanding
                    .pop_front()
                    .expect("head was just borrowed");
                let chunk_table = stream
                    .chunk_table
                    .expect("finished stream has a chunk table");
                let stored_size = chunk_table.finish(self.out)?;

                let entry = self
                    .lookup
                    .get_mut(&stream.hash)
                    .ok_or(WimError::UnknownStream(stream.hash))?;
                let record = if stored_size >= stream.size {
                    rewrite_stream_uncompressed(entry, self.out, chunk_table.file_offset())?
                } else {
                    let mut flags = entry.resource.flags & !ResourceFlags::COMPRESSED;
                    flags |= ResourceFlags::COMPRESSED;
                    ResourceRecord {
                        offset: chunk_table.file_offset(),
                        size: stored_size,
                        original_size: stream.size,
                        flags,
                    }
                };
                entry.out_resource = Some(record);

                self.progress.completed_bytes += stream.size;
                self.progress.completed_streams += 1;
                self.sink.on_write_streams(self.progress);

                self.write_direct()?;
            }
        }
        Ok(())
    }

    /// Writes the queued no-compression streams; only called between
    /// parallel streams or after the last one, never in the middle of one.
    fn write_direct(&mut self) -> Result<()> {
        for hash in std::mem::take(&mut self.direct) {
            let entry = self
                .lookup
                .get_mut(&hash)
                .ok_or(WimError::UnknownStream(hash))?;
            let record = write_stream(entry, self.out, self.out_kind, false)?;
            entry.out_resource = Some(record);

            self.progress.completed_bytes += entry.size();
            self.progress.completed_streams += 1;
            self.sink.on_write_streams(self.progress);
        }
        Ok(())
    }

    /// Pulls back every dispatched message so no worker still holds one when
    /// the pool is torn down after an error.
    fn drain_in_flight(&mut self) {
        while self.in_flight_msgs > 0 {
            match self.done_rx.recv() {
                Ok(_) => self.in_flight_msgs -= 1,
                Err(_) => break,
            }
        }
    }
}

fn worker_lost() -> WimError {
    WimError::Compression("compressor thread exited unexpectedly".to_string())
}

pub(super) fn write_stream_list_parallel(
    lookup: &mut LookupTable,
    order: &[StreamHash],
    out: &mut File,
    out_kind: CompressionKind,
    recompress: bool,
    num_threads: usize,
    progress: &mut WriteProgress,
    sink: &mut dyn ProgressSink,
) -> Result<()> {
    let queue_size = num_threads * MESSAGES_PER_THREAD;
    let (work_tx, work_rx) = bounded::<Option<ChunkMessage>>(queue_size);
    let (done_tx, done_rx) = bounded::<ChunkMessage>(queue_size);

    let mut workers: Vec<JoinHandle<()>> = Vec::with_capacity(num_threads);
    for i in 0..num_threads {
        let work_rx = work_rx.clone();
        let done_tx = done_tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("wimx-compress-{i}"))
            .spawn(move || compressor_worker(work_rx, done_tx, out_kind));
        match spawned {
            Ok(handle) => workers.push(handle),
            Err(err) => {
                warn!("failed to start compressor thread {i}: {err}; falling back to serial compression");
                for _ in 0..workers.len() {
                    let _ = work_tx.send(None);
                }
                join_workers(workers);
                return write_stream_list_serial(
                    lookup, order, out, out_kind, recompress, progress, sink,
                );
            }
        }
    }
    // The coordinator must observe channel disconnection if every worker
    // dies, so it keeps no clone of the worker-side endpoints.
    drop(done_tx);
    drop(work_rx);

    progress.num_threads = num_threads;
    sink.on_write_streams(progress);

    let mut coordinator = Coordinator {
        lookup,
        order,
        out,
        out_kind,
        recompress,
        work_tx: &work_tx,
        done_rx: &done_rx,
        free: (0..queue_size).map(|_| ChunkMessage::new()).collect(),
        outstanding: VecDeque::new(),
        direct: Vec::new(),
        reading: None,
        next_index: 0,
        next_seq: 0,
        in_flight_msgs: 0,
        progress,
        sink,
    };
    let result = coordinator.run();
    if result.is_err() {
        coordinator.drain_in_flight();
    }
    drop(coordinator);

    for _ in 0..workers.len() {
        let _ = work_tx.send(None);
    }
    join_workers(workers);

    result
}

fn join_workers(workers: Vec<JoinHandle<()>>) {
    for handle in workers {
        if handle.join().is_err() {
            warn!("compressor thread panicked before shutdown");
        }
    }
}
