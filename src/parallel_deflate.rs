// Copyright 2026 The prismvnc Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Worker-parallel deflate with ordered output.
//!
//! Produces the byte stream a single zlib deflate session with
//! `Z_SYNC_FLUSH` would produce, but compresses 128 KiB input blocks
//! concurrently on a small worker pool. Each block runs through its own raw
//! deflate session; sync-flushed raw-deflate segments concatenate into one
//! valid stream because no block ever sets the final bit. The two-byte zlib
//! header `0x78 0x01` is emitted exactly once, in front of the first chunk.
//!
//! Ordering: every block carries a sequence number; workers drop finished
//! chunks into a mutex-protected list and the consolidator appends them in
//! sequence order. [`ParallelDeflate::sync`] enqueues a sentinel end-marker
//! chunk and blocks on a condvar until everything up to and including the
//! sentinel has been consolidated.
//!
//! Limitation: the 32 KiB sliding window is not maintained across blocks, so
//! the ratio is slightly worse than single-threaded deflate. For the ZRLE use
//! case, where tiles are independent at flush boundaries anyway, this costs
//! little.

use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use flate2::{Compress, Compression, FlushCompress};

const INPUT_BLOCK_SIZE: usize = 128 * 1024;
const N_WORKERS: usize = 4;

struct Chunk {
    seq: u32,
    /// `None` marks the sync sentinel.
    data: Option<Vec<u8>>,
}

#[derive(Default)]
struct ChunkList {
    chunks: Vec<Chunk>,
}

struct Shared {
    list: Mutex<ChunkList>,
    cond: Condvar,
}

struct Job {
    seq: u32,
    input: Vec<u8>,
    level: Compression,
    shared: Arc<Shared>,
}

/// Ordered concurrent zlib-compatible compressor.
pub struct ParallelDeflate {
    level: Compression,
    seq: u32,
    start_seq: u32,
    is_at_start: bool,
    input: Vec<u8>,
    shared: Arc<Shared>,
    job_tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

fn deflate_block(level: Compression, input: &[u8]) -> Vec<u8> {
    let mut z = Compress::new(level, false);
    let mut out = Vec::with_capacity(input.len() / 2 + 64);
    let mut buf = vec![0u8; 32 * 1024];
    let mut pos = 0usize;

    loop {
        let before_out = z.total_out();
        if let Err(e) = z.compress(&input[pos..], &mut buf, FlushCompress::Sync) {
            log::error!("deflate failed: {e}");
            break;
        }
        let produced = (z.total_out() - before_out) as usize;
        out.extend_from_slice(&buf[..produced]);
        pos = z.total_in() as usize;

        if pos == input.len() && produced < buf.len() {
            break;
        }
    }

    out
}

fn insert_chunk(shared: &Shared, chunk: Chunk) {
    let mut list = shared.list.lock().unwrap();
    let pos = list
        .chunks
        .iter()
        .position(|c| c.seq > chunk.seq)
        .unwrap_or(list.chunks.len());
    list.chunks.insert(pos, chunk);
    shared.cond.notify_all();
}

fn worker_main(rx: Arc<Mutex<std::sync::mpsc::Receiver<Job>>>) {
    loop {
        let job = match rx.lock().unwrap().recv() {
            Ok(job) => job,
            Err(_) => return,
        };
        let data = deflate_block(job.level, &job.input);
        insert_chunk(&job.shared, Chunk { seq: job.seq, data: Some(data) });
    }
}

impl ParallelDeflate {
    /// Creates a compressor producing output equivalent to zlib level
    /// `level` with sync flushes.
    #[must_use]
    pub fn new(level: u32) -> Self {
        let shared = Arc::new(Shared {
            list: Mutex::new(ChunkList::default()),
            cond: Condvar::new(),
        });

        let (job_tx, job_rx) = channel::<Job>();
        let job_rx = Arc::new(Mutex::new(job_rx));

        let workers = (0..N_WORKERS)
            .map(|_| {
                let rx = job_rx.clone();
                std::thread::spawn(move || worker_main(rx))
            })
            .collect();

        Self {
            level: Compression::new(level),
            seq: 0,
            start_seq: 0,
            is_at_start: true,
            input: Vec::with_capacity(INPUT_BLOCK_SIZE * 2),
            shared,
            job_tx: Some(job_tx),
            workers,
        }
    }

    fn schedule_job(&mut self, input: Vec<u8>) {
        let job = Job {
            seq: self.seq,
            input,
            level: self.level,
            shared: self.shared.clone(),
        };
        self.seq += 1;
        if let Some(tx) = &self.job_tx {
            // The receiver lives as long as the workers do.
            let _ = tx.send(job);
        }
    }

    /// Appends input data, handing full 128 KiB blocks to the workers.
    pub fn feed(&mut self, data: &[u8]) {
        self.input.extend_from_slice(data);

        while self.input.len() >= INPUT_BLOCK_SIZE {
            let rest = self.input.split_off(INPUT_BLOCK_SIZE);
            let block = std::mem::replace(&mut self.input, rest);
            self.schedule_job(block);
        }
    }

    /// Appends chunks in sequence order; returns true once the sentinel has
    /// been consumed.
    fn consolidate(&mut self, sink: &mut Option<&mut Vec<u8>>) -> bool {
        let mut list = self.shared.list.lock().unwrap();
        let mut have_end = false;

        while let Some(first) = list.chunks.first() {
            if first.seq != self.start_seq {
                break;
            }
            self.start_seq += 1;
            let chunk = list.chunks.remove(0);

            if self.is_at_start {
                if let Some(out) = sink.as_mut() {
                    out.extend_from_slice(&[0x78, 0x01]);
                }
                self.is_at_start = false;
            }

            match chunk.data {
                Some(data) => {
                    if let Some(out) = sink.as_mut() {
                        out.extend_from_slice(&data);
                    }
                }
                None => have_end = true,
            }
        }

        have_end
    }

    fn flush(&mut self, mut out: Option<&mut Vec<u8>>) {
        insert_chunk(&self.shared, Chunk { seq: self.seq, data: None });
        self.seq += 1;

        loop {
            if self.consolidate(&mut out) {
                return;
            }
            // Wait for workers to land more chunks.
            let list = self.shared.list.lock().unwrap();
            let front_ready = list.chunks.first().is_some_and(|c| c.seq == self.start_seq);
            if !front_ready {
                drop(self.shared.cond.wait(list).unwrap());
            }
        }
    }

    /// Compresses any residual input tail and blocks until all output up to
    /// this point has been appended, in order, to `out`.
    pub fn sync(&mut self, out: &mut Vec<u8>) {
        if !self.input.is_empty() {
            debug_assert!(self.input.len() < INPUT_BLOCK_SIZE);
            let tail = std::mem::take(&mut self.input);
            self.schedule_job(tail);
        }
        self.flush(Some(out));
    }
}

impl Drop for ParallelDeflate {
    fn drop(&mut self) {
        self.flush(None);
        self.job_tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Decompress, FlushDecompress};

    fn inflate(compressed: &[u8], expected_len: usize) -> Vec<u8> {
        let mut z = Decompress::new(true);
        let mut out = vec![0u8; expected_len + 64];
        let mut total = 0usize;
        let mut pos = 0usize;

        while pos < compressed.len() {
            let before_in = z.total_in();
            let before_out = z.total_out();
            z.decompress(
                &compressed[pos..],
                &mut out[total..],
                FlushDecompress::Sync,
            )
            .unwrap();
            pos += (z.total_in() - before_in) as usize;
            total += (z.total_out() - before_out) as usize;
            if z.total_in() == before_in && z.total_out() == before_out {
                break;
            }
        }

        out.truncate(total);
        out
    }

    #[test]
    fn output_starts_with_zlib_header() {
        let mut pd = ParallelDeflate::new(1);
        pd.feed(b"hello world");
        let mut out = Vec::new();
        pd.sync(&mut out);
        assert_eq!(&out[..2], &[0x78, 0x01]);
    }

    #[test]
    fn inflate_reproduces_small_input() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(10);
        let mut pd = ParallelDeflate::new(1);
        pd.feed(&data);
        let mut out = Vec::new();
        pd.sync(&mut out);
        assert_eq!(inflate(&out, data.len()), data);
    }

    #[test]
    fn inflate_reproduces_multi_block_input() {
        // 3 MB spanning many 128 KiB blocks, patterned so every block differs.
        let mut data = Vec::with_capacity(3 << 20);
        for i in 0..(3 << 20) {
            data.push(((i * 31) ^ (i >> 9)) as u8);
        }
        let mut pd = ParallelDeflate::new(1);
        pd.feed(&data);
        let mut out = Vec::new();
        pd.sync(&mut out);
        assert_eq!(&out[..2], &[0x78, 0x01]);
        assert_eq!(inflate(&out, data.len()), data);
    }

    #[test]
    fn multiple_syncs_share_one_header() {
        let mut pd = ParallelDeflate::new(1);
        let mut out = Vec::new();
        pd.feed(b"first");
        pd.sync(&mut out);
        let first_len = out.len();
        pd.feed(b"second");
        pd.sync(&mut out);

        assert_eq!(&out[..2], &[0x78, 0x01]);
        // Only one header in the whole stream.
        assert_ne!(&out[first_len..first_len + 2], &[0x78, 0x01]);
        assert_eq!(inflate(&out, 16), b"firstsecond");
    }

    #[test]
    fn empty_sync_emits_header_only_stream() {
        let mut pd = ParallelDeflate::new(1);
        let mut out = Vec::new();
        pd.sync(&mut out);
        assert_eq!(&out[..2], &[0x78, 0x01]);
    }

    #[test]
    fn interleaved_feed_and_sync_keeps_order() {
        let mut data = Vec::new();
        let mut pd = ParallelDeflate::new(1);
        let mut out = Vec::new();
        for round in 0..8u32 {
            let block = vec![round as u8; 200_000];
            data.extend_from_slice(&block);
            pd.feed(&block);
            pd.sync(&mut out);
        }
        assert_eq!(inflate(&out, data.len()), data);
    }
}
