//! Parallel compression of sealed blocks.
//!
//! Jobs travel over a bounded channel to named worker threads; outcomes come
//! back over an unbounded one so a worker never blocks on the builder. When
//! any job fails the shared abort flag is raised and the remaining queued
//! jobs are answered with `Cancelled` without being compressed. Dropping the
//! pool raises the flag too, closes the queue and joins the workers.

use crate::category::Category;
use crossbeam_channel::{Receiver, Sender};
use dfs_compress::Algorithm;
use dfs_error::{DfsError, Result};
use dfs_ondisk::encode_frame;
use dfs_types::BlockId;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use tracing::trace;

const JOBS_PER_WORKER: usize = 4;

#[derive(Debug)]
pub(crate) struct CompressJob {
    pub id: BlockId,
    pub category: Category,
    pub payload: Arc<[u8]>,
    pub algorithm: Algorithm,
    pub level: i32,
}

/// A block ready to be written to the block section.
#[derive(Debug)]
pub(crate) struct CompressedBlock {
    pub id: BlockId,
    pub category: Category,
    /// Algorithm recorded in the frame; `Store` when compressing did not
    /// shrink the payload.
    pub algorithm: Algorithm,
    pub uncompressed_size: u32,
    pub frame: Vec<u8>,
}

pub(crate) fn compress_job(job: &CompressJob) -> Result<CompressedBlock> {
    let compressed = dfs_compress::compress(&job.payload, job.algorithm, job.level)
        .map_err(|e| e.into_block_error(job.id))?;
    let (algorithm, body): (Algorithm, &[u8]) = if compressed.len() < job.payload.len() {
        (job.algorithm, &compressed[..])
    } else {
        (Algorithm::Store, &job.payload[..])
    };
    let frame = encode_frame(algorithm.id(), &job.payload, body)
        .map_err(|e| DfsError::Format(format!("block {}: {e}", job.id)))?;
    trace!(
        target: "dfs::builder",
        block = job.id.0,
        algorithm = %algorithm,
        uncompressed = job.payload.len(),
        frame = frame.len(),
        "block_compressed"
    );
    Ok(CompressedBlock {
        id: job.id,
        category: job.category,
        algorithm,
        uncompressed_size: u32::try_from(job.payload.len())
            .map_err(|_| DfsError::Format(format!("block {} exceeds u32", job.id)))?,
        frame,
    })
}

#[derive(Debug)]
pub(crate) struct CompressionPool {
    /// `None` compresses inline on submit.
    jobs: Option<Sender<CompressJob>>,
    results: Receiver<Result<CompressedBlock>>,
    workers: Vec<JoinHandle<()>>,
    abort: Arc<AtomicBool>,
    submitted: usize,
    done: Vec<CompressedBlock>,
    failure: Option<DfsError>,
}

impl CompressionPool {
    pub(crate) fn new(workers: usize) -> Result<Self> {
        let abort = Arc::new(AtomicBool::new(false));
        let (result_tx, results) = crossbeam_channel::unbounded();
        if workers == 0 {
            return Ok(Self {
                jobs: None,
                results,
                workers: Vec::new(),
                abort,
                submitted: 0,
                done: Vec::new(),
                failure: None,
            });
        }

        let (tx, rx) = crossbeam_channel::bounded::<CompressJob>(workers * JOBS_PER_WORKER);
        let mut pool = Self {
            jobs: Some(tx),
            results,
            workers: Vec::with_capacity(workers),
            abort: Arc::clone(&abort),
            submitted: 0,
            done: Vec::new(),
            failure: None,
        };
        for n in 0..workers {
            let rx: Receiver<CompressJob> = rx.clone();
            let result_tx: Sender<Result<CompressedBlock>> = result_tx.clone();
            let abort = Arc::clone(&abort);
            // On spawn failure the partially built pool is dropped, which
            // stops the workers already running.
            let handle = std::thread::Builder::new()
                .name(format!("dfs-compress-{n}"))
                .spawn(move || {
                    for job in &rx {
                        let outcome = if abort.load(Ordering::Acquire) {
                            Err(DfsError::Cancelled)
                        } else {
                            compress_job(&job)
                        };
                        if outcome.is_err() {
                            abort.store(true, Ordering::Release);
                        }
                        if result_tx.send(outcome).is_err() {
                            break;
                        }
                    }
                })?;
            pool.workers.push(handle);
        }
        Ok(pool)
    }

    /// Queue a sealed block. Fails fast with the first error any worker
    /// has reported so far.
    pub(crate) fn submit(&mut self, job: CompressJob) -> Result<()> {
        self.collect_ready();
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        match &self.jobs {
            None => {
                let block = compress_job(&job)?;
                self.done.push(block);
            }
            Some(jobs) => {
                jobs.send(job).map_err(|_| DfsError::Cancelled)?;
                self.submitted += 1;
            }
        }
        Ok(())
    }

    fn collect_ready(&mut self) {
        while let Ok(outcome) = self.results.try_recv() {
            self.record(outcome);
        }
    }

    fn record(&mut self, outcome: Result<CompressedBlock>) {
        self.submitted = self.submitted.saturating_sub(1);
        match outcome {
            Ok(block) => self.done.push(block),
            // Keep the root cause rather than a follow-on cancellation.
            Err(err) => match &self.failure {
                None | Some(DfsError::Cancelled) => self.failure = Some(err),
                Some(_) => {}
            },
        }
    }

    /// Wait for every queued block and return all compressed blocks in
    /// completion order.
    pub(crate) fn finish(mut self) -> Result<Vec<CompressedBlock>> {
        self.jobs = None;
        while self.submitted > 0 {
            match self.results.recv() {
                Ok(outcome) => self.record(outcome),
                Err(_) => {
                    self.failure.get_or_insert(DfsError::Cancelled);
                    break;
                }
            }
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                self.failure.get_or_insert_with(|| {
                    DfsError::Io(std::io::Error::other("compression worker panicked"))
                });
            }
        }
        match self.failure.take() {
            Some(err) => Err(err),
            None => Ok(std::mem::take(&mut self.done)),
        }
    }
}

impl Drop for CompressionPool {
    fn drop(&mut self) {
        self.abort.store(true, Ordering::Release);
        self.jobs = None;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfs_ondisk::split_frame;

    fn job(id: u32, payload: &[u8], algorithm: Algorithm) -> CompressJob {
        CompressJob {
            id: BlockId(id),
            category: Category::Binary,
            payload: Arc::from(payload),
            algorithm,
            level: algorithm.default_level(),
        }
    }

    #[test]
    fn compressible_block_keeps_its_algorithm() {
        let data = b"abcabcabc".repeat(200);
        let block = compress_job(&job(3, &data, Algorithm::Zstd)).expect("compress");
        assert_eq!(block.algorithm, Algorithm::Zstd);
        let (header, payload) = split_frame(&block.frame).expect("frame");
        assert_eq!(header.algorithm_id, Algorithm::Zstd.id());
        assert_eq!(header.uncompressed_size as usize, data.len());
        assert!(payload.len() < data.len());
        assert_eq!(header.checksum, crc32c::crc32c(&data));
    }

    #[test]
    fn non_shrinking_block_is_stored() {
        let block = compress_job(&job(0, b"xy", Algorithm::Brotli)).expect("compress");
        assert_eq!(block.algorithm, Algorithm::Store);
        let (_, payload) = split_frame(&block.frame).expect("frame");
        assert_eq!(payload, b"xy");
    }

    #[test]
    fn workers_compress_every_submitted_block() {
        let mut pool = CompressionPool::new(3).expect("pool");
        for id in 0..20_u32 {
            let data = vec![u8::try_from(id).expect("small"); 4096];
            pool.submit(job(id, &data, Algorithm::Lz4)).expect("submit");
        }
        let mut blocks = pool.finish().expect("finish");
        blocks.sort_by_key(|b| b.id);
        let ids: Vec<u32> = blocks.iter().map(|b| b.id.0).collect();
        assert_eq!(ids, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn inline_pool_compresses_on_submit() {
        let mut pool = CompressionPool::new(0).expect("pool");
        pool.submit(job(0, &[1_u8; 1000], Algorithm::Zlib))
            .expect("submit");
        let blocks = pool.finish().expect("finish");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].algorithm, Algorithm::Zlib);
    }

    #[test]
    fn dropping_a_busy_pool_joins_its_workers() {
        let mut pool = CompressionPool::new(2).expect("pool");
        for id in 0..8_u32 {
            pool.submit(job(id, &[0_u8; 8192], Algorithm::Zstd))
                .expect("submit");
        }
        drop(pool);
    }
}
