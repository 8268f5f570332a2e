use std::fmt::Debug;
use std::fmt::Display;

use bytes::Bytes;

use crate::InfoHash;

/// One verified piece write. Batched by the engine and flushed once per
/// tick.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub info_hash: InfoHash,
    pub piece: u32,
    pub offset: u64,
    pub data: Bytes,
    pub expected_hash: [u8; 20],
}

#[derive(Debug, Clone, Copy)]
pub struct ReadRequest {
    pub info_hash: InfoHash,
    pub piece: u32,
    pub offset: u64,
    pub length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    Io,
    HashMismatch,
    MissingPiece,
}

impl Display for StorageErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageErrorKind::Io => write!(f, "io error"),
            StorageErrorKind::HashMismatch => write!(f, "hash mismatch"),
            StorageErrorKind::MissingPiece => write!(f, "missing piece"),
        }
    }
}

/// Completion events the storage implementation pushes back. Observed by
/// the engine on the tick after the operation finished.
#[derive(Debug)]
pub enum StorageFeedback {
    Written {
        info_hash: InfoHash,
        piece: u32,
    },
    WriteFailed {
        info_hash: InfoHash,
        piece: u32,
        kind: StorageErrorKind,
    },
    Data {
        info_hash: InfoHash,
        piece: u32,
        bytes: Bytes,
    },
    ReadFailed {
        info_hash: InfoHash,
        piece: u32,
        kind: StorageErrorKind,
    },
}

/// Content storage consumed by the engine. All calls are asynchronous:
/// implementations enqueue the work and later push a [`StorageFeedback`]
/// into the channel the engine was constructed with.
pub trait ContentStorage: Send + Debug {
    fn write_batch(&mut self, batch: Vec<WriteRequest>);
    fn read(&mut self, request: ReadRequest);
}

pub fn verify_sha1(hash: [u8; 20], input: &Bytes) -> bool {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(input);
    let result: [u8; 20] = hasher.finalize().into();
    hash == result
}

#[derive(Debug, Clone)]
pub struct HashJob {
    pub info_hash: InfoHash,
    pub piece: u32,
    pub expected: [u8; 20],
    pub data: Bytes,
}

impl HashJob {
    fn verify(&self, worker_idx: usize) -> bool {
        let start = std::time::Instant::now();
        let verified = verify_sha1(self.expected, &self.data);
        if verified {
            tracing::trace!(piece = self.piece, took = ?start.elapsed(), "Worker {worker_idx} verified hash");
        } else {
            tracing::warn!(piece = self.piece, took = ?start.elapsed(), "Worker {worker_idx} failed to verify hash");
        }
        verified
    }
}

#[derive(Debug)]
pub struct HashResult {
    pub info_hash: InfoHash,
    pub piece: u32,
    pub is_verified: bool,
    pub data: Bytes,
    worker_idx: usize,
}

#[derive(Debug)]
struct HashWorker {
    sender: flume::Sender<HashJob>,
    load: usize,
}

impl HashWorker {
    fn new(idx: usize, result_tx: flume::Sender<HashResult>) -> Self {
        let (tx, rx) = flume::unbounded::<HashJob>();
        std::thread::spawn(move || {
            while let Ok(job) = rx.recv() {
                let is_verified = job.verify(idx);
                let result = HashResult {
                    info_hash: job.info_hash,
                    piece: job.piece,
                    is_verified,
                    data: job.data,
                    worker_idx: idx,
                };
                if result_tx.send(result).is_err() {
                    break;
                }
            }
        });
        Self { sender: tx, load: 0 }
    }
}

/// Piece hash verification worker pool, drained with `try_recv` from the
/// engine tick. With zero workers jobs are hashed inline on the calling
/// thread, which keeps tests and tiny hosts deterministic.
#[derive(Debug)]
pub struct Hasher {
    workers: Vec<HashWorker>,
    result_tx: flume::Sender<HashResult>,
    result_rx: flume::Receiver<HashResult>,
}

impl Hasher {
    pub fn new(workers_amount: usize) -> Self {
        let (result_tx, result_rx) = flume::unbounded();
        if workers_amount > 0 {
            tracing::info!("Spawning {} hasher workers", workers_amount);
        }
        let workers = (0..workers_amount)
            .map(|i| HashWorker::new(i, result_tx.clone()))
            .collect();
        Self {
            workers,
            result_tx,
            result_rx,
        }
    }

    /// Pool sized from the machine's physical cores.
    pub fn auto() -> Self {
        let s = sysinfo::System::new();
        let workers = s.physical_core_count().map_or(2, |cores| cores / 2).max(1);
        Self::new(workers)
    }

    pub fn pend_job(&mut self, job: HashJob) {
        let Some(worker) = self.workers.iter_mut().min_by_key(|w| w.load) else {
            // inline mode
            let is_verified = job.verify(0);
            let _ = self.result_tx.send(HashResult {
                info_hash: job.info_hash,
                piece: job.piece,
                is_verified,
                data: job.data,
                worker_idx: 0,
            });
            return;
        };
        worker.load += 1;
        worker.sender.send(job).expect("worker is alive");
    }

    pub fn try_recv(&mut self) -> Option<HashResult> {
        let result = self.result_rx.try_recv().ok()?;
        if let Some(worker) = self.workers.get_mut(result.worker_idx) {
            worker.load -= 1;
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use sha1::{Digest, Sha1};

    use super::{HashJob, Hasher};

    fn sha1_of(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    #[test]
    fn inline_hasher_verifies_synchronously() {
        let mut hasher = Hasher::new(0);
        let data = Bytes::from_static(b"piece payload");
        hasher.pend_job(HashJob {
            info_hash: [0; 20],
            piece: 7,
            expected: sha1_of(&data),
            data: data.clone(),
        });
        hasher.pend_job(HashJob {
            info_hash: [0; 20],
            piece: 8,
            expected: [0; 20],
            data,
        });
        let first = hasher.try_recv().unwrap();
        assert!(first.is_verified);
        assert_eq!(first.piece, 7);
        let second = hasher.try_recv().unwrap();
        assert!(!second.is_verified);
        assert_eq!(second.piece, 8);
        assert!(hasher.try_recv().is_none());
    }

    #[test]
    fn worker_pool_round_trips_jobs() {
        let mut hasher = Hasher::new(2);
        let data = Bytes::from_static(b"worker payload");
        hasher.pend_job(HashJob {
            info_hash: [1; 20],
            piece: 0,
            expected: sha1_of(&data),
            data,
        });
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        let result = loop {
            if let Some(result) = hasher.try_recv() {
                break result;
            }
            assert!(std::time::Instant::now() < deadline, "hash result never arrived");
            std::thread::yield_now();
        };
        assert!(result.is_verified);
        assert_eq!(result.info_hash, [1; 20]);
    }
}
