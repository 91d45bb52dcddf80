/// Background payload fetching
///
/// A fixed set of named worker threads pulls `FetchJob`s from a channel,
/// reads the payload and sends a `FetchCompletion` back. Workers never touch
/// the octree; the render thread promotes completions in `poll_completions`.
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::error::{OctreeError, OctreeResult};
use crate::octree::NodeId;
use crate::persistence::read_payload_file;

/// Shared view of one outstanding fetch
#[derive(Debug, Clone)]
pub struct FetchHandle {
    node: NodeId,
    cancel: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

impl FetchHandle {
    pub(crate) fn new(node: NodeId) -> Self {
        Self {
            node,
            cancel: Arc::new(AtomicBool::new(false)),
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Ask the worker to skip the read; the completion is then discarded
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub(crate) fn resume(&self) {
        self.cancel.store(false, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// The worker has produced a completion (which may not be polled yet)
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub(crate) fn same_fetch(&self, other: &FetchHandle) -> bool {
        Arc::ptr_eq(&self.cancel, &other.cancel)
    }
}

/// Where a worker gets a payload from
#[derive(Debug, Clone)]
pub enum FetchSource {
    /// A per-node payload file
    File(PathBuf),
    /// Already in memory; the worker only hands it back
    Memory(Arc<[f32]>),
}

#[derive(Debug)]
pub struct FetchJob {
    pub handle: FetchHandle,
    pub source: FetchSource,
    pub values_per_star: usize,
    pub expected_records: u32,
}

#[derive(Debug)]
pub enum FetchOutcome {
    Loaded(Arc<[f32]>),
    Cancelled,
    Failed(OctreeError),
}

#[derive(Debug)]
pub struct FetchCompletion {
    pub handle: FetchHandle,
    pub outcome: FetchOutcome,
}

/// Pool of named I/O worker threads
pub struct FetchPool {
    workers: Vec<JoinHandle<()>>,
    jobs: Option<Sender<FetchJob>>,
    completions: Receiver<FetchCompletion>,
}

impl FetchPool {
    pub fn new(threads: usize) -> OctreeResult<Self> {
        let (job_sender, job_receiver) = unbounded::<FetchJob>();
        let (completion_sender, completion_receiver) = unbounded::<FetchCompletion>();

        let mut pool = Self {
            workers: Vec::with_capacity(threads),
            jobs: Some(job_sender),
            completions: completion_receiver,
        };

        for index in 0..threads.max(1) {
            let jobs = job_receiver.clone();
            let completions = completion_sender.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("octree-fetch-{}", index))
                .spawn(move || worker_loop(jobs, completions));
            match spawned {
                Ok(handle) => pool.workers.push(handle),
                Err(err) => {
                    log::error!("[FetchPool::new] Failed to start octree-fetch-{}: {}", index, err);
                    // Dropping the pool joins the workers already started.
                    return Err(OctreeError::WorkerSpawn(err));
                }
            }
        }

        log::info!("[FetchPool::new] Started {} fetch workers", pool.workers.len());
        Ok(pool)
    }

    /// Queue a job; false once the pool is shutting down
    pub fn submit(&self, job: FetchJob) -> bool {
        match &self.jobs {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        }
    }

    /// Completions available right now
    pub fn drain(&self) -> Vec<FetchCompletion> {
        self.completions.try_iter().collect()
    }

    /// Block for the next completion, up to `timeout`
    pub fn recv_timeout(&self, timeout: Duration) -> Option<FetchCompletion> {
        match self.completions.recv_timeout(timeout) {
            Ok(completion) => Some(completion),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for FetchPool {
    fn drop(&mut self) {
        // Closing the job channel ends every worker loop.
        self.jobs.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for FetchPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchPool")
            .field("workers", &self.workers.len())
            .finish()
    }
}

fn worker_loop(jobs: Receiver<FetchJob>, completions: Sender<FetchCompletion>) {
    while let Ok(job) = jobs.recv() {
        let outcome = if job.handle.is_cancelled() {
            FetchOutcome::Cancelled
        } else {
            run_job(&job)
        };
        job.handle.finished.store(true, Ordering::Release);
        if completions
            .send(FetchCompletion {
                handle: job.handle,
                outcome,
            })
            .is_err()
        {
            break;
        }
    }
}

fn run_job(job: &FetchJob) -> FetchOutcome {
    match &job.source {
        FetchSource::Memory(data) => FetchOutcome::Loaded(Arc::clone(data)),
        FetchSource::File(path) => {
            match read_payload_file(path, job.values_per_star, job.expected_records) {
                Ok(values) => FetchOutcome::Loaded(Arc::from(values)),
                Err(err) => FetchOutcome::Failed(err),
            }
        }
    }
}
