//! Bounded worker pool for serving reads.
//!
//! Reads block on decoding, so they run on tokio's blocking pool. A
//! semaphore sized by [`Parallelism`] caps how many are in progress at once.

use crate::error::FsError;
use crate::fs::ArchiveFs;
use crate::types::Parallelism;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::Semaphore;

/// One read to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub path: String,
    pub offset: u64,
    pub length: usize,
}

impl ReadRequest {
    pub fn new(path: impl Into<String>, offset: u64, length: usize) -> Self {
        Self {
            path: path.into(),
            offset,
            length,
        }
    }

    /// The whole file, given its size.
    pub fn whole(path: impl Into<String>, size: u64) -> Self {
        Self::new(path, 0, usize::try_from(size).unwrap_or(usize::MAX))
    }
}

/// Completed read.
#[derive(Debug)]
pub struct ReadResult {
    pub path: String,
    pub result: Result<Vec<u8>, FsError>,
}

/// Runs reads against a mounted archive on a fixed number of workers.
pub struct ReadPool {
    runtime: Runtime,
    workers: usize,
}

impl ReadPool {
    pub fn new(parallelism: Parallelism) -> Result<Self, FsError> {
        let workers = parallelism.workers();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .max_blocking_threads(workers)
            .thread_name("archivefs-read")
            .enable_all()
            .build()?;

        tracing::debug!(workers, "read pool started");
        Ok(Self { runtime, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Performs a single read on a worker.
    pub fn read(&self, fs: &Arc<ArchiveFs>, request: ReadRequest) -> Result<Vec<u8>, FsError> {
        let fs = Arc::clone(fs);
        self.runtime.block_on(async move {
            tokio::task::spawn_blocking(move || serve(&fs, &request))
                .await
                .unwrap_or_else(|err| Err(FsError::Engine(format!("read task failed: {}", err))))
        })
    }

    /// Performs every request concurrently, at most `workers` at a time.
    ///
    /// Results come back in request order; `on_complete` sees each one as it
    /// is collected.
    pub fn read_all<F>(
        &self,
        fs: &Arc<ArchiveFs>,
        requests: Vec<ReadRequest>,
        on_complete: F,
    ) -> Vec<ReadResult>
    where
        F: Fn(&ReadResult),
    {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        self.runtime.block_on(async {
            let tasks: Vec<_> = requests
                .into_iter()
                .map(|request| {
                    let fs = Arc::clone(fs);
                    let semaphore = Arc::clone(&semaphore);
                    let path = request.path.clone();
                    let task = tokio::spawn(async move {
                        let _permit = semaphore.acquire_owned().await;
                        tokio::task::spawn_blocking(move || serve(&fs, &request))
                            .await
                            .unwrap_or_else(|err| {
                                Err(FsError::Engine(format!("read task failed: {}", err)))
                            })
                    });
                    (path, task)
                })
                .collect();

            let mut results = Vec::with_capacity(tasks.len());
            for (path, task) in tasks {
                let result = task.await.unwrap_or_else(|err| {
                    Err(FsError::Engine(format!("read task failed: {}", err)))
                });
                let done = ReadResult { path, result };
                on_complete(&done);
                results.push(done);
            }
            results
        })
    }
}

fn serve(fs: &ArchiveFs, request: &ReadRequest) -> Result<Vec<u8>, FsError> {
    let handle = fs.open(&request.path)?;
    let result = fs.read(handle, request.offset, request.length);
    fs.close(handle)?;
    result
}
