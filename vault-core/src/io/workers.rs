//! Background workers for compression and I/O completion
//!
//! A fixed number of tokio tasks drain each of two queues. Shutdown is
//! cooperative: every worker finishes the items queued before its
//! `Shutdown` message and then exits.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::batch::IoRequest;
use super::compress::{compress_block, BlockCodec};
use crate::blockdev::BLOCK_SIZE;
use crate::config::IoConfig;
use crate::error::{Error, Result};

/// Counters kept by the worker pool
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IoStats {
    /// Batches submitted
    pub batches: u64,
    /// Device requests issued
    pub runs: u64,
    /// Pages transferred successfully
    pub pages: u64,
    /// Device requests that failed
    pub errors: u64,
    /// Blocks handed to a codec
    pub compressed: u64,
}

/// Result of one device request of a batch
pub(crate) struct RunCompletion {
    pub request: Arc<IoRequest>,
    pub slots: Vec<usize>,
    pub result: std::result::Result<Option<Vec<u8>>, String>,
}

impl RunCompletion {
    fn finish(self, stats: &Mutex<IoStats>) {
        {
            let mut stats = stats.lock();
            match &self.result {
                Ok(_) => stats.pages += self.slots.len() as u64,
                Err(_) => stats.errors += 1,
            }
        }
        self.request.complete_run(&self.slots, self.result);
    }
}

/// Compression queue messages
pub(crate) enum CompressionTask {
    Compress {
        codec: Arc<dyn BlockCodec>,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<Option<Vec<u8>>>>,
    },
    Shutdown,
}

/// Completion queue messages
pub(crate) enum CompletionTask {
    Complete(RunCompletion),
    Shutdown,
}

/// Fixed pool of background tasks shared by every partition of an engine
pub struct WorkerPool {
    config: IoConfig,
    compress_tx: mpsc::UnboundedSender<CompressionTask>,
    complete_tx: mpsc::UnboundedSender<CompletionTask>,
    complete_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<CompletionTask>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<Mutex<IoStats>>,
    /// Set once shutdown starts; held shared while posting completions
    shut: RwLock<bool>,
}

impl WorkerPool {
    /// Spawn the workers on the current tokio runtime
    pub fn start(config: &IoConfig) -> Arc<Self> {
        let (compress_tx, compress_rx) = mpsc::unbounded_channel();
        let (complete_tx, complete_rx) = mpsc::unbounded_channel();
        let compress_rx = Arc::new(tokio::sync::Mutex::new(compress_rx));
        let complete_rx = Arc::new(tokio::sync::Mutex::new(complete_rx));
        let stats = Arc::new(Mutex::new(IoStats::default()));

        let mut handles = Vec::with_capacity(config.worker_threads * 2);
        for worker in 0..config.worker_threads {
            let rx = compress_rx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let task = rx.lock().await.recv().await;
                    match task {
                        Some(CompressionTask::Compress { codec, data, reply }) => {
                            let result = tokio::task::spawn_blocking(move || {
                                compress_block(codec.as_ref(), &data)
                            })
                            .await
                            .unwrap_or_else(|e| Err(Error::Compression(e.to_string())));
                            // the requester may have given up
                            let _ = reply.send(result);
                        }
                        Some(CompressionTask::Shutdown) | None => {
                            log::debug!("WORKER_POOL: compression worker {} exiting", worker);
                            break;
                        }
                    }
                }
            }));

            let rx = complete_rx.clone();
            let stats = stats.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let task = rx.lock().await.recv().await;
                    match task {
                        Some(CompletionTask::Complete(done)) => done.finish(&stats),
                        Some(CompletionTask::Shutdown) | None => {
                            log::debug!("WORKER_POOL: completion worker {} exiting", worker);
                            break;
                        }
                    }
                }
            }));
        }

        log::info!(
            "WORKER_POOL: started {} compression and {} completion workers",
            config.worker_threads,
            config.worker_threads
        );

        Arc::new(Self {
            config: config.clone(),
            compress_tx,
            complete_tx,
            complete_rx,
            handles: Mutex::new(handles),
            stats,
            shut: RwLock::new(false),
        })
    }

    pub fn config(&self) -> &IoConfig {
        &self.config
    }

    pub fn stats(&self) -> IoStats {
        self.stats.lock().clone()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shut.read()
    }

    pub(crate) fn note_batch(&self, runs: usize) {
        let mut stats = self.stats.lock();
        stats.batches += 1;
        stats.runs += runs as u64;
    }

    /// Hand a run completion to the completion queue, or finish it inline
    /// once the workers are gone
    pub(crate) fn post_completion(&self, done: RunCompletion) {
        let shut = self.shut.read();
        if *shut {
            drop(shut);
            done.finish(&self.stats);
            return;
        }
        if let Err(mpsc::error::SendError(CompletionTask::Complete(done))) =
            self.complete_tx.send(CompletionTask::Complete(done))
        {
            drop(shut);
            done.finish(&self.stats);
        }
    }

    /// Compress one block on a compression worker.
    ///
    /// Returns the framed payload, or `None` when compression does not
    /// shrink the block.
    pub async fn compress(&self, codec: Arc<dyn BlockCodec>, data: Vec<u8>) -> Result<Option<Vec<u8>>> {
        self.stats.lock().compressed += 1;
        if self.is_shut_down() {
            return Err(Error::Shutdown);
        }
        let (reply, rx) = oneshot::channel();
        self.compress_tx
            .send(CompressionTask::Compress { codec, data, reply })
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Stop every worker after the work already queued
    pub async fn shutdown(&self) {
        {
            let mut shut = self.shut.write();
            if *shut {
                return;
            }
            *shut = true;
        }
        for _ in 0..self.config.worker_threads {
            let _ = self.compress_tx.send(CompressionTask::Shutdown);
            let _ = self.complete_tx.send(CompletionTask::Shutdown);
        }
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                log::warn!("WORKER_POOL: worker ended abnormally: {}", e);
            }
        }
        // completions queued behind the shutdown messages
        let mut rx = self.complete_rx.lock().await;
        while let Ok(task) = rx.try_recv() {
            if let CompletionTask::Complete(done) = task {
                done.finish(&self.stats);
            }
        }
        log::info!("WORKER_POOL: shut down");
    }

    /// Largest run the batcher builds, in pages
    pub fn max_run_pages(&self) -> usize {
        std::cmp::min(self.config.max_run_pages, self.config.max_run_bytes / BLOCK_SIZE).max(1)
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.config.worker_threads)
            .field("shut", &self.is_shut_down())
            .finish()
    }
}
