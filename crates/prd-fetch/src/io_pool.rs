//! Worker pool for file I/O and hashing.
//!
//! The transfer engine never writes to disk itself: every write, hash update
//! and commit is packaged as a work closure and queued to one of a fixed set
//! of worker threads. A [`Handle`] pins all work submitted through it to one
//! worker, so the writes of a single transfer execute in FIFO order without
//! any locking ("strand" semantics). Work queues are bounded, which gives
//! natural backpressure: a transfer that outruns the disk blocks in
//! `submit` instead of buffering without limit.
//!
//! Work closures may hand back a result closure; those run on the
//! orchestrating task in [`IoPool::pull_results`] / [`IoPool::finish`], which
//! is how worker-side failures travel back without any cross-thread error
//! state.

use std::sync::mpsc as std_mpsc;
use std::sync::Mutex;
use std::thread;

use rand::Rng;
use tokio::sync::mpsc;

/// Runs on the orchestrating task after the work unit completed.
pub type ResultFn = Box<dyn FnOnce() + Send + 'static>;
/// Runs on a worker thread; may return a result closure.
pub type WorkFn = Box<dyn FnOnce() -> Option<ResultFn> + Send + 'static>;

enum WorkMsg {
    Work(WorkFn),
    Close,
}

enum ResultMsg {
    Done(ResultFn),
    Closed,
}

/// Affinity token binding work to one worker. Cheap to copy, safe to reuse
/// for the lifetime of the pool that issued it.
#[derive(Debug, Clone, Copy)]
pub struct Handle {
    worker: usize,
}

pub struct IoPool {
    senders: Vec<mpsc::Sender<WorkMsg>>,
    receivers: Mutex<Vec<std_mpsc::Receiver<ResultMsg>>>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl IoPool {
    /// Spawn `pool_size` workers, each with a bounded queue of
    /// `queue_slots` work units.
    pub fn new(pool_size: usize, queue_slots: usize) -> IoPool {
        assert!(pool_size > 0);
        assert!(queue_slots > 0);
        let mut senders = Vec::with_capacity(pool_size);
        let mut receivers = Vec::with_capacity(pool_size);
        let mut threads = Vec::with_capacity(pool_size);
        for id in 0..pool_size {
            let (work_tx, work_rx) = mpsc::channel::<WorkMsg>(queue_slots);
            let (res_tx, res_rx) = std_mpsc::channel::<ResultMsg>();
            senders.push(work_tx);
            receivers.push(res_rx);
            threads.push(
                thread::Builder::new()
                    .name(format!("prd-io-{id}"))
                    .spawn(move || worker(work_rx, res_tx))
                    .expect("spawning io worker"),
            );
        }
        IoPool {
            senders,
            receivers: Mutex::new(receivers),
            threads,
        }
    }

    /// Pick a worker for a new transfer.
    pub fn handle(&self) -> Handle {
        Handle {
            worker: rand::thread_rng().gen_range(0..self.senders.len()),
        }
    }

    /// Queue work on the handle's worker. Blocks (asynchronously) while the
    /// worker's queue is full.
    pub async fn submit(&self, handle: Handle, work: WorkFn) {
        // A send error means the worker is gone, which only happens after
        // finish(); nothing sensible left to do with the work.
        let _ = self.senders[handle.worker].send(WorkMsg::Work(work)).await;
    }

    /// Run every pending result closure on the calling task.
    pub fn pull_results(&self) {
        let receivers = self.receivers.lock().expect("io pool poisoned");
        for rx in receivers.iter() {
            while let Ok(ResultMsg::Done(f)) = rx.try_recv() {
                f();
            }
        }
    }

    /// Close every worker, run all outstanding result closures, and join the
    /// threads.
    pub async fn finish(mut self) {
        for tx in &self.senders {
            let _ = tx.send(WorkMsg::Close).await;
        }
        let receivers = std::mem::take(&mut *self.receivers.lock().expect("io pool poisoned"));
        let threads = std::mem::take(&mut self.threads);
        let drain = tokio::task::spawn_blocking(move || {
            for rx in &receivers {
                loop {
                    match rx.recv() {
                        Ok(ResultMsg::Done(f)) => f(),
                        Ok(ResultMsg::Closed) | Err(_) => break,
                    }
                }
            }
            for t in threads {
                let _ = t.join();
            }
        });
        let _ = drain.await;
    }
}

fn worker(mut work_rx: mpsc::Receiver<WorkMsg>, res_tx: std_mpsc::Sender<ResultMsg>) {
    while let Some(msg) = work_rx.blocking_recv() {
        match msg {
            WorkMsg::Work(f) => {
                if let Some(result) = f() {
                    let _ = res_tx.send(ResultMsg::Done(result));
                }
            }
            WorkMsg::Close => break,
        }
    }
    let _ = res_tx.send(ResultMsg::Closed);
}
