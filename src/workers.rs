//! Fixed-concurrency task pool draining a priority and a normal queue.
//!
//! Downloads a reader is blocked on go through the priority queue; readahead
//! prefetches go through the normal queue. Every worker attempts a priority
//! dequeue first, so priority tasks preempt normal ones at the dequeue point.
//! Starvation of normal tasks is bounded only by the callers' priority
//! submission rate.
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::error::Error;

trait_set::trait_set! {
    /// Invoked by workers with each dequeued task.
    pub trait Dispatch<T> = Fn(T) -> BoxFuture<'static, ()> + Send + Sync + 'static;
}

struct Queues<T> {
    priority: mpsc::UnboundedReceiver<T>,
    normal: mpsc::UnboundedReceiver<T>,
}

struct Senders<T> {
    priority: mpsc::UnboundedSender<T>,
    normal: mpsc::UnboundedSender<T>,
}

pub struct WorkerPool<T: Send + 'static> {
    worker_count: usize,
    dispatch: Arc<dyn Dispatch<T>>,
    queues: Arc<tokio::sync::Mutex<Queues<T>>>,
    senders: parking_lot::Mutex<Option<Senders<T>>>,
    workers: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(worker_count: usize, dispatch: impl Dispatch<T>) -> Result<Self, Error> {
        if worker_count == 0 {
            return Err(Error::InvalidOptions("worker count must be >= 1"));
        }
        let (priority_tx, priority_rx) = mpsc::unbounded_channel();
        let (normal_tx, normal_rx) = mpsc::unbounded_channel();
        Ok(Self {
            worker_count,
            dispatch: Arc::new(dispatch),
            queues: Arc::new(tokio::sync::Mutex::new(Queues {
                priority: priority_rx,
                normal: normal_rx,
            })),
            senders: parking_lot::Mutex::new(Some(Senders {
                priority: priority_tx,
                normal: normal_tx,
            })),
            workers: parking_lot::Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Launch the workers on the given runtime. Idempotent.
    pub fn start(&self, handle: &tokio::runtime::Handle) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        for index in 0..self.worker_count {
            let queues = self.queues.clone();
            let dispatch = self.dispatch.clone();
            let cancel = self.cancel.clone();
            workers.push(handle.spawn(Self::worker_loop(index, queues, dispatch, cancel)));
        }
    }

    /// Enqueue a task. Fails once the pool is stopped.
    pub fn schedule(&self, priority: bool, task: T) -> Result<(), Error> {
        let senders = self.senders.lock();
        let Some(s) = senders.as_ref() else {
            return Err(Error::WorkersStopped);
        };
        let tx = if priority { &s.priority } else { &s.normal };
        tx.send(task).map_err(|_| Error::WorkersStopped)
    }

    /// Close both queues and join the workers. Pending tasks are dropped;
    /// in-flight tasks observe the cancellation they were scheduled with.
    pub async fn stop(&self) {
        self.senders.lock().take();
        self.cancel.cancel();
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for w in workers {
            let _ = w.await;
        }
        // Drop anything still queued, so tasks with drop-time cleanup run it
        // now rather than at pool teardown.
        let mut q = self.queues.lock().await;
        while q.priority.try_recv().is_ok() {}
        while q.normal.try_recv().is_ok() {}
    }

    async fn worker_loop(
        index: usize,
        queues: Arc<tokio::sync::Mutex<Queues<T>>>,
        dispatch: Arc<dyn Dispatch<T>>,
        cancel: CancellationToken,
    ) {
        loop {
            // Only the dequeue is serialized; the task itself runs with the
            // queues released.
            let task = {
                let mut q = queues.lock().await;
                let Queues { priority, normal } = &mut *q;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    t = priority.recv() => t,
                    t = normal.recv() => t,
                }
            };
            match task {
                Some(task) => dispatch(task).await,
                None => break,
            }
        }
        trace!(index, "worker exiting");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn priority_preempts_normal() {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<&'static str>();
        let (gate_tx, gate_rx) = tokio::sync::watch::channel(false);
        let pool = WorkerPool::new(1, move |task: (&'static str, bool)| {
            let done = done_tx.clone();
            let mut gate = gate_rx.clone();
            Box::pin(async move {
                if task.1 {
                    while !*gate.borrow_and_update() {
                        gate.changed().await.unwrap();
                    }
                }
                done.send(task.0).unwrap();
            }) as BoxFuture<'static, ()>
        })
        .unwrap();
        pool.start(&tokio::runtime::Handle::current());

        // The gate task occupies the single worker while the queues fill up.
        pool.schedule(false, ("gate", true)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.schedule(false, ("normal", false)).unwrap();
        pool.schedule(true, ("priority", false)).unwrap();
        gate_tx.send(true).unwrap();

        assert_eq!(done_rx.recv().await.unwrap(), "gate");
        assert_eq!(done_rx.recv().await.unwrap(), "priority");
        assert_eq!(done_rx.recv().await.unwrap(), "normal");
        pool.stop().await;
    }

    #[tokio::test]
    async fn stop_rejects_further_tasks() {
        let pool = WorkerPool::new(2, |_: ()| Box::pin(async {}) as BoxFuture<'static, ()>).unwrap();
        pool.start(&tokio::runtime::Handle::current());
        pool.schedule(true, ()).unwrap();
        pool.stop().await;
        assert!(matches!(pool.schedule(false, ()), Err(Error::WorkersStopped)));
    }

    #[test]
    fn zero_workers_is_invalid() {
        assert!(WorkerPool::new(0, |_: ()| Box::pin(async {}) as BoxFuture<'static, ()>).is_err());
    }
}
