//! Size/latency-bounded accumulator.
//!
//! Items pushed into a [`Batcher`] are handed to the flush callback in
//! groups: a group closes as soon as it reaches `max_size` items or
//! `max_latency` after its first item, whichever comes first. The task
//! worker uses one to collapse task resolutions into grouped
//! `resolve_tasks` round-trips.

use std::mem;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

/// Callback invoked with each closed group. Runs on the batcher's own task,
/// so a slow flush delays the next group rather than the pushers.
pub type FlushFn<T> = Box<dyn FnMut(Vec<T>) -> BoxFuture<'static, ()> + Send>;

enum BatchMsg<T> {
    Item(T),
    Flush(oneshot::Sender<()>),
}

/// Accumulates items and flushes them in bounded groups.
pub struct Batcher<T> {
    tx: mpsc::UnboundedSender<BatchMsg<T>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> Batcher<T> {
    pub fn new(max_size: usize, max_latency: Duration, flush: FlushFn<T>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run(rx, max_size.max(1), max_latency, flush));
        Self {
            tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueue an item. Never blocks; items pushed after [`Batcher::close`]
    /// are dropped.
    pub fn push(&self, item: T) {
        if self.tx.send(BatchMsg::Item(item)).is_err() {
            warn!("batcher is closed, dropping item");
        }
    }

    /// Flush everything buffered so far and wait for the flush callback to
    /// finish.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(BatchMsg::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Flush, then shut the background task down.
    pub async fn close(&self) {
        self.flush().await;
        let handle = {
            let mut guard = match self.worker.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

async fn run<T>(
    mut rx: mpsc::UnboundedReceiver<BatchMsg<T>>,
    max_size: usize,
    max_latency: Duration,
    mut flush: FlushFn<T>,
) {
    let mut buf: Vec<T> = Vec::new();
    loop {
        // Wait for the first message of a group.
        let first = match rx.recv().await {
            Some(msg) => msg,
            None => break,
        };
        let mut acks: Vec<oneshot::Sender<()>> = Vec::new();
        match first {
            BatchMsg::Item(item) => buf.push(item),
            BatchMsg::Flush(ack) => {
                if !buf.is_empty() {
                    flush(mem::take(&mut buf)).await;
                }
                let _ = ack.send(());
                continue;
            }
        }

        // Accumulate until the group is full, the latency window closes,
        // or an explicit flush arrives.
        let window = tokio::time::sleep(max_latency);
        tokio::pin!(window);
        while buf.len() < max_size {
            tokio::select! {
                _ = &mut window => break,
                msg = rx.recv() => match msg {
                    Some(BatchMsg::Item(item)) => buf.push(item),
                    Some(BatchMsg::Flush(ack)) => {
                        acks.push(ack);
                        break;
                    }
                    None => break,
                },
            }
        }

        flush(mem::take(&mut buf)).await;
        for ack in acks {
            let _ = ack.send(());
        }
    }

    if !buf.is_empty() {
        flush(buf).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex as AsyncMutex;

    fn collecting_batcher(
        max_size: usize,
        max_latency: Duration,
    ) -> (Batcher<i64>, Arc<AsyncMutex<Vec<Vec<i64>>>>) {
        let groups: Arc<AsyncMutex<Vec<Vec<i64>>>> = Arc::new(AsyncMutex::new(Vec::new()));
        let sink = Arc::clone(&groups);
        let batcher = Batcher::new(
            max_size,
            max_latency,
            Box::new(move |group| {
                let sink = Arc::clone(&sink);
                Box::pin(async move {
                    sink.lock().await.push(group);
                })
            }),
        );
        (batcher, groups)
    }

    #[tokio::test]
    async fn flushes_when_the_group_is_full() {
        let (batcher, groups) = collecting_batcher(3, Duration::from_secs(60));
        for i in 0..3 {
            batcher.push(i);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let groups = groups.lock().await;
        assert_eq!(groups.as_slice(), &[vec![0, 1, 2]]);
    }

    #[tokio::test]
    async fn flushes_when_the_latency_window_closes() {
        let (batcher, groups) = collecting_batcher(100, Duration::from_millis(30));
        batcher.push(1);
        batcher.push(2);
        tokio::time::sleep(Duration::from_millis(120)).await;

        let groups = groups.lock().await;
        assert_eq!(groups.as_slice(), &[vec![1, 2]]);
    }

    #[tokio::test]
    async fn explicit_flush_drains_and_waits() {
        let (batcher, groups) = collecting_batcher(100, Duration::from_secs(60));
        batcher.push(7);
        batcher.flush().await;

        let groups = groups.lock().await;
        assert_eq!(groups.as_slice(), &[vec![7]]);
    }

    #[tokio::test]
    async fn flush_on_empty_buffer_is_a_no_op() {
        let (batcher, groups) = collecting_batcher(10, Duration::from_secs(60));
        batcher.flush().await;
        assert!(groups.lock().await.is_empty());
    }

    #[tokio::test]
    async fn oversized_bursts_split_into_bounded_groups() {
        let (batcher, groups) = collecting_batcher(5, Duration::from_millis(30));
        for i in 0..12 {
            batcher.push(i);
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        let groups = groups.lock().await;
        let total: usize = groups.iter().map(Vec::len).sum();
        assert_eq!(total, 12);
        assert!(groups.iter().all(|g| g.len() <= 5));
    }
}
