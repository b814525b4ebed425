//! Bounded item queue with backpressure connecting adjacent stages.
//!
//! ```text
//!   QueueWriter ──▶ [bounded FIFO, `capacity` items] ──▶ QueueReader
//!   (cloneable)     ├── writer blocks when full (backpressure)
//!                   ├── reader blocks when empty
//!                   ├── last writer dropped → end-of-stream after drain
//!                   └── reader dropped → writers get `QueueClosed`
//! ```
//!
//! Writers are cloneable because a fan-out stage hands one to every per-item
//! sub-task. The queue closes only when the stage and all of its sub-tasks
//! have let go of their handles.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::mpsc;

/// Capacity shared by every queue in a pipeline unless configured otherwise.
pub const QUEUE_CAPACITY: usize = 100;

/// The reading end has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("queue closed")]
pub struct QueueClosed;

/// Traffic counters shared by both ends.
#[derive(Debug, Default)]
pub struct QueueStats {
    sent: AtomicU64,
    received: AtomicU64,
}

impl QueueStats {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

/// Writing end of a queue.
pub struct QueueWriter<T> {
    sender: mpsc::Sender<T>,
    stats: Arc<QueueStats>,
}

/// Reading end of a queue.
pub struct QueueReader<T> {
    receiver: mpsc::Receiver<T>,
    stats: Arc<QueueStats>,
}

/// Create a bounded queue. A capacity of zero is treated as one.
pub fn item_queue<T>(capacity: usize) -> (QueueWriter<T>, QueueReader<T>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let stats = Arc::new(QueueStats::default());
    (
        QueueWriter {
            sender,
            stats: stats.clone(),
        },
        QueueReader { receiver, stats },
    )
}

impl<T> QueueWriter<T> {
    /// Push an item, waiting while the queue is full.
    pub async fn send(&self, item: T) -> Result<(), QueueClosed> {
        self.sender.send(item).await.map_err(|_| QueueClosed)?;
        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// True once the reader has been dropped.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Configured capacity of the queue.
    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    /// Give up this handle. The queue closes when the last handle is gone.
    pub fn close(self) {}
}

impl<T> Clone for QueueWriter<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<T> QueueReader<T> {
    /// Pop the next item. `None` means every writer is gone and the buffer
    /// is drained.
    pub async fn recv(&mut self) -> Option<T> {
        let item = self.receiver.recv().await?;
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        Some(item)
    }

    /// Read everything until end-of-stream.
    pub async fn drain(mut self) -> Vec<T> {
        let mut items = Vec::new();
        while let Some(item) = self.recv().await {
            items.push(item);
        }
        items
    }

    /// Number of items currently buffered.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }
}

impl<T> std::fmt::Debug for QueueWriter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueWriter")
            .field("capacity", &self.capacity())
            .field("sent", &self.stats.sent())
            .finish()
    }
}

impl<T> std::fmt::Debug for QueueReader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueReader")
            .field("buffered", &self.len())
            .field("received", &self.stats.received())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_then_end_of_stream() {
        let (writer, reader) = item_queue(8);
        for i in 0..5 {
            writer.send(i).await.unwrap();
        }
        writer.close();

        assert_eq!(reader.drain().await, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_stays_open_while_any_clone_lives() {
        let (writer, mut reader) = item_queue(4);
        let clone = writer.clone();
        drop(writer);

        clone.send("late").await.unwrap();
        assert_eq!(reader.recv().await, Some("late"));

        drop(clone);
        assert_eq!(reader.recv().await, None);
    }

    #[tokio::test]
    async fn test_writer_blocks_when_full() {
        let (writer, mut reader) = item_queue(2);
        writer.send(1).await.unwrap();
        writer.send(2).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), writer.send(3)).await;
        assert!(blocked.is_err(), "third send should wait for space");

        assert_eq!(reader.recv().await, Some(1));
        tokio::time::timeout(Duration::from_secs(1), writer.send(3))
            .await
            .expect("send should proceed after a read")
            .unwrap();
    }

    #[tokio::test]
    async fn test_reader_blocks_when_empty_and_open() {
        let (writer, mut reader) = item_queue::<u8>(2);
        let waited = tokio::time::timeout(Duration::from_millis(50), reader.recv()).await;
        assert!(waited.is_err());
        drop(writer);
    }

    #[tokio::test]
    async fn test_send_after_reader_dropped() {
        let (writer, reader) = item_queue(2);
        drop(reader);
        assert!(writer.is_closed());
        assert_eq!(writer.send(1).await, Err(QueueClosed));
    }

    #[tokio::test]
    async fn test_zero_capacity_is_one() {
        let (writer, reader) = item_queue(0);
        assert_eq!(writer.capacity(), 1);
        writer.send('x').await.unwrap();
        drop(writer);
        assert_eq!(reader.drain().await, vec!['x']);
    }

    #[tokio::test]
    async fn test_stats_track_traffic() {
        let (writer, mut reader) = item_queue(4);
        writer.send(1).await.unwrap();
        writer.send(2).await.unwrap();
        reader.recv().await;
        assert_eq!(writer.stats().sent(), 2);
        assert_eq!(reader.stats().received(), 1);
        assert_eq!(reader.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_producer_consumer_through_small_buffer() {
        let items = tokio::time::timeout(Duration::from_secs(5), async {
            let (writer, reader) = item_queue(3);
            let producer = tokio::spawn(async move {
                for i in 0..1000u32 {
                    writer.send(i).await.unwrap();
                }
            });
            let items = reader.drain().await;
            producer.await.unwrap();
            items
        })
        .await
        .expect("queue stress test timed out");

        assert_eq!(items.len(), 1000);
        assert!(items.windows(2).all(|w| w[0] < w[1]));
    }
}
