//! Bounded FIFO batch queues
//!
//! Two of these connect the pipeline tasks: pending batches (read → score)
//! and scored batches (score → write). Producers block when the queue is
//! full; nothing is ever dropped or overwritten. Consumers only ever try-pop
//! so a task tick never stalls on an empty queue.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

/// Queue closed: the other half was dropped during shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

impl std::fmt::Display for QueueClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Queue closed")
    }
}

impl std::error::Error for QueueClosed {}

/// Create a bounded queue holding at most `capacity` items
///
/// Panics if `capacity` is 0 (rejected earlier by `PipelineConfig::validate`).
pub fn bounded<T>(name: &'static str, capacity: usize) -> (QueueProducer<T>, QueueConsumer<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        QueueProducer { name, tx },
        QueueConsumer { name, rx },
    )
}

/// Sending half; ownership of each pushed item moves to the consumer
#[derive(Debug)]
pub struct QueueProducer<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
}

impl<T> Clone for QueueProducer<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
        }
    }
}

impl<T> QueueProducer<T> {
    /// Push one item, waiting while the queue is full
    pub async fn push(&self, item: T) -> Result<(), QueueClosed> {
        if self.tx.capacity() == 0 {
            log::warn!(
                "⏳ Queue '{}' full ({}/{}), producer waiting",
                self.name,
                self.len(),
                self.capacity()
            );
        }

        self.tx.send(item).await.map_err(|_| QueueClosed)
    }

    /// Items currently queued
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Receiving half, owned by exactly one consuming task
#[derive(Debug)]
pub struct QueueConsumer<T> {
    name: &'static str,
    rx: mpsc::Receiver<T>,
}

impl<T> QueueConsumer<T> {
    /// Pop the oldest item without waiting
    ///
    /// Returns `Ok(None)` when the queue is empty.
    pub fn try_pop(&mut self) -> Result<Option<T>, QueueClosed> {
        match self.rx.try_recv() {
            Ok(item) => Ok(Some(item)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(QueueClosed),
        }
    }

    /// Pop the oldest item, waiting until one arrives
    pub async fn pop(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let (tx, mut rx) = bounded("test", 4);
        for i in 0..3 {
            tx.push(vec![i]).await.unwrap();
        }

        assert_eq!(rx.len(), 3);
        assert_eq!(rx.try_pop().unwrap(), Some(vec![0]));
        assert_eq!(rx.try_pop().unwrap(), Some(vec![1]));
        assert_eq!(rx.try_pop().unwrap(), Some(vec![2]));
        assert_eq!(rx.try_pop().unwrap(), None);
    }

    #[tokio::test]
    async fn test_full_queue_blocks_producer() {
        let (tx, mut rx) = bounded("test", 2);
        tx.push(1).await.unwrap();
        tx.push(2).await.unwrap();
        assert_eq!(tx.len(), 2);

        // Third push must wait, not drop or overwrite
        let blocked = tokio::time::timeout(Duration::from_millis(50), tx.push(3)).await;
        assert!(blocked.is_err(), "push into a full queue should block");
        assert_eq!(rx.len(), 2);

        // Draining one slot lets the producer through
        let producer = tx.clone();
        let handle = tokio::spawn(async move { producer.push(3).await });
        assert_eq!(rx.pop().await, Some(1));
        handle.await.unwrap().unwrap();

        assert_eq!(rx.try_pop().unwrap(), Some(2));
        assert_eq!(rx.try_pop().unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_closed_queue() {
        let (tx, mut rx) = bounded::<u8>("test", 1);
        drop(tx);
        assert_eq!(rx.try_pop(), Err(QueueClosed));

        let (tx, rx) = bounded::<u8>("test", 1);
        drop(rx);
        assert_eq!(tx.push(1).await, Err(QueueClosed));
    }
}
