//! Ordered, partitioned row log.
//!
//! Row events are appended to a partition named after the submitter and consumed
//! in append order. Ordering holds within a partition only.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::error::{BatchError, Result};
use crate::row::RowEvent;

/// Sink for row events.
#[async_trait]
pub trait RowEventLog: Send + Sync {
    /// Appends `event` to the end of `partition`.
    ///
    /// # Errors
    ///
    /// Returns an error if the event could not be accepted.
    async fn append(&self, partition: &str, event: RowEvent) -> Result<()>;
}

fn poison_err<T>(_: PoisonError<T>) -> BatchError {
    BatchError::log("row log lock poisoned")
}

/// In-memory partitioned log.
///
/// Not durable; for tests and local runs.
#[derive(Debug)]
pub struct PartitionedLog<T> {
    partitions: RwLock<BTreeMap<String, VecDeque<T>>>,
}

impl<T> Default for PartitionedLog<T> {
    fn default() -> Self {
        Self {
            partitions: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<T> PartitionedLog<T> {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an item to a partition.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn push(&self, partition: &str, item: T) -> Result<()> {
        self.partitions
            .write()
            .map_err(poison_err)?
            .entry(partition.to_string())
            .or_default()
            .push_back(item);
        Ok(())
    }

    /// Removes up to `max` items from the front of a partition.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn poll(&self, partition: &str, max: usize) -> Result<Vec<T>> {
        let mut partitions = self.partitions.write().map_err(poison_err)?;
        let Some(queue) = partitions.get_mut(partition) else {
            return Ok(Vec::new());
        };
        let take = max.min(queue.len());
        let items = queue.drain(..take).collect();
        if queue.is_empty() {
            partitions.remove(partition);
        }
        drop(partitions);
        Ok(items)
    }

    /// Names of partitions with pending items.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn partitions(&self) -> Result<Vec<String>> {
        Ok(self
            .partitions
            .read()
            .map_err(poison_err)?
            .keys()
            .cloned()
            .collect())
    }

    /// Total pending items.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self
            .partitions
            .read()
            .map_err(poison_err)?
            .values()
            .map(VecDeque::len)
            .sum())
    }

    /// Returns true if nothing is pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl RowEventLog for PartitionedLog<RowEvent> {
    async fn append(&self, partition: &str, event: RowEvent) -> Result<()> {
        self.push(partition, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_order_within_partition() {
        let log = PartitionedLog::new();
        for n in 0..5 {
            log.push("EMIS", n).unwrap();
        }
        log.push("TPP", 100).unwrap();

        assert_eq!(log.partitions().unwrap(), vec!["EMIS", "TPP"]);
        assert_eq!(log.poll("EMIS", 2).unwrap(), vec![0, 1]);
        assert_eq!(log.poll("EMIS", 10).unwrap(), vec![2, 3, 4]);
        assert!(log.poll("EMIS", 1).unwrap().is_empty());
        assert_eq!(log.len().unwrap(), 1);
        assert_eq!(log.poll("TPP", 1).unwrap(), vec![100]);
        assert!(log.is_empty().unwrap());
    }
}
