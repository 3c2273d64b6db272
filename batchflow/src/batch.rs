//! Capacity-bounded batches and the keyed batcher that fills them.

use crate::BoxError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::hash::Hash;

#[derive(thiserror::Error, Debug)]
pub enum BatchError {
    #[error("the batch is full")]
    Full,
    #[error("the number of indices and values must be the same: {indices} != {values}")]
    LengthMismatch { indices: usize, values: usize },
    #[error("the capacities of the indices and values must be the same: {indices} != {values}")]
    CapacityMismatch { indices: usize, values: usize },
    #[error("batch capacity must be at least 1")]
    ZeroCapacity,
    #[error("error getting batch key: {0}")]
    Key(#[source] BoxError),
    #[error("error getting batch value: {0}")]
    Value(#[source] BoxError),
    #[error("error submitting batch: {0}")]
    Submit(#[source] BoxError),
}

/// An ordered, fixed-capacity list of values paired with the position each
/// value had in the original input.
#[derive(Debug, Clone)]
pub struct Batch<V> {
    indices: Vec<usize>,
    values: Vec<V>,
    // Fixed at construction.
    capacity: usize,
}

impl<V> Batch<V> {
    pub fn new(capacity: usize) -> Self {
        Batch {
            indices: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Builds a batch on top of existing parallel buffers.
    ///
    /// The reserved capacity of the buffers becomes the capacity of the batch,
    /// so both buffers must agree on length and on reserved capacity.
    pub fn from_parts(indices: Vec<usize>, values: Vec<V>) -> Result<Self, BatchError> {
        if indices.len() != values.len() {
            return Err(BatchError::LengthMismatch {
                indices: indices.len(),
                values: values.len(),
            });
        }
        if indices.capacity() != values.capacity() {
            return Err(BatchError::CapacityMismatch {
                indices: indices.capacity(),
                values: values.capacity(),
            });
        }

        let capacity = indices.capacity();
        Ok(Batch {
            indices,
            values,
            capacity,
        })
    }

    pub fn append(&mut self, index: usize, value: V) -> Result<(), BatchError> {
        if self.is_full() {
            return Err(BatchError::Full);
        }
        self.indices.push(index);
        self.values.push(value);
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties the batch while keeping its allocations for reuse.
    pub fn reset(&mut self) {
        self.indices.clear();
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn values(&self) -> &[V] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &V)> {
        self.indices.iter().copied().zip(self.values.iter())
    }

    pub fn into_parts(self) -> (Vec<usize>, Vec<V>) {
        (self.indices, self.values)
    }
}

// Capacity is left out so batches built different ways compare by content.
impl<V: PartialEq> PartialEq for Batch<V> {
    fn eq(&self, other: &Self) -> bool {
        self.indices == other.indices && self.values == other.values
    }
}

/// Receives every non-empty batch produced by a [`Batcher`].
#[async_trait]
pub trait BatchSubmitter<K, V>: Send
where
    K: Sync,
    V: Sync,
{
    async fn submit(&mut self, key: &K, batch: &Batch<V>) -> Result<(), BoxError>;
}

pub trait BatchKeyGetter<I, K>: Send + Sync {
    fn batch_key(&self, item: &I) -> Result<K, BoxError>;
}

pub trait BatchValueGetter<I, V>: Send + Sync {
    fn batch_value(&self, item: &I) -> Result<V, BoxError>;
}

/// Groups inputs into per-key batches of bounded size and hands each batch to
/// a submitter.
pub struct Batcher<S, KG, VG> {
    submitter: S,
    key_getter: KG,
    value_getter: VG,
    capacity: usize,
}

impl<S, KG, VG> Batcher<S, KG, VG> {
    pub fn new(
        submitter: S,
        key_getter: KG,
        value_getter: VG,
        capacity: usize,
    ) -> Result<Self, BatchError> {
        if capacity == 0 {
            return Err(BatchError::ZeroCapacity);
        }
        Ok(Batcher {
            submitter,
            key_getter,
            value_getter,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn submitter(&self) -> &S {
        &self.submitter
    }

    pub fn into_submitter(self) -> S {
        self.submitter
    }

    /// Partitions `items` by key and submits every batch.
    ///
    /// A batch is submitted as soon as it fills up, then reused for the same
    /// key. Leftover batches are submitted once the input is exhausted, in no
    /// particular order. The first failure aborts the whole call: batches
    /// already submitted stay submitted and buffered ones are dropped.
    pub async fn partition<I, K, V>(&mut self, items: &[I]) -> Result<(), BatchError>
    where
        I: Sync,
        K: Eq + Hash + Clone + Send + Sync,
        V: Send + Sync,
        S: BatchSubmitter<K, V>,
        KG: BatchKeyGetter<I, K>,
        VG: BatchValueGetter<I, V>,
    {
        let capacity = self.capacity;
        let mut batch_by_key: HashMap<K, Batch<V>> = HashMap::new();

        for (index, item) in items.iter().enumerate() {
            let key = self.key_getter.batch_key(item).map_err(BatchError::Key)?;
            let value = self
                .value_getter
                .batch_value(item)
                .map_err(BatchError::Value)?;

            let batch = batch_by_key
                .entry(key.clone())
                .or_insert_with(|| Batch::new(capacity));
            batch.append(index, value)?;

            if batch.is_full() {
                submit(&mut self.submitter, &key, batch).await?;
            }
        }

        for (key, batch) in batch_by_key.iter_mut() {
            submit(&mut self.submitter, key, batch).await?;
        }

        Ok(())
    }
}

async fn submit<S, K, V>(submitter: &mut S, key: &K, batch: &mut Batch<V>) -> Result<(), BatchError>
where
    S: BatchSubmitter<K, V>,
    K: Sync,
    V: Sync,
{
    if batch.is_empty() {
        return Ok(());
    }
    submitter
        .submit(key, batch)
        .await
        .map_err(BatchError::Submit)?;
    batch.reset();
    Ok(())
}
