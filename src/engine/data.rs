//! Batch sources consumed by an engine

use std::iter::Fuse;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::Result;
use crate::model::Batch;

/// Iterator over the batches of one pass
pub type BatchIter<'a> = Box<dyn Iterator<Item = Result<Batch>> + 'a>;

/// A sequence of batches, possibly restartable
pub trait DataSource: Send {
    /// Begin one pass over the source
    fn epoch(&mut self) -> Result<BatchIter<'_>>;

    /// Number of batches a pass yields, when known
    fn len_hint(&self) -> Option<usize> {
        None
    }
}

/// Restartable source over batches held in memory
pub struct InMemorySource {
    batches: Vec<Batch>,
    rng: Option<StdRng>,
}

impl InMemorySource {
    /// Source yielding `batches` in order every epoch
    pub fn new(batches: Vec<Batch>) -> Self {
        Self { batches, rng: None }
    }

    /// Source reshuffling `batches` at the start of every epoch
    pub fn shuffled(batches: Vec<Batch>, seed: u64) -> Self {
        Self {
            batches,
            rng: Some(StdRng::seed_from_u64(seed)),
        }
    }

    /// Number of batches
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// Whether there are no batches
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

impl DataSource for InMemorySource {
    fn epoch(&mut self) -> Result<BatchIter<'_>> {
        if let Some(rng) = self.rng.as_mut() {
            self.batches.shuffle(rng);
        }
        Ok(Box::new(self.batches.iter().cloned().map(Ok)))
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.batches.len())
    }
}

/// Source over a one-shot iterator
///
/// Epochs share the iterator: an epoch capped by `epoch_length` leaves the
/// remaining batches to the next one, and once the iterator is exhausted
/// every further epoch is empty.
pub struct IterSource<I> {
    inner: Fuse<I>,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = Result<Batch>> + Send,
{
    /// Wrap a fallible batch iterator
    pub fn new(iter: I) -> Self {
        Self { inner: iter.fuse() }
    }
}

impl<I> DataSource for IterSource<I>
where
    I: Iterator<Item = Result<Batch>> + Send,
{
    fn epoch(&mut self) -> Result<BatchIter<'_>> {
        Ok(Box::new(self.inner.by_ref()))
    }

    fn len_hint(&self) -> Option<usize> {
        self.inner.size_hint().1
    }
}
