use std::{marker::PhantomData, sync::Arc};

use burn::data::dataset::Dataset;

/// How a dataset is split across data-parallel ranks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShardMode {
    /// Rank `r` gets one contiguous block; earlier ranks take the remainder.
    Contiguous,
    /// Rank `r` gets indices `r, r + world, r + 2 * world, ...`.
    Strided,
}

/// One rank's view of a shared dataset.
pub struct ShardDataset<D, I> {
    inner: Arc<D>,
    mode: ShardMode,
    rank: usize,
    world: usize,
    _item: PhantomData<fn() -> I>,
}

impl<D: Dataset<I>, I> ShardDataset<D, I> {
    #[must_use]
    pub fn new(inner: Arc<D>, mode: ShardMode, rank: usize, world: usize) -> Self {
        assert!(world > 0 && rank < world, "rank {rank} out of range for world size {world}");
        Self {
            inner,
            mode,
            rank,
            world,
            _item: PhantomData,
        }
    }

    fn contiguous_start(&self) -> usize {
        let (base, rem) = (self.inner.len() / self.world, self.inner.len() % self.world);
        self.rank * base + self.rank.min(rem)
    }

    fn source_index(&self, index: usize) -> usize {
        match self.mode {
            ShardMode::Contiguous => self.contiguous_start() + index,
            ShardMode::Strided => self.rank + index * self.world,
        }
    }
}

impl<D: Dataset<I>, I: Send + Sync> Dataset<I> for ShardDataset<D, I> {
    fn get(&self, index: usize) -> Option<I> {
        if index >= self.len() {
            return None;
        }
        self.inner.get(self.source_index(index))
    }

    fn len(&self) -> usize {
        let n = self.inner.len();
        let (base, rem) = (n / self.world, n % self.world);
        base + usize::from(self.rank < rem)
    }
}
