//! Batch sources.
//!
//! The trainer only sees [`BatchSource`]: a finite, restartable sequence of padded
//! batches in either dataset order or a fresh shuffle. [`BatchLoader`] is the
//! reference implementation; it extracts features on a worker pool and keeps a
//! bounded number of batches ready on a background thread.

use crate::data::batch::{Batch, Example};
use crate::data::dataset::ExampleSource;
use crate::error::{AppError, Result};
use crossbeam::channel::{bounded, Receiver};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::debug;

/// Order in which a pass visits the dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOrder {
    /// Dataset order, identical on every pass.
    Sequential,
    /// A new permutation on every pass.
    Shuffled,
}

/// Iterator over one pass of batches.
pub type BatchIter<'a> = Box<dyn Iterator<Item = Result<Batch>> + 'a>;

/// Producer of padded batches.
pub trait BatchSource {
    /// Examples in one full pass.
    fn num_examples(&self) -> usize;

    /// Batches in one full pass.
    fn num_batches(&self) -> usize;

    /// Start a new pass.
    fn batches(&self, order: BatchOrder) -> BatchIter<'_>;
}

/// Loader settings.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub batch_size: usize,
    /// Threads used for per-example feature extraction.
    pub num_workers: usize,
    /// Batches buffered ahead of the consumer; 0 loads on the caller's thread.
    pub prefetch: usize,
    /// Seed for shuffled passes.
    pub seed: u64,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            batch_size: 64,
            num_workers: num_cpus::get(),
            prefetch: 2,
            seed: 0,
        }
    }
}

/// [`BatchSource`] over any [`ExampleSource`].
pub struct BatchLoader<D: ExampleSource + 'static> {
    dataset: Arc<D>,
    options: LoaderOptions,
    pool: Arc<rayon::ThreadPool>,
    shuffle_pass: AtomicU64,
}

impl<D: ExampleSource + 'static> BatchLoader<D> {
    pub fn new(dataset: Arc<D>, options: LoaderOptions) -> Result<Self> {
        if options.batch_size == 0 {
            return Err(AppError::Config("batch_size must be positive".to_string()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.num_workers.max(1))
            .thread_name(|i| format!("feature-worker-{}", i))
            .build()
            .map_err(|e| AppError::Internal(format!("cannot start feature workers: {}", e)))?;
        Ok(Self {
            dataset,
            options,
            pool: Arc::new(pool),
            shuffle_pass: AtomicU64::new(0),
        })
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    fn pass_indices(&self, order: BatchOrder) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if order == BatchOrder::Shuffled {
            let pass = self.shuffle_pass.fetch_add(1, Ordering::Relaxed);
            let mut rng = StdRng::seed_from_u64(self.options.seed.wrapping_add(pass));
            indices.shuffle(&mut rng);
        }
        indices
    }
}

impl<D: ExampleSource + 'static> BatchSource for BatchLoader<D> {
    fn num_examples(&self) -> usize {
        self.dataset.len()
    }

    fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.options.batch_size)
    }

    fn batches(&self, order: BatchOrder) -> BatchIter<'_> {
        let groups: Vec<Vec<usize>> = self
            .pass_indices(order)
            .chunks(self.options.batch_size)
            .map(|c| c.to_vec())
            .collect();
        debug!("Starting {:?} pass over {} batches", order, groups.len());

        if self.options.prefetch == 0 {
            let dataset = Arc::clone(&self.dataset);
            let pool = Arc::clone(&self.pool);
            return Box::new(
                groups
                    .into_iter()
                    .map(move |group| load_batch(&*dataset, &pool, &group)),
            );
        }

        let (tx, rx) = bounded(self.options.prefetch);
        let dataset = Arc::clone(&self.dataset);
        let pool = Arc::clone(&self.pool);
        let handle = std::thread::Builder::new()
            .name("batch-prefetch".to_string())
            .spawn(move || {
                for group in groups {
                    let batch = load_batch(&*dataset, &pool, &group);
                    let failed = batch.is_err();
                    if tx.send(batch).is_err() || failed {
                        break;
                    }
                }
            });

        match handle {
            Ok(handle) => Box::new(Prefetched {
                rx: Some(rx),
                handle: Some(handle),
            }),
            Err(e) => Box::new(std::iter::once(Err(AppError::Internal(format!(
                "cannot start prefetch thread: {}",
                e
            ))))),
        }
    }
}

fn load_batch<D: ExampleSource>(
    dataset: &D,
    pool: &rayon::ThreadPool,
    indices: &[usize],
) -> Result<Batch> {
    let examples: Vec<Example> = pool.install(|| {
        indices
            .par_iter()
            .map(|&i| dataset.get(i))
            .collect::<Result<Vec<_>>>()
    })?;
    Batch::collate(examples)
}

/// Receiving end of the prefetch thread.
struct Prefetched {
    rx: Option<Receiver<Result<Batch>>>,
    handle: Option<JoinHandle<()>>,
}

impl Iterator for Prefetched {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let rx = self.rx.as_ref()?;
        match rx.recv() {
            Ok(batch) => Some(batch),
            Err(_) => {
                self.rx = None;
                match self.handle.take().map(JoinHandle::join) {
                    Some(Err(_)) => Some(Err(AppError::Internal(
                        "batch prefetch thread panicked".to_string(),
                    ))),
                    _ => None,
                }
            }
        }
    }
}

impl Drop for Prefetched {
    fn drop(&mut self) {
        // Disconnect first so a producer blocked on a full channel wakes up.
        self.rx = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::InMemoryDataset;

    /// Example `i` has `i + 1` frames and the single label `i + 1`.
    fn dataset(n: usize) -> Arc<InMemoryDataset> {
        let pairs = (0..n)
            .map(|i| (vec![i as f32; i + 1], vec![i + 1]))
            .collect();
        Arc::new(InMemoryDataset::from_pairs(1, pairs).unwrap())
    }

    fn loader(n: usize, batch_size: usize, prefetch: usize) -> BatchLoader<InMemoryDataset> {
        BatchLoader::new(
            dataset(n),
            LoaderOptions {
                batch_size,
                num_workers: 2,
                prefetch,
                seed: 7,
            },
        )
        .unwrap()
    }

    fn labels_of(source: &dyn BatchSource, order: BatchOrder) -> Vec<usize> {
        let mut labels: Vec<usize> = Vec::new();
        for batch in source.batches(order) {
            let batch = batch.unwrap();
            let mut in_batch = batch.targets.clone();
            in_batch.sort_unstable();
            labels.extend(in_batch);
        }
        labels
    }

    #[test]
    fn test_batch_count_rounds_up() {
        let l = loader(10, 4, 0);
        assert_eq!(l.num_batches(), 3);
        assert_eq!(l.num_examples(), 10);
        assert_eq!(l.batches(BatchOrder::Sequential).count(), 3);
    }

    #[test]
    fn test_sequential_order_is_stable_with_and_without_prefetch() {
        let direct = loader(9, 3, 0);
        let prefetched = loader(9, 3, 2);
        let expected: Vec<usize> = (1..=9).collect();
        assert_eq!(labels_of(&direct, BatchOrder::Sequential), expected);
        assert_eq!(labels_of(&prefetched, BatchOrder::Sequential), expected);
        assert_eq!(labels_of(&prefetched, BatchOrder::Sequential), expected);
    }

    #[test]
    fn test_shuffled_pass_is_a_permutation_that_changes() {
        let l = loader(32, 4, 2);
        let first = labels_of(&l, BatchOrder::Shuffled);
        let second = labels_of(&l, BatchOrder::Shuffled);
        let mut sorted = first.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (1..=32).collect::<Vec<_>>());
        assert_ne!(first, second);
    }

    #[test]
    fn test_dropping_a_pass_early_does_not_hang() {
        let l = loader(50, 1, 1);
        let mut it = l.batches(BatchOrder::Sequential);
        assert!(it.next().unwrap().is_ok());
        drop(it);
    }

    struct Broken;

    impl ExampleSource for Broken {
        fn len(&self) -> usize {
            4
        }

        fn get(&self, index: usize) -> Result<Example> {
            Err(AppError::Audio(format!("clip {} unreadable", index)))
        }
    }

    #[test]
    fn test_example_error_surfaces_and_ends_pass() {
        let l = BatchLoader::new(
            Arc::new(Broken),
            LoaderOptions {
                batch_size: 2,
                num_workers: 1,
                prefetch: 2,
                seed: 0,
            },
        )
        .unwrap();
        let results: Vec<_> = l.batches(BatchOrder::Sequential).collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(AppError::Audio(_))));
    }
}
