//! Training data: manifests, examples, padded batches and batch sources.

mod batch;
mod dataset;
mod loader;

pub use batch::{Batch, Example};
pub use dataset::{
    parse_manifest, ExampleSource, InMemoryDataset, ManifestDataset, ManifestEntry,
};
pub use loader::{BatchIter, BatchLoader, BatchOrder, BatchSource, LoaderOptions};
