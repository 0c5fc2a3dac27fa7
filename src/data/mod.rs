//! Data references: stores, datasets, collections and run outputs.

pub mod dataset;
pub mod outputs;
pub mod store;

pub use dataset::{Data, Dataset, DatasetCollection, upload_datasets};
pub use outputs::Outputs;
pub use store::Datastore;
