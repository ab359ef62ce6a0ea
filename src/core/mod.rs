pub mod batcher;
pub mod checkpoint;
pub mod dataset;
pub mod evaluator;
pub mod extractor;
pub mod head;
pub mod ingestion;
pub mod layers;
pub mod model;
pub mod pipeline;
pub mod restore;
pub mod schedule;
pub mod summary;
pub mod tower;
pub mod train;
pub mod train_config;

mod error;

pub use error::Error;
