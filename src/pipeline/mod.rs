//! The ingestion-to-routing pipeline.

pub mod processor;

pub use processor::{Processor, ProcessorDeps};
