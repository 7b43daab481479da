pub mod processor;

pub use processor::{DocumentProcessor, ProcessedDocument};
