pub mod chunker;
pub mod extractors;
pub mod metadata;

pub use chunker::{Chunker, ChunkingStrategy, TextChunk};
pub use extractors::{Extractor, ExtractorRegistry};
pub use metadata::{ExtractedMetadata, MetadataExtractor, UserMetadata};
